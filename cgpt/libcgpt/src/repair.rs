// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reconciliation of the two GPT copies.

use crate::{
    check::entries_crc,
    layout::{GPT_HEADER_SECTORS, GPT_PMBR_SECTORS},
    CopyMask, GptCopy, GptData, Modified,
};
use zerocopy::AsBytes;

fn header_bit(copy: GptCopy) -> Modified {
    match copy {
        GptCopy::Primary => Modified::HEADER1,
        GptCopy::Secondary => Modified::HEADER2,
    }
}

fn entries_bit(copy: GptCopy) -> Modified {
    match copy {
        GptCopy::Primary => Modified::ENTRIES1,
        GptCopy::Secondary => Modified::ENTRIES2,
    }
}

impl GptData<'_> {
    /// Rewrites the invalid header copy from the valid one.
    ///
    /// When both copies are valid but not synonymous, the synonymous fields of the primary are
    /// copied into the secondary. A copy marked ignored is never written. Returns the header bits
    /// that changed; CRCs are left to [GptData::update_crc].
    pub fn repair_header(&mut self, valid: CopyMask) -> Modified {
        let ignored = self.ignored;
        if valid == CopyMask::BOTH {
            if self.primary_header.is_synonymous(&*self.secondary_header) {
                return Modified::empty();
            }
            gpt_println!(self, "Syncing the secondary GPT header geometry from the primary");
            self.secondary_header.copy_synonymous_from(&*self.primary_header);
            return Modified::HEADER2;
        }

        if valid == CopyMask::PRIMARY && !ignored.contains(CopyMask::SECONDARY) {
            gpt_println!(self, "Restoring the secondary GPT header from the primary");
            let my_lba = self.gpt_drive_sectors.saturating_sub(GPT_HEADER_SECTORS);
            let h = &mut *self.secondary_header;
            *h = *self.primary_header;
            h.my_lba = my_lba;
            h.alternate_lba = GPT_PMBR_SECTORS;
            h.entries_lba = my_lba.saturating_sub(h.entries_sectors());
            return Modified::HEADER2;
        }

        if valid == CopyMask::SECONDARY && !ignored.contains(CopyMask::PRIMARY) {
            gpt_println!(self, "Restoring the primary GPT header from the secondary");
            let alternate_lba = self.gpt_drive_sectors.saturating_sub(GPT_HEADER_SECTORS);
            let h = &mut *self.primary_header;
            *h = *self.secondary_header;
            h.my_lba = GPT_PMBR_SECTORS;
            h.alternate_lba = alternate_lba;
            h.entries_lba = GPT_PMBR_SECTORS + GPT_HEADER_SECTORS;
            return Modified::HEADER1;
        }
        Modified::empty()
    }

    /// Rewrites the invalid entries copy from the valid one, or the secondary from the primary
    /// when both are valid but differ. Returns the entries bits that changed.
    pub fn repair_entries(&mut self, valid: CopyMask) -> Modified {
        let (src, dst) = match valid {
            v if v == CopyMask::BOTH => (GptCopy::Primary, GptCopy::Secondary),
            v if v == CopyMask::PRIMARY => (GptCopy::Primary, GptCopy::Secondary),
            v if v == CopyMask::SECONDARY => (GptCopy::Secondary, GptCopy::Primary),
            _ => return Modified::empty(),
        };
        if self.ignored.contains(dst.mask()) {
            return Modified::empty();
        }

        let declared = usize::try_from(self.header(src).number_of_entries).unwrap_or(usize::MAX);
        let count = declared.min(self.primary_entries.len()).min(self.secondary_entries.len());
        let (from, to) = match src {
            GptCopy::Primary => (&*self.primary_entries, &mut *self.secondary_entries),
            _ => (&*self.secondary_entries, &mut *self.primary_entries),
        };
        if valid == CopyMask::BOTH && from[..count].as_bytes() == to[..count].as_bytes() {
            return Modified::empty();
        }
        to[..count].copy_from_slice(&from[..count]);
        gpt_println!(self, "Restored the {} GPT entries from the {} copy", dst, src);
        entries_bit(dst)
    }

    /// Refreshes the CRCs of every buffer marked in [GptData::modified].
    ///
    /// A modified entries array updates its header's entries CRC; the header is marked modified
    /// if the value changed. Header CRCs are then recomputed.
    pub fn update_crc(&mut self) {
        for copy in [GptCopy::Primary, GptCopy::Secondary] {
            if self.modified.contains(entries_bit(copy)) {
                let crc = entries_crc(self.entries(copy), self.header(copy));
                match crc {
                    Some(v) if v != self.header(copy).entries_crc32 => {
                        self.header_mut(copy).entries_crc32 = v;
                        self.modified |= header_bit(copy);
                    }
                    _ => {}
                }
            }
            if self.modified.contains(header_bit(copy)) {
                self.header_mut(copy).update_crc();
            }
        }
    }

    /// Makes both copies valid and identical from whatever [GptData::sanity_check] found usable.
    ///
    /// Does nothing if no header or no entries copy is valid. Afterwards both copies (minus the
    /// ignored ones) are considered valid.
    pub fn gpt_repair(&mut self) {
        if self.valid_headers.is_empty() || self.valid_entries.is_empty() {
            return;
        }
        let headers = self.valid_headers;
        let repaired = self.repair_header(headers);
        self.modified |= repaired;
        let entries = self.valid_entries;
        let repaired = self.repair_entries(entries);
        self.modified |= repaired;
        self.update_crc();

        let all = CopyMask::BOTH.difference(self.ignored);
        self.valid_headers = all;
        self.valid_entries = all;
    }

    /// Propagates in-place edits of the primary copy.
    ///
    /// Intended for tooling that edited the primary header or entries directly: refreshes the
    /// primary CRCs, then treats the primary as the only valid copy and repairs the secondary
    /// from it.
    pub fn sync_from_primary(&mut self) {
        self.modified |= Modified::HEADER1 | Modified::ENTRIES1;
        self.update_crc();
        self.valid_headers = CopyMask::PRIMARY;
        self.valid_entries = CopyMask::PRIMARY;
        self.gpt_repair();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        check::{check_entries, check_header},
        layout::{GPT_HEADER_SIGNATURE_IGNORED, MIN_SIZE_OF_HEADER},
        test::{TestGpt, DRIVE_SECTORS, KERNEL_A, KERNEL_Y},
        GptFlags,
    };

    fn is_valid(gpt: &GptData, copy: GptCopy) -> bool {
        let valid_header = check_header(
            gpt.header(copy),
            copy,
            DRIVE_SECTORS,
            DRIVE_SECTORS,
            GptFlags::empty(),
        )
        .is_ok();
        valid_header && check_entries(gpt.entries(copy), gpt.header(copy)).is_ok()
    }

    #[test]
    fn test_corrupted_header_byte_is_healed() {
        let reference = TestGpt::new();
        for copy in [GptCopy::Primary, GptCopy::Secondary] {
            for i in 0..usize::try_from(MIN_SIZE_OF_HEADER).unwrap() {
                let mut t = TestGpt::new();
                match copy {
                    GptCopy::Primary => t.h1[i] ^= 0x55,
                    _ => t.h2[i] ^= 0x55,
                }
                let mut gpt = t.gpt_data();
                assert_eq!(gpt.sanity_check(), Ok(()), "{} byte {}", copy, i);
                assert_eq!(gpt.valid_headers(), copy.other().mask(), "{} byte {}", copy, i);
                gpt.gpt_repair();
                assert_eq!(gpt.modified(), header_bit(copy), "{} byte {}", copy, i);
                assert!(is_valid(&gpt, GptCopy::Primary));
                assert!(is_valid(&gpt, GptCopy::Secondary));
                drop(gpt);
                assert_eq!(t.h1, reference.h1, "{} byte {}", copy, i);
                assert_eq!(t.h2, reference.h2, "{} byte {}", copy, i);
            }
        }
    }

    #[test]
    fn test_corrupted_entries_are_healed() {
        let reference = TestGpt::new();
        for copy in [GptCopy::Primary, GptCopy::Secondary] {
            let mut t = TestGpt::new();
            match copy {
                GptCopy::Primary => t.e1[300] ^= 0x01,
                _ => t.e2[10000] ^= 0x80,
            }
            let mut gpt = t.gpt_data();
            assert_eq!(gpt.init(), Ok(()));
            assert_eq!(gpt.modified(), entries_bit(copy));
            assert_eq!(gpt.valid_entries(), CopyMask::BOTH);
            drop(gpt);
            assert_eq!(t.e1, reference.e1);
            assert_eq!(t.e2, reference.e2);
        }
    }

    #[test]
    fn test_primary_wins_non_synonymous_headers() {
        let mut t = TestGpt::new();
        t.h2().first_usable_lba = 35;
        t.refresh_crc32();
        let mut gpt = t.gpt_data();
        assert_eq!(gpt.repair_header(CopyMask::BOTH), Modified::HEADER2);
        assert_eq!({ gpt.header(GptCopy::Secondary).first_usable_lba }, 34);
        assert_eq!({ gpt.header(GptCopy::Secondary).my_lba }, DRIVE_SECTORS - 1);
        assert_eq!(gpt.repair_header(CopyMask::BOTH), Modified::empty());
    }

    #[test]
    fn test_init_primary_wins_non_synonymous_headers() {
        let mut t = TestGpt::new();
        t.h1().last_usable_lba = 432;
        t.refresh_crc32();
        let mut gpt = t.gpt_data();
        assert_eq!(gpt.init(), Ok(()));
        assert_eq!(gpt.modified(), Modified::HEADER2);
        assert_eq!({ gpt.header(GptCopy::Secondary).last_usable_lba }, 432);
        assert!(is_valid(&gpt, GptCopy::Secondary));
    }

    #[test]
    fn test_repair_entries_both_valid_identical() {
        let mut t = TestGpt::new();
        let mut gpt = t.gpt_data();
        assert_eq!(gpt.repair_entries(CopyMask::BOTH), Modified::empty());
        assert_eq!(gpt.repair_entries(CopyMask::empty()), Modified::empty());
    }

    #[test]
    fn test_repair_entries_both_valid_different() {
        let mut t = TestGpt::new();
        t.e2()[KERNEL_Y].set_priority(9);
        let mut gpt = t.gpt_data();
        assert_eq!(gpt.repair_entries(CopyMask::BOTH), Modified::ENTRIES2);
        assert_eq!(gpt.entries(GptCopy::Secondary)[KERNEL_Y].priority(), 0);
    }

    #[test]
    fn test_ignored_copy_is_not_repaired() {
        let mut t = TestGpt::new();
        t.h2().signature = *GPT_HEADER_SIGNATURE_IGNORED;
        t.refresh_crc32();
        t.e2[0] ^= 0xff;
        let (h2, e2) = (t.h2, t.e2.clone());
        let mut gpt = t.gpt_data();
        assert_eq!(gpt.init(), Ok(()));
        assert_eq!(gpt.modified(), Modified::empty());
        assert_eq!(gpt.valid_headers(), CopyMask::PRIMARY);
        assert_eq!(gpt.valid_entries(), CopyMask::PRIMARY);
        drop(gpt);
        assert_eq!(t.h2, h2);
        assert_eq!(t.e2, e2);
    }

    #[test]
    fn test_update_crc_marks_header() {
        let mut t = TestGpt::new();
        let mut gpt = t.gpt_data();
        gpt.entries_mut(GptCopy::Primary)[KERNEL_A].set_priority(5);
        gpt.modified = Modified::ENTRIES1;
        gpt.update_crc();
        assert_eq!(gpt.modified(), Modified::ENTRIES1 | Modified::HEADER1);
        assert!(is_valid(&gpt, GptCopy::Primary));

        // Unchanged entries leave the header alone.
        gpt.modified = Modified::ENTRIES2;
        gpt.update_crc();
        assert_eq!(gpt.modified(), Modified::ENTRIES2);
    }

    #[test]
    fn test_gpt_repair_needs_valid_copies() {
        let mut t = TestGpt::new();
        let mut gpt = t.gpt_data();
        gpt.valid_headers = CopyMask::PRIMARY;
        gpt.gpt_repair();
        assert_eq!(gpt.modified(), Modified::empty());
        assert_eq!(gpt.valid_headers(), CopyMask::PRIMARY);
    }

    #[test]
    fn test_sync_from_primary() {
        let mut t = TestGpt::new();
        let mut gpt = t.gpt_data();
        gpt.init().unwrap();
        gpt.entries_mut(GptCopy::Primary)[KERNEL_A].set_tries(3);
        gpt.header_mut(GptCopy::Primary).last_usable_lba = 432;
        gpt.sync_from_primary();
        assert_eq!(
            gpt.modified(),
            Modified::HEADER1 | Modified::HEADER2 | Modified::ENTRIES1 | Modified::ENTRIES2
        );
        assert_eq!(gpt.entries(GptCopy::Secondary)[KERNEL_A].tries(), 3);
        assert_eq!({ gpt.header(GptCopy::Secondary).last_usable_lba }, 432);
        assert_eq!(gpt.sanity_check(), Ok(()));
        assert_eq!(gpt.valid_headers(), CopyMask::BOTH);
        assert_eq!(gpt.valid_entries(), CopyMask::BOTH);
    }
}
