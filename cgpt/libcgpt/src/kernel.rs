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

//! Kernel selection state machine over the ChromeOS kernel attributes.

use crate::{layout::EntryAttributes, GptData, Modified};
use liberror::{Error, Result};

/// Attribute update applied to the selected kernel entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateType {
    /// A boot attempt is starting. Consumes one try unless the kernel is known good.
    Try,
    /// The kernel failed to boot. Demotes it unless it is known good.
    Bad,
    /// Marks a freshly installed kernel as known good at the lowest bootable priority.
    Reset,
    /// Clears priority, tries and the successful flag.
    Invalidate,
}

impl From<UpdateType> for u32 {
    fn from(val: UpdateType) -> Self {
        match val {
            UpdateType::Try => 1,
            UpdateType::Bad => 2,
            UpdateType::Reset => 3,
            UpdateType::Invalidate => 4,
        }
    }
}

// Conversion from the raw codes used by callers across an ABI.
impl TryFrom<u32> for UpdateType {
    type Error = Error;

    fn try_from(val: u32) -> Result<UpdateType> {
        match val {
            v if v == UpdateType::Try.into() => Ok(UpdateType::Try),
            v if v == UpdateType::Bad.into() => Ok(UpdateType::Bad),
            v if v == UpdateType::Reset.into() => Ok(UpdateType::Reset),
            v if v == UpdateType::Invalidate.into() => Ok(UpdateType::Invalidate),
            _ => Err(Error::InvalidUpdateType),
        }
    }
}

impl GptData<'_> {
    /// Selects the next kernel to try and returns its `(starting_lba, size_in_sectors)`.
    ///
    /// Kernels sharing the current priority are returned in index order before moving down to
    /// the next lower priority. Priority 0 is never selected. Once candidates are exhausted every
    /// call fails with `NoValidKernel` until [GptData::init] is called again.
    pub fn next_kernel_entry(&mut self) -> Result<(u64, u64)> {
        let count = self.entry_count();
        let priority = self.current_priority;
        let entries = &self.entries(self.authoritative_copy())[..count];

        // Same tier, after the current kernel.
        let same_tier = self.current_kernel.and_then(|cur| {
            entries
                .iter()
                .enumerate()
                .skip(cur + 1)
                .find(|(_, e)| e.is_bootable_kernel() && e.priority() == priority)
                .map(|(i, _)| i)
        });

        // Highest priority strictly below the current one. The lowest index wins ties.
        let found = same_tier.or_else(|| {
            let mut best: Option<(usize, u8)> = None;
            for (i, e) in entries.iter().enumerate() {
                let p = e.priority();
                if !e.is_bootable_kernel() || p == 0 || p >= priority {
                    continue;
                }
                if best.map_or(true, |(_, v)| p > v) {
                    best = Some((i, p));
                }
            }
            best.map(|(i, _)| i)
        });

        let Some(index) = found else {
            self.current_kernel = None;
            self.current_priority = 0;
            gpt_println!(self, "No bootable kernel left");
            return Err(Error::NoValidKernel);
        };

        let e = entries[index];
        let size = e.sectors().ok_or(Error::OutOfRegion)?;
        self.current_kernel = Some(index);
        self.current_priority = e.priority();
        gpt_println!(
            self,
            "Selected kernel entry {}: start {}, size {}, priority {}, tries {}, successful {}",
            index,
            { e.starting_lba },
            size,
            e.priority(),
            e.tries(),
            e.successful()
        );
        Ok((e.starting_lba, size))
    }

    /// Applies `update` to the attributes of the kernel last returned by
    /// [GptData::next_kernel_entry].
    ///
    /// Fails with `InvalidUpdateType` if no kernel is selected or the selected entry is not a
    /// kernel. If the attributes changed, every non-ignored buffer is marked modified, the other
    /// copy is resynchronized and CRCs are refreshed before returning.
    pub fn update_kernel_entry(&mut self, update: UpdateType) -> Result<()> {
        let index = self.current_kernel.ok_or(Error::InvalidUpdateType)?;
        let copy = self.authoritative_copy();
        let count = self.entry_count();
        let entry =
            self.entries_mut(copy)[..count].get_mut(index).ok_or(Error::InvalidUpdateType)?;
        if !entry.is_kernel() {
            return Err(Error::InvalidUpdateType);
        }

        let previous = entry.attributes;
        match update {
            UpdateType::Try if entry.successful() => {}
            UpdateType::Try if entry.tries() > 1 => entry.set_tries(entry.tries() - 1),
            // Out of tries. Same as a failed boot.
            UpdateType::Try | UpdateType::Bad => {
                if !entry.successful() {
                    entry.set_tries(0);
                    entry.set_priority(0);
                }
            }
            UpdateType::Reset => {
                entry.set_tries(EntryAttributes::MAX_TRIES);
                entry.set_priority(1);
                entry.set_successful(true);
            }
            UpdateType::Invalidate => {
                entry.set_tries(0);
                entry.set_priority(0);
                entry.set_successful(false);
            }
        }
        if entry.attributes == previous {
            return Ok(());
        }
        let (priority, tries, successful) = (entry.priority(), entry.tries(), entry.successful());

        let mut modified = Modified::all();
        for c in [copy, copy.other()] {
            if self.ignored.contains(c.mask()) {
                modified.remove(c.modified());
            }
        }
        self.modified |= modified;
        self.repair_entries(copy.mask());
        self.update_crc();
        gpt_println!(
            self,
            "Kernel entry {} after {:?}: priority {}, tries {}, successful {}",
            index,
            update,
            priority,
            tries,
            successful
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        check::check_entries,
        layout::GPT_HEADER_SIGNATURE_IGNORED,
        test::{fill_entry, TestGpt, KERNEL_A, KERNEL_B, KERNEL_X, KERNEL_Y},
        CopyMask, GptCopy, NO_PRIORITY,
    };

    // (is_kernel, priority, successful, tries) for A, B, X, Y.
    type Setup = [(bool, u8, bool, u8); 4];

    fn setup(entries: Setup) -> TestGpt {
        let mut t = TestGpt::new();
        for (i, (is_kernel, priority, successful, tries)) in entries.into_iter().enumerate() {
            fill_entry(&mut t.e1()[i], is_kernel, priority, successful, tries);
        }
        t.refresh_crc32();
        t
    }

    fn init(t: &mut TestGpt) -> GptData<'_> {
        let mut gpt = t.gpt_data();
        gpt.init().unwrap();
        gpt.clear_modified();
        gpt
    }

    #[test]
    fn test_update_type_from_u32() {
        assert_eq!(UpdateType::try_from(1), Ok(UpdateType::Try));
        assert_eq!(UpdateType::try_from(2), Ok(UpdateType::Bad));
        assert_eq!(UpdateType::try_from(3), Ok(UpdateType::Reset));
        assert_eq!(UpdateType::try_from(4), Ok(UpdateType::Invalidate));
        assert_eq!(UpdateType::try_from(0), Err(Error::InvalidUpdateType));
        assert_eq!(UpdateType::try_from(99), Err(Error::InvalidUpdateType));
    }

    #[test]
    fn test_no_valid_kernel() {
        let mut t = setup([(false, 0, false, 0); 4]);
        let mut gpt = init(&mut t);
        assert_eq!(gpt.current_priority(), NO_PRIORITY);
        assert_eq!(gpt.next_kernel_entry(), Err(Error::NoValidKernel));
        assert_eq!(gpt.current_kernel(), None);
        assert_eq!(gpt.current_priority(), 0);
        assert_eq!(gpt.update_kernel_entry(UpdateType::Try), Err(Error::InvalidUpdateType));
    }

    #[test]
    fn test_get_next_normal() {
        let mut t = setup([
            (true, 2, true, 0),
            (true, 2, true, 0),
            (false, 0, false, 0),
            (false, 0, false, 0),
        ]);
        let mut gpt = init(&mut t);
        assert_eq!(gpt.next_kernel_entry(), Ok((34, 100)));
        assert_eq!(gpt.current_kernel(), Some(KERNEL_A));
        assert_eq!(gpt.next_kernel_entry(), Ok((134, 99)));
        assert_eq!(gpt.current_kernel(), Some(KERNEL_B));
        assert_eq!(gpt.next_kernel_entry(), Err(Error::NoValidKernel));
        assert_eq!(gpt.current_kernel(), None);
        // Keeps failing until re-initialized.
        assert_eq!(gpt.next_kernel_entry(), Err(Error::NoValidKernel));
        assert_eq!(gpt.current_kernel(), None);
        gpt.init().unwrap();
        assert_eq!(gpt.next_kernel_entry(), Ok((34, 100)));
    }

    #[test]
    fn test_get_next_prio() {
        let mut t = setup([
            (true, 3, true, 0),
            (true, 4, true, 0),
            (true, 0, true, 0),
            (true, 4, true, 0),
        ]);
        let mut gpt = init(&mut t);
        assert_eq!(gpt.next_kernel_entry(), Ok((134, 99)));
        assert_eq!(gpt.current_kernel(), Some(KERNEL_B));
        assert_eq!(gpt.next_kernel_entry(), Ok((334, 97)));
        assert_eq!(gpt.current_kernel(), Some(KERNEL_Y));
        assert_eq!(gpt.next_kernel_entry(), Ok((34, 100)));
        assert_eq!(gpt.current_kernel(), Some(KERNEL_A));
        assert_eq!(gpt.next_kernel_entry(), Err(Error::NoValidKernel));
    }

    #[test]
    fn test_get_next_tries() {
        let mut t = setup([
            (true, 2, false, 1),
            (true, 4, false, 0),
            (true, 3, true, 0),
            (true, 1, false, 0),
        ]);
        let mut gpt = init(&mut t);
        assert_eq!(gpt.next_kernel_entry(), Ok((234, 98)));
        assert_eq!(gpt.current_kernel(), Some(KERNEL_X));
        assert_eq!(gpt.next_kernel_entry(), Ok((34, 100)));
        assert_eq!(gpt.current_kernel(), Some(KERNEL_A));
        assert_eq!(gpt.next_kernel_entry(), Err(Error::NoValidKernel));
    }

    #[test]
    fn test_bad_kernel_is_skipped() {
        let mut t = TestGpt::new();
        fill_entry(&mut t.e1()[KERNEL_A], true, 5, true, 0);
        t.e1()[KERNEL_A].set_bad(true);
        fill_entry(&mut t.e1()[KERNEL_B], true, 3, true, 0);
        t.refresh_crc32();
        let mut gpt = init(&mut t);
        assert_eq!(gpt.next_kernel_entry(), Ok((134, 99)));
        assert_eq!(gpt.next_kernel_entry(), Err(Error::NoValidKernel));
    }

    #[test]
    fn test_update_kernel_entry() {
        let mut t = setup([
            (true, 4, true, 0),
            (true, 3, false, 2),
            (true, 2, false, 2),
            (false, 0, false, 0),
        ]);
        let mut gpt = init(&mut t);

        // Known good kernels are left alone.
        assert_eq!(gpt.next_kernel_entry(), Ok((34, 100)));
        gpt.update_kernel_entry(UpdateType::Try).unwrap();
        assert_eq!(gpt.modified(), Modified::empty());
        gpt.update_kernel_entry(UpdateType::Bad).unwrap();
        assert_eq!(gpt.modified(), Modified::empty());

        // Tries are consumed and then the kernel is demoted, in both copies.
        assert_eq!(gpt.next_kernel_entry(), Ok((134, 99)));
        gpt.update_kernel_entry(UpdateType::Try).unwrap();
        assert_eq!(gpt.modified(), Modified::all());
        for copy in [GptCopy::Primary, GptCopy::Secondary] {
            assert_eq!(gpt.entries(copy)[KERNEL_B].tries(), 1);
            assert_eq!(gpt.entries(copy)[KERNEL_B].priority(), 3);
        }
        gpt.update_kernel_entry(UpdateType::Try).unwrap();
        for copy in [GptCopy::Primary, GptCopy::Secondary] {
            assert_eq!(gpt.entries(copy)[KERNEL_B].tries(), 0);
            assert_eq!(gpt.entries(copy)[KERNEL_B].priority(), 0);
            assert!(!gpt.entries(copy)[KERNEL_B].successful());
        }

        gpt.clear_modified();
        assert_eq!(gpt.next_kernel_entry(), Ok((234, 98)));
        gpt.update_kernel_entry(UpdateType::Bad).unwrap();
        assert_eq!(gpt.modified(), Modified::all());
        for copy in [GptCopy::Primary, GptCopy::Secondary] {
            assert_eq!(gpt.entries(copy)[KERNEL_X].tries(), 0);
            assert_eq!(gpt.entries(copy)[KERNEL_X].priority(), 0);
        }

        // Both copies remain consistent on disk.
        assert_eq!(gpt.sanity_check(), Ok(()));
        assert_eq!(gpt.valid_headers(), CopyMask::BOTH);
        assert_eq!(gpt.valid_entries(), CopyMask::BOTH);
        assert_eq!(
            gpt.entries(GptCopy::Primary)[..4],
            gpt.entries(GptCopy::Secondary)[..4]
        );

        assert_eq!(gpt.next_kernel_entry(), Err(Error::NoValidKernel));
        assert_eq!(gpt.update_kernel_entry(UpdateType::Bad), Err(Error::InvalidUpdateType));
    }

    #[test]
    fn test_update_requires_kernel_entry() {
        let mut t = setup([
            (true, 4, true, 0),
            (true, 3, false, 2),
            (true, 2, false, 2),
            (false, 0, false, 0),
        ]);
        let mut gpt = init(&mut t);
        gpt.current_kernel = Some(KERNEL_Y);
        assert_eq!(gpt.update_kernel_entry(UpdateType::Try), Err(Error::InvalidUpdateType));
        gpt.current_kernel = Some(200);
        assert_eq!(gpt.update_kernel_entry(UpdateType::Try), Err(Error::InvalidUpdateType));
        assert_eq!(gpt.modified(), Modified::empty());
    }

    #[test]
    fn test_reset_and_invalidate() {
        let mut t = setup([
            (true, 5, false, 1),
            (false, 0, false, 0),
            (false, 0, false, 0),
            (false, 0, false, 0),
        ]);
        let mut gpt = init(&mut t);
        assert_eq!(gpt.next_kernel_entry(), Ok((34, 100)));

        gpt.update_kernel_entry(UpdateType::Reset).unwrap();
        for copy in [GptCopy::Primary, GptCopy::Secondary] {
            let e = &gpt.entries(copy)[KERNEL_A];
            assert_eq!((e.priority(), e.tries(), e.successful()), (1, 15, true));
        }

        gpt.clear_modified();
        gpt.update_kernel_entry(UpdateType::Invalidate).unwrap();
        assert_eq!(gpt.modified(), Modified::all());
        for copy in [GptCopy::Primary, GptCopy::Secondary] {
            let e = &gpt.entries(copy)[KERNEL_A];
            assert_eq!((e.priority(), e.tries(), e.successful()), (0, 0, false));
        }
        let h1 = *gpt.header(GptCopy::Primary);
        assert_eq!(check_entries(gpt.entries(GptCopy::Primary), &h1), Ok(()));
    }

    #[test]
    fn test_ignored_primary_selects_from_secondary() {
        let mut t = TestGpt::new();
        t.h1().signature = *GPT_HEADER_SIGNATURE_IGNORED;
        fill_entry(&mut t.e2()[KERNEL_A], true, 1, false, 1);
        fill_entry(&mut t.e2()[KERNEL_Y], true, 2, false, 3);
        t.refresh_crc32();
        let e1 = t.e1.clone();
        let mut gpt = init(&mut t);
        assert_eq!(gpt.authoritative_copy(), GptCopy::Secondary);

        assert_eq!(gpt.next_kernel_entry(), Ok((334, 97)));
        gpt.update_kernel_entry(UpdateType::Try).unwrap();
        assert_eq!(gpt.modified(), Modified::HEADER2 | Modified::ENTRIES2);
        assert_eq!(gpt.entries(GptCopy::Secondary)[KERNEL_Y].tries(), 2);
        drop(gpt);
        assert_eq!(t.e1, e1);
    }

    #[test]
    fn test_selection_is_logged() {
        let mut t = setup([
            (true, 2, true, 0),
            (false, 0, false, 0),
            (false, 0, false, 0),
            (false, 0, false, 0),
        ]);
        let mut out = String::new();
        {
            let mut gpt = t.gpt_data().with_console(&mut out);
            gpt.init().unwrap();
            gpt.next_kernel_entry().unwrap();
        }
        assert!(out.contains("Selected kernel entry 0"), "{}", out);
    }
}
