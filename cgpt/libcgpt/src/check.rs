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

//! Structural validation of the GPT copies.

use crate::{
    layout::{
        crc32, GptEntry, GptHeader, Signature, GPT_ENTRIES_SECTORS, GPT_HEADER_REVISION,
        GPT_HEADER_SECTORS, GPT_PMBR_SECTORS, MAX_NUMBER_OF_ENTRIES, MAX_SIZE_OF_HEADER,
        MIN_NUMBER_OF_ENTRIES, MIN_SIZE_OF_HEADER, SECTOR_SIZE,
    },
    CopyMask, GptCopy, GptData, GptFlags,
};
use arrayvec::ArrayVec;
use core::mem::size_of;
use liberror::{Error, Result};
use zerocopy::AsBytes;

/// The first defect found in a header, in check order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeaderDefect {
    /// Signature is neither "EFI PART" nor "CHROMEOS".
    Signature(Signature),
    /// Revision is not 1.0.
    Revision(u32),
    /// Header size out of `92..=512`.
    Size(u32),
    /// Header CRC mismatch.
    Crc,
    /// The reserved field is not zero.
    Reserved,
    /// Entry size is not 128.
    EntrySize(u32),
    /// Entry count out of range.
    EntryCount(u32),
    /// The header is not where it claims to be.
    MyLba(u64),
    /// The entries array is misplaced.
    EntriesLba(u64),
    /// The usable range is inverted or overlaps a GPT structure.
    UsableRange {
        /// First usable sector.
        first: u64,
        /// Last usable sector.
        last: u64,
    },
}

/// Checks that the drive geometry can hold a GPT at all.
///
/// Only 512-byte sectors are supported. The drive must fit the protective MBR, two headers and two
/// full entry tables. Unless the GPT is stored externally, both sector counts must agree.
pub fn check_parameters(
    sector_bytes: u32,
    streaming_drive_sectors: u64,
    gpt_drive_sectors: u64,
    flags: GptFlags,
) -> Result<()> {
    if usize::try_from(sector_bytes).ok() != Some(SECTOR_SIZE) {
        return Err(Error::InvalidSectorSize);
    }
    if gpt_drive_sectors == 0
        || (!flags.contains(GptFlags::EXTERNAL) && gpt_drive_sectors != streaming_drive_sectors)
    {
        return Err(Error::InvalidSectorNumber);
    }
    if gpt_drive_sectors < GPT_PMBR_SECTORS + 2 * (GPT_HEADER_SECTORS + GPT_ENTRIES_SECTORS) {
        return Err(Error::InvalidSectorNumber);
    }
    Ok(())
}

/// Checks a single header copy.
///
/// `alternate_lba` and the padding are not examined. With [GptFlags::EXTERNAL] fewer than 128
/// entries are allowed and the usable range is only checked against the streaming device size.
pub fn check_header(
    h: &GptHeader,
    copy: GptCopy,
    streaming_drive_sectors: u64,
    gpt_drive_sectors: u64,
    flags: GptFlags,
) -> core::result::Result<(), HeaderDefect> {
    match h.signature_kind() {
        Signature::Standard | Signature::Legacy => {}
        v => return Err(HeaderDefect::Signature(v)),
    }
    if h.revision != GPT_HEADER_REVISION {
        return Err(HeaderDefect::Revision(h.revision));
    }
    if h.size < MIN_SIZE_OF_HEADER || h.size > MAX_SIZE_OF_HEADER {
        return Err(HeaderDefect::Size(h.size));
    }
    // CRC before any remaining field.
    if h.calculate_crc() != h.header_crc32 {
        return Err(HeaderDefect::Crc);
    }
    if h.reserved_zero != 0 {
        return Err(HeaderDefect::Reserved);
    }
    if usize::try_from(h.size_of_entry).ok() != Some(size_of::<GptEntry>()) {
        return Err(HeaderDefect::EntrySize(h.size_of_entry));
    }
    let external = flags.contains(GptFlags::EXTERNAL);
    if h.number_of_entries < MIN_NUMBER_OF_ENTRIES
        || h.number_of_entries > MAX_NUMBER_OF_ENTRIES
        || (!external && h.number_of_entries != MAX_NUMBER_OF_ENTRIES)
    {
        return Err(HeaderDefect::EntryCount(h.number_of_entries));
    }

    let entries_sectors = h.entries_sectors();
    match copy {
        GptCopy::Primary => {
            if h.my_lba != GPT_PMBR_SECTORS {
                return Err(HeaderDefect::MyLba(h.my_lba));
            }
            // Padding between the header and its entries is allowed.
            if h.entries_lba < h.my_lba + 1 {
                return Err(HeaderDefect::EntriesLba(h.entries_lba));
            }
        }
        GptCopy::Secondary => {
            if Some(h.my_lba) != gpt_drive_sectors.checked_sub(GPT_HEADER_SECTORS) {
                return Err(HeaderDefect::MyLba(h.my_lba));
            }
            if Some(h.entries_lba) != h.my_lba.checked_sub(entries_sectors) {
                return Err(HeaderDefect::EntriesLba(h.entries_lba));
            }
        }
    }

    let (first, last) = (h.first_usable_lba, h.last_usable_lba);
    let usable_err = HeaderDefect::UsableRange { first, last };
    if first > last {
        return Err(usable_err);
    }
    if external {
        return match last < streaming_drive_sectors {
            true => Ok(()),
            _ => Err(usable_err),
        };
    }
    // The usable range lies strictly between the two entry tables.
    let primary_entries_end = match copy {
        GptCopy::Primary => h.entries_lba.checked_add(entries_sectors),
        GptCopy::Secondary => Some(GPT_PMBR_SECTORS + GPT_HEADER_SECTORS + entries_sectors),
    };
    if primary_entries_end.map_or(true, |end| first < end) {
        return Err(usable_err);
    }
    match streaming_drive_sectors.checked_sub(GPT_HEADER_SECTORS + entries_sectors) {
        Some(v) if last < v => Ok(()),
        _ => Err(usable_err),
    }
}

/// Returns the CRC32 of the entries region described by `h`, or `None` if it does not fit in
/// `entries`.
pub(crate) fn entries_crc(entries: &[GptEntry], h: &GptHeader) -> Option<u32> {
    Some(crc32(entries.as_bytes().get(..h.entries_bytes()?)?))
}

/// Checks an entries array against a header.
///
/// Checks run in order: CRC, per-entry region, overlap between active entries, duplicate unique
/// GUIDs among active entries. Unused entries (zero type GUID) are skipped.
pub fn check_entries(entries: &[GptEntry], h: &GptHeader) -> Result<()> {
    if entries_crc(entries, h) != Some(h.entries_crc32) {
        return Err(Error::CrcCorrupted);
    }
    if h.number_of_entries > MAX_NUMBER_OF_ENTRIES {
        return Err(Error::InvalidInput);
    }
    let entries = entries.get(..usize::try_from(h.number_of_entries)?).ok_or(Error::InvalidInput)?;
    let active = || entries.iter().filter(|e| !e.is_unused());

    for e in active() {
        if e.starting_lba < h.first_usable_lba
            || e.ending_lba > h.last_usable_lba
            || e.ending_lba < e.starting_lba
        {
            return Err(Error::OutOfRegion);
        }
    }

    let mut ranges = ArrayVec::<(u64, u64), { MAX_NUMBER_OF_ENTRIES as usize }>::new();
    ranges.extend(active().map(|e| (e.starting_lba, e.ending_lba)));
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let ((prev_start, prev_end), (start, end)) = (pair[0], pair[1]);
        if start > prev_end {
            continue;
        }
        // `start` lies inside the previous range. Either it begins at the same sector or the
        // whole range nests inside, or it runs over the previous range's end.
        return match start == prev_start || end < prev_end {
            true => Err(Error::StartLbaOverlap),
            _ => Err(Error::EndLbaOverlap),
        };
    }

    for (i, a) in active().enumerate() {
        if active().skip(i + 1).any(|b| a.unique_guid == b.unique_guid) {
            return Err(Error::DupGuid);
        }
    }
    Ok(())
}

impl GptData<'_> {
    fn check_header_copy(&mut self, copy: GptCopy) -> bool {
        let res = check_header(
            self.header(copy),
            copy,
            self.streaming_drive_sectors,
            self.gpt_drive_sectors,
            self.flags,
        );
        match res {
            Ok(()) => true,
            Err(e) => {
                gpt_println!(self, "The {} GPT header is invalid: {:?}", copy, e);
                false
            }
        }
    }

    fn check_entries_copy(&mut self, copy: GptCopy, against: GptCopy) -> bool {
        match check_entries(self.entries(copy), self.header(against)) {
            Ok(()) => true,
            Err(e) => {
                gpt_println!(self, "The {} GPT entries are invalid: {}", copy, e);
                false
            }
        }
    }

    /// Validates both copies and records the results in [GptData::valid_headers] and
    /// [GptData::valid_entries].
    ///
    /// Entries are checked against a single header known to be valid (the primary when
    /// possible), so two internally consistent but different copies are caught. Fails with
    /// `InvalidHeaders` or `InvalidEntries` when no copy is usable. Copies marked "IGNOREME" are
    /// never valid and are recorded in [GptData::ignored].
    pub fn sanity_check(&mut self) -> Result<()> {
        self.valid_headers = CopyMask::empty();
        self.valid_entries = CopyMask::empty();
        self.ignored = CopyMask::empty();

        check_parameters(
            self.sector_bytes,
            self.streaming_drive_sectors,
            self.gpt_drive_sectors,
            self.flags,
        )?;

        let mut good = None;
        for copy in [GptCopy::Primary, GptCopy::Secondary] {
            if self.header(copy).signature_kind() == Signature::Ignored {
                gpt_println!(self, "The {} GPT is marked ignored", copy);
                self.ignored |= copy.mask();
            } else if self.check_header_copy(copy) {
                self.valid_headers |= copy.mask();
                good = good.or(Some(copy));
            }
        }
        let Some(mut good) = good else {
            return Err(Error::InvalidHeaders);
        };

        for copy in [GptCopy::Primary, GptCopy::Secondary] {
            if !self.ignored.contains(copy.mask()) && self.check_entries_copy(copy, good) {
                self.valid_entries |= copy.mask();
            }
        }

        // The primary header may carry a stale entries CRC while the secondary header matches.
        if self.valid_headers == CopyMask::BOTH && self.valid_entries.is_empty() {
            for copy in [GptCopy::Primary, GptCopy::Secondary] {
                if self.check_entries_copy(copy, GptCopy::Secondary) {
                    self.valid_entries |= copy.mask();
                }
            }
            if !self.valid_entries.is_empty() {
                gpt_println!(self, "Entries match the secondary GPT header only");
                self.valid_headers.remove(CopyMask::PRIMARY);
                good = GptCopy::Secondary;
            }
        }

        if self.valid_entries.is_empty() {
            return Err(Error::InvalidEntries);
        }

        if self.valid_headers == CopyMask::BOTH
            && !self.primary_header.fields_same(&*self.secondary_header)
        {
            gpt_println!(self, "GPT headers disagree, using the {} copy", good);
            self.valid_headers.remove(CopyMask::SECONDARY);
        }
        Ok(())
    }
}
