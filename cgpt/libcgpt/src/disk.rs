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

//! Loading and persisting the four GPT regions through a caller-provided backend.

use crate::{
    check::check_header,
    layout::{
        GptHeader, GPT_ENTRIES_SECTORS, GPT_HEADER_SECTORS, GPT_PMBR_SECTORS, SECTOR_SIZE,
        TOTAL_ENTRIES_SIZE,
    },
    GptCopy, GptData, GptFlags, Modified,
};
use core::fmt::Write;
use liberror::{Error, Result};
use zerocopy::AsBytes;

/// `Ops` provides the backend interfaces needed to load and persist the GPT.
pub trait Ops {
    /// Reads exactly `out.len()` bytes starting at sector `lba` of the device holding the GPT.
    fn read_sectors(&mut self, lba: u64, out: &mut [u8]) -> Result<()>;

    /// Writes exactly `data.len()` bytes starting at sector `lba` of the device holding the GPT.
    fn write_sectors(&mut self, lba: u64, data: &[u8]) -> Result<()>;

    /// Returns an optional console writer for logging error messages.
    fn console(&mut self) -> Option<&mut dyn Write>;
}

/// Fixed storage for the four GPT regions of one disk.
///
/// This is about 33KiB; callers typically keep it in a static or on a large stack.
pub struct GptBuffers {
    /// Primary header sector.
    pub primary_header: [u8; SECTOR_SIZE],
    /// Secondary header sector.
    pub secondary_header: [u8; SECTOR_SIZE],
    /// Primary entries region.
    pub primary_entries: [u8; TOTAL_ENTRIES_SIZE],
    /// Secondary entries region.
    pub secondary_entries: [u8; TOTAL_ENTRIES_SIZE],
}

impl Default for GptBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl GptBuffers {
    /// Creates zeroed buffers.
    pub const fn new() -> Self {
        Self {
            primary_header: [0u8; SECTOR_SIZE],
            secondary_header: [0u8; SECTOR_SIZE],
            primary_entries: [0u8; TOTAL_ENTRIES_SIZE],
            secondary_entries: [0u8; TOTAL_ENTRIES_SIZE],
        }
    }

    /// Reads the four regions of a disk of `gpt_drive_sectors` sectors.
    ///
    /// The primary entries are read where a valid primary header places them, and directly after
    /// the primary header otherwise. The secondary regions are read from their fixed locations at
    /// the end of the disk.
    pub fn read_from(&mut self, ops: &mut dyn Ops, gpt_drive_sectors: u64) -> Result<()> {
        let secondary_header_lba = gpt_drive_sectors
            .checked_sub(GPT_HEADER_SECTORS)
            .filter(|v| *v > GPT_PMBR_SECTORS + GPT_HEADER_SECTORS + GPT_ENTRIES_SECTORS)
            .ok_or(Error::InvalidSectorNumber)?;
        let secondary_entries_lba = secondary_header_lba - GPT_ENTRIES_SECTORS;
        read_logged(ops, GPT_PMBR_SECTORS, &mut self.primary_header)?;
        let primary_entries_lba = self.primary_entries_lba(gpt_drive_sectors);
        let regions: [(u64, &mut [u8]); 3] = [
            (primary_entries_lba, &mut self.primary_entries[..]),
            (secondary_entries_lba, &mut self.secondary_entries[..]),
            (secondary_header_lba, &mut self.secondary_header[..]),
        ];
        for (lba, buffer) in regions {
            read_logged(ops, lba, buffer)?;
        }
        Ok(())
    }

    // A header that passes `check_header` keeps its entries clear of the usable range and
    // inside the disk.
    fn primary_entries_lba(&mut self, gpt_drive_sectors: u64) -> u64 {
        let (sectors, flags) = (gpt_drive_sectors, GptFlags::empty());
        GptHeader::from_bytes_mut(&mut self.primary_header[..])
            .ok()
            .filter(|h| check_header(h, GptCopy::Primary, sectors, sectors, flags).is_ok())
            .map_or(GPT_PMBR_SECTORS + GPT_HEADER_SECTORS, |h| h.entries_lba)
    }

    /// Wraps the buffers in a [GptData].
    pub fn gpt_data(&mut self, sector_bytes: u32, drive_sectors: u64) -> Result<GptData<'_>> {
        GptData::new(
            &mut self.primary_header,
            &mut self.secondary_header,
            &mut self.primary_entries,
            &mut self.secondary_entries,
            sector_bytes,
            drive_sectors,
        )
    }
}

impl GptData<'_> {
    /// Writes every region reported by [GptData::modified] and clears it.
    ///
    /// Each copy's entries are written at the location its header names, before the header
    /// itself. On failure the modified bits are kept so the caller may retry.
    pub fn write_modified(&mut self, ops: &mut dyn Ops) -> Result<()> {
        let header_lbas = [
            (GptCopy::Primary, GPT_PMBR_SECTORS),
            (GptCopy::Secondary, self.gpt_drive_sectors.saturating_sub(GPT_HEADER_SECTORS)),
        ];
        for (copy, header_lba) in header_lbas {
            let (header_bit, entries_bit) = match copy {
                GptCopy::Primary => (Modified::HEADER1, Modified::ENTRIES1),
                GptCopy::Secondary => (Modified::HEADER2, Modified::ENTRIES2),
            };
            let header = self.header(copy);
            if self.modified.contains(entries_bit) {
                let sectors = usize::try_from(header.entries_sectors())?;
                let len = sectors.checked_mul(SECTOR_SIZE).ok_or(Error::InvalidInput)?;
                let data = self
                    .entries(copy)
                    .as_bytes()
                    .get(..len)
                    .ok_or(Error::BufferTooSmall(Some(len)))?;
                write_logged(ops, header.entries_lba, data)?;
            }
            if self.modified.contains(header_bit) {
                write_logged(ops, header_lba, header.as_bytes())?;
            }
        }
        self.modified = Modified::empty();
        Ok(())
    }
}

fn read_logged(ops: &mut dyn Ops, lba: u64, out: &mut [u8]) -> Result<()> {
    ops.read_sectors(lba, out).map_err(|e| {
        gpt_println!(ops, "Failed to read GPT sectors at LBA {}: {}", lba, e);
        e
    })
}

fn write_logged(ops: &mut dyn Ops, lba: u64, data: &[u8]) -> Result<()> {
    ops.write_sectors(lba, data).map_err(|e| {
        gpt_println!(ops, "Failed to write GPT sectors at LBA {}: {}", lba, e);
        e
    })
}
