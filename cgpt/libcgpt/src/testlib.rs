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

//! Utilities for writing tests with cgptlib, e.g. creating fake disks.

pub use cgptlib::*;
use cgptlib::layout::{
    GPT_ENTRIES_SECTORS, GPT_HEADER_REVISION, GPT_HEADER_SIGNATURE, MAX_NUMBER_OF_ENTRIES,
    SECTOR_SIZE, TOTAL_ENTRIES_SIZE,
};
use core::fmt::Write;
use crc32fast::Hasher;
use liberror::{Error, Result};
use std::collections::VecDeque;
use zerocopy::{AsBytes, FromZeroes};

/// RAM based disk implementing [Ops].
pub struct TestDisk {
    /// The backing storage data.
    pub storage: Vec<u8>,
    /// The number of successful read calls.
    pub num_reads: usize,
    /// The number of successful write calls.
    pub num_writes: usize,
    /// Injected errors, consumed one per read or write call.
    pub errors: VecDeque<Error>,
    /// Everything written to the console.
    pub console_out: String,
}

impl TestDisk {
    /// Creates a new [TestDisk] over `data`.
    pub fn new(data: Vec<u8>) -> Self {
        assert_eq!(data.len() % SECTOR_SIZE, 0);
        Self {
            storage: data,
            num_reads: 0,
            num_writes: 0,
            errors: Default::default(),
            console_out: String::new(),
        }
    }

    /// Number of sectors on the disk.
    pub fn sectors(&self) -> u64 {
        u64::try_from(self.storage.len() / SECTOR_SIZE).unwrap()
    }

    /// Byte offset of the given copy's header.
    pub fn header_offset(&self, copy: GptCopy) -> usize {
        match copy {
            GptCopy::Primary => SECTOR_SIZE,
            GptCopy::Secondary => self.storage.len() - SECTOR_SIZE,
        }
    }

    /// Byte offset of the given copy's entries at their standard location.
    pub fn entries_offset(&self, copy: GptCopy) -> usize {
        match copy {
            GptCopy::Primary => 2 * SECTOR_SIZE,
            GptCopy::Secondary => self.storage.len() - SECTOR_SIZE - TOTAL_ENTRIES_SIZE,
        }
    }

    /// Flips every bit of the byte at `offset`.
    pub fn corrupt(&mut self, offset: usize) {
        self.storage[offset] ^= 0xff;
    }

    /// Parses the header of the given copy.
    pub fn header(&self, copy: GptCopy) -> GptHeader {
        let mut bytes = [0u8; SECTOR_SIZE];
        let off = self.header_offset(copy);
        bytes.clone_from_slice(&self.storage[off..][..SECTOR_SIZE]);
        *GptHeader::from_bytes_mut(&mut bytes).unwrap()
    }

    /// Parses the entries of the given copy.
    pub fn entries(&self, copy: GptCopy) -> Vec<GptEntry> {
        let off = self.entries_offset(copy);
        let mut bytes = self.storage[off..][..TOTAL_ENTRIES_SIZE].to_vec();
        GptEntry::slice_from_bytes_mut(&mut bytes).unwrap().to_vec()
    }

    /// Reads the GPT of this disk into `buffers`.
    pub fn load(&mut self, buffers: &mut GptBuffers) -> Result<()> {
        let sectors = self.sectors();
        buffers.read_from(self, sectors)
    }

    fn range(&self, lba: u64, len: usize) -> Result<core::ops::Range<usize>> {
        let start = usize::try_from(lba)?.checked_mul(SECTOR_SIZE).ok_or(Error::BlockIoError)?;
        let end = start.checked_add(len).ok_or(Error::BlockIoError)?;
        match end <= self.storage.len() && len % SECTOR_SIZE == 0 {
            true => Ok(start..end),
            _ => Err(Error::BlockIoError),
        }
    }
}

impl Ops for TestDisk {
    fn read_sectors(&mut self, lba: u64, out: &mut [u8]) -> Result<()> {
        if let Some(e) = self.errors.pop_front() {
            return Err(e);
        }
        let range = self.range(lba, out.len())?;
        out.clone_from_slice(&self.storage[range]);
        self.num_reads += 1;
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        if let Some(e) = self.errors.pop_front() {
            return Err(e);
        }
        let range = self.range(lba, data.len())?;
        self.storage[range].clone_from_slice(data);
        self.num_writes += 1;
        Ok(())
    }

    fn console(&mut self) -> Option<&mut dyn Write> {
        Some(&mut self.console_out)
    }
}

/// Returns the deterministic unique GUID used for test entry `num`.
pub fn test_guid(num: u32) -> Guid {
    Guid::new(num, 0xd450, 0x44bc, [0xa6, 0x93, 0xb8, 0xac, 0x75, 0x5f, 0xcd, 0x48])
}

/// Builder struct for [TestDisk].
///
/// Lays out a protective MBR sector, both headers and both full 32-sector entry tables around the
/// added partitions. Entries get unique GUIDs from [test_guid] in the order they are added.
pub struct TestDiskBuilder {
    sectors: u64,
    signature: [u8; 8],
    entries: Vec<GptEntry>,
}

impl Default for TestDiskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDiskBuilder {
    /// Size of the standard test drive in sectors.
    pub const DEFAULT_SECTORS: u64 = 467;

    /// Creates an empty builder for a drive of [Self::DEFAULT_SECTORS].
    pub fn new() -> Self {
        Self { sectors: Self::DEFAULT_SECTORS, signature: *GPT_HEADER_SIGNATURE, entries: vec![] }
    }

    /// The standard test drive: kernel `[34, 133]`, rootfs `[134, 232]`, rootfs `[234, 331]`,
    /// kernel `[334, 430]`. All attributes are zero.
    pub fn standard() -> Self {
        Self::new()
            .kernel(34, 133, 0, 0, false)
            .rootfs(134, 232)
            .rootfs(234, 331)
            .kernel(334, 430, 0, 0, false)
    }

    /// Sets the drive size in sectors.
    pub fn set_sectors(mut self, sectors: u64) -> Self {
        self.sectors = sectors;
        self
    }

    /// Sets the signature written into both headers.
    pub fn set_signature(mut self, signature: &[u8; 8]) -> Self {
        self.signature = *signature;
        self
    }

    /// Appends an arbitrary entry. Its unique GUID is overwritten.
    pub fn add_entry(mut self, mut entry: GptEntry) -> Self {
        assert!(self.entries.len() < usize::try_from(MAX_NUMBER_OF_ENTRIES).unwrap());
        entry.unique_guid = test_guid(self.entries.len().try_into().unwrap());
        self.entries.push(entry);
        self
    }

    /// Appends a ChromeOS kernel entry.
    pub fn kernel(self, start: u64, end: u64, priority: u8, tries: u8, successful: bool) -> Self {
        let mut e = entry(Guid::CHROMEOS_KERNEL, start, end);
        e.set_priority(priority);
        e.set_tries(tries);
        e.set_successful(successful);
        let name = format!("KERN-{}", self.entries.len());
        e.set_name(&name).unwrap();
        self.add_entry(e)
    }

    /// Appends a ChromeOS rootfs entry.
    pub fn rootfs(self, start: u64, end: u64) -> Self {
        let mut e = entry(Guid::CHROMEOS_ROOTFS, start, end);
        let name = format!("ROOT-{}", self.entries.len());
        e.set_name(&name).unwrap();
        self.add_entry(e)
    }

    /// Consumes the builder and generates a [TestDisk] with both GPT copies and correct CRCs.
    pub fn build(self) -> TestDisk {
        let sectors = usize::try_from(self.sectors).unwrap();
        let entries_sectors = usize::try_from(GPT_ENTRIES_SECTORS).unwrap();
        assert!(sectors >= 3 + 2 * entries_sectors);
        let mut storage = vec![0u8; sectors * SECTOR_SIZE];

        let mut entries = vec![0u8; TOTAL_ENTRIES_SIZE];
        for (i, e) in self.entries.iter().enumerate() {
            entries[i * e.as_bytes().len()..][..e.as_bytes().len()].clone_from_slice(e.as_bytes());
        }
        let mut hasher = Hasher::new();
        hasher.update(&entries);

        let mut header = GptHeader::new_zeroed();
        header.signature = self.signature;
        header.revision = GPT_HEADER_REVISION;
        header.size = 92;
        header.my_lba = 1;
        header.alternate_lba = self.sectors - 1;
        header.first_usable_lba = 2 + GPT_ENTRIES_SECTORS;
        header.last_usable_lba = self.sectors - 2 - GPT_ENTRIES_SECTORS;
        header.entries_lba = 2;
        header.number_of_entries = MAX_NUMBER_OF_ENTRIES;
        header.size_of_entry = u32::try_from(core::mem::size_of::<GptEntry>()).unwrap();
        header.entries_crc32 = hasher.finalize();
        header.update_crc();

        storage[SECTOR_SIZE..][..SECTOR_SIZE].clone_from_slice(header.as_bytes());
        storage[2 * SECTOR_SIZE..][..TOTAL_ENTRIES_SIZE].clone_from_slice(&entries);

        // Tweak header to make it the secondary.
        header.my_lba = self.sectors - 1;
        header.alternate_lba = 1;
        header.entries_lba = self.sectors - 1 - GPT_ENTRIES_SECTORS;
        header.update_crc();
        let secondary_entries = (sectors - 1 - entries_sectors) * SECTOR_SIZE;
        storage[secondary_entries..][..TOTAL_ENTRIES_SIZE].clone_from_slice(&entries);
        storage[(sectors - 1) * SECTOR_SIZE..].clone_from_slice(header.as_bytes());

        TestDisk::new(storage)
    }
}

fn entry(type_guid: Guid, start: u64, end: u64) -> GptEntry {
    let mut e = GptEntry::new_zeroed();
    e.type_guid = type_guid;
    e.starting_lba = start;
    e.ending_lba = end;
    e
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builder_standard_disk_is_valid() {
        let mut disk = TestDiskBuilder::standard().build();
        assert_eq!(disk.sectors(), 467);
        let mut buffers = GptBuffers::new();
        disk.load(&mut buffers).unwrap();
        assert_eq!(disk.num_reads, 4);
        let mut gpt = buffers.gpt_data(512, 467).unwrap();
        assert_eq!(gpt.init(), Ok(()));
        assert_eq!(gpt.modified(), Modified::empty());
        assert_eq!(gpt.valid_headers(), CopyMask::BOTH);
        assert_eq!(gpt.valid_entries(), CopyMask::BOTH);
    }

    #[test]
    fn test_builder_names_and_guids() {
        let disk = TestDiskBuilder::standard().build();
        let entries = disk.entries(GptCopy::Secondary);
        let mut buf = [0u8; 64];
        assert_eq!(entries[0].name_to_str(&mut buf).unwrap(), "KERN-0");
        assert_eq!(entries[2].name_to_str(&mut buf).unwrap(), "ROOT-2");
        assert_eq!({ entries[3].unique_guid }, test_guid(3));
        assert!(entries[4].is_unused());
        assert_eq!({ disk.header(GptCopy::Secondary).entries_lba }, 434);
    }

    #[test]
    fn test_injected_error() {
        let mut disk = TestDiskBuilder::new().build();
        disk.errors.push_back(Error::BlockIoError);
        let mut buffers = GptBuffers::new();
        assert_eq!(disk.load(&mut buffers), Err(Error::BlockIoError));
        assert_eq!(disk.num_reads, 0);
        assert!(disk.console_out.contains("Failed to read"));
    }
}
