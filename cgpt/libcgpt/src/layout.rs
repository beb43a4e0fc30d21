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

//! On-disk GPT structures and the ChromeOS partition attribute codec.

use core::mem::size_of;
use crc32fast::Hasher;
use liberror::{Error, Result};
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Ref};

/// The only supported sector size in bytes.
pub const SECTOR_SIZE: usize = 512;
/// Number of sectors occupied by the protective MBR.
pub const GPT_PMBR_SECTORS: u64 = 1;
/// Number of sectors occupied by one GPT header.
pub const GPT_HEADER_SECTORS: u64 = 1;
/// The expected header revision (1.0).
pub const GPT_HEADER_REVISION: u32 = 0x0001_0000;
/// Standard header signature.
pub const GPT_HEADER_SIGNATURE: &[u8; 8] = b"EFI PART";
/// Legacy ChromeOS header signature. Hides the table from other operating systems.
pub const GPT_HEADER_SIGNATURE2: &[u8; 8] = b"CHROMEOS";
/// Signature marking a copy that must be neither used nor repaired.
pub const GPT_HEADER_SIGNATURE_IGNORED: &[u8; 8] = b"IGNOREME";
/// Smallest legal header size in bytes.
pub const MIN_SIZE_OF_HEADER: u32 = 92;
/// Largest legal header size in bytes.
pub const MAX_SIZE_OF_HEADER: u32 = 512;
/// Minimum number of partition entries.
pub const MIN_NUMBER_OF_ENTRIES: u32 = 32;
/// Maximum (and, for on-device tables, exact) number of partition entries.
pub const MAX_NUMBER_OF_ENTRIES: u32 = 128;
/// Size of the fixed entries region in bytes.
pub const TOTAL_ENTRIES_SIZE: usize = MAX_NUMBER_OF_ENTRIES as usize * size_of::<GptEntry>();
/// Size of the fixed entries region in sectors.
pub const GPT_ENTRIES_SECTORS: u64 = (TOTAL_ENTRIES_SIZE / SECTOR_SIZE) as u64;
/// Number of UTF-16 code units in a partition name.
pub const GPT_NAME_LEN_U16: usize = 36;

/// Computes the IEEE CRC32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// A GUID in its on-disk (mixed-endian) byte order.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Default, AsBytes, FromBytes, FromZeroes)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// The all-zero GUID. As a partition type it marks an unused entry.
    pub const ZERO: Guid = Guid([0u8; 16]);

    /// ChromeOS kernel partition type FE3A2A5D-4F32-41A7-B725-ACCC3285A309.
    pub const CHROMEOS_KERNEL: Guid =
        Guid::new(0xfe3a2a5d, 0x4f32, 0x41a7, [0xb7, 0x25, 0xac, 0xcc, 0x32, 0x85, 0xa3, 0x09]);

    /// ChromeOS rootfs partition type 3CB8E202-3B7E-47DD-8A3C-7FF2A13CFCEC.
    pub const CHROMEOS_ROOTFS: Guid =
        Guid::new(0x3cb8e202, 0x3b7e, 0x47dd, [0x8a, 0x3c, 0x7f, 0xf2, 0xa1, 0x3c, 0xfc, 0xec]);

    /// Builds a GUID from its textual fields. The first three fields are stored little-endian.
    pub const fn new(time_low: u32, time_mid: u16, time_hi: u16, tail: [u8; 8]) -> Self {
        let a = time_low.to_le_bytes();
        let b = time_mid.to_le_bytes();
        let c = time_hi.to_le_bytes();
        Self([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], tail[0], tail[1], tail[2], tail[3],
            tail[4], tail[5], tail[6], tail[7],
        ])
    }

    /// Returns true if this is the zero GUID.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl core::fmt::Display for Guid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes_le(self.0).hyphenated())
    }
}

impl core::fmt::Debug for Guid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Guid({})", self)
    }
}

/// The GPT header. Occupies a full 512-byte sector; only the first `size` bytes are covered by
/// `header_crc32`.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct GptHeader {
    /// One of [GPT_HEADER_SIGNATURE], [GPT_HEADER_SIGNATURE2] or
    /// [GPT_HEADER_SIGNATURE_IGNORED].
    pub signature: [u8; 8],
    /// Header version; must be [GPT_HEADER_REVISION].
    pub revision: u32,
    /// Header size in bytes.
    pub size: u32,
    /// CRC of the first `size` bytes, calculated with this field zeroed.
    pub header_crc32: u32,
    /// Reserved; must be set to 0.
    pub reserved_zero: u32,
    /// The on-disk sector of this header.
    pub my_lba: u64,
    /// The on-disk sector of the other header. Not validated.
    pub alternate_lba: u64,
    /// First usable sector for partition contents.
    pub first_usable_lba: u64,
    /// Last usable sector for partition contents (inclusive).
    pub last_usable_lba: u64,
    /// Disk GUID.
    pub disk_uuid: Guid,
    /// Starting sector of this copy's entries array.
    pub entries_lba: u64,
    /// Number of partition entries.
    pub number_of_entries: u32,
    /// The size of each partition entry in bytes.
    pub size_of_entry: u32,
    /// CRC of the partition entries array.
    pub entries_crc32: u32,
    /// Remainder of the sector.
    pub padding: [u8; 420],
}

const_assert_eq!(size_of::<Guid>(), 16);
const_assert_eq!(size_of::<GptHeader>(), SECTOR_SIZE);

/// Classification of the header signature bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signature {
    /// "EFI PART".
    Standard,
    /// "CHROMEOS".
    Legacy,
    /// "IGNOREME".
    Ignored,
    /// Anything else.
    Unknown,
}

impl GptHeader {
    /// Casts the start of a byte buffer into a header.
    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut GptHeader> {
        Ok(Ref::<_, GptHeader>::new_from_prefix(bytes)
            .ok_or(Error::BufferTooSmall(Some(size_of::<GptHeader>())))?
            .0
            .into_mut())
    }

    /// Classifies the signature field.
    pub fn signature_kind(&self) -> Signature {
        match &self.signature {
            s if s == GPT_HEADER_SIGNATURE => Signature::Standard,
            s if s == GPT_HEADER_SIGNATURE2 => Signature::Legacy,
            s if s == GPT_HEADER_SIGNATURE_IGNORED => Signature::Ignored,
            _ => Signature::Unknown,
        }
    }

    /// Computes the header CRC over the first `size` bytes with the CRC field treated as zero.
    /// `size` is clamped to the structure size.
    pub fn calculate_crc(&self) -> u32 {
        let mut copy = *self;
        copy.header_crc32 = 0;
        let len = usize::try_from(self.size).unwrap_or(SECTOR_SIZE).min(SECTOR_SIZE);
        crc32(&copy.as_bytes()[..len])
    }

    /// Updates the header CRC value.
    pub fn update_crc(&mut self) {
        self.header_crc32 = self.calculate_crc();
    }

    /// Returns the size of the entries array in bytes, or `None` on overflow.
    pub fn entries_bytes(&self) -> Option<usize> {
        usize::try_from(u64::from(self.number_of_entries) * u64::from(self.size_of_entry)).ok()
    }

    /// Returns the number of sectors occupied by the entries array.
    pub fn entries_sectors(&self) -> u64 {
        let bytes = u64::from(self.number_of_entries) * u64::from(self.size_of_entry);
        bytes.div_ceil(SECTOR_SIZE as u64)
    }

    /// Checks whether the fields describing shared geometry match. Two copies of the same table
    /// must always be synonymous even though `my_lba` and `entries_lba` differ.
    pub fn is_synonymous(&self, other: &GptHeader) -> bool {
        self.first_usable_lba == other.first_usable_lba
            && self.last_usable_lba == other.last_usable_lba
            && self.number_of_entries == other.number_of_entries
            && self.size_of_entry == other.size_of_entry
            && self.disk_uuid == other.disk_uuid
    }

    /// Copies the synonymous fields from `other`. The CRC is not updated.
    pub fn copy_synonymous_from(&mut self, other: &GptHeader) {
        self.first_usable_lba = other.first_usable_lba;
        self.last_usable_lba = other.last_usable_lba;
        self.number_of_entries = other.number_of_entries;
        self.size_of_entry = other.size_of_entry;
        self.disk_uuid = other.disk_uuid;
    }

    /// Checks whether every field that must agree between two valid copies does. This is stricter
    /// than [GptHeader::is_synonymous]: signature, revision, size, reserved field and entries CRC
    /// must match as well.
    pub fn fields_same(&self, other: &GptHeader) -> bool {
        self.signature == other.signature
            && self.revision == other.revision
            && self.size == other.size
            && self.reserved_zero == other.reserved_zero
            && self.entries_crc32 == other.entries_crc32
            && self.is_synonymous(other)
    }
}

/// The 64-bit attribute word of a partition entry.
///
///  bits | meaning
/// ------+-----------------------------------
/// 63-58 | reserved, never modified here
///    57 | bad
///    56 | successful
/// 55-52 | tries
/// 51-48 | priority
/// 47-00 | reserved, never modified here
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct EntryAttributes(pub u64);

// Extracts the field at `offset` of width `mask`.
fn get_field(base: u64, offset: u64, mask: u64) -> u8 {
    u8::try_from((base >> offset) & mask).unwrap_or_default()
}

// Returns `base` with the field at `offset` replaced by `val`.
fn set_field(base: u64, val: u8, offset: u64, mask: u64) -> u64 {
    (base & !(mask << offset)) | ((u64::from(val) & mask) << offset)
}

impl EntryAttributes {
    const PRIORITY_OFFSET: u64 = 48;
    const PRIORITY_MASK: u64 = 0b1111;

    const TRIES_OFFSET: u64 = 52;
    const TRIES_MASK: u64 = 0b1111;

    const SUCCESSFUL_OFFSET: u64 = 56;
    const SUCCESSFUL_MASK: u64 = 0b1;

    const BAD_OFFSET: u64 = 57;
    const BAD_MASK: u64 = 0b1;

    /// Highest legal priority.
    pub const MAX_PRIORITY: u8 = 15;
    /// Highest legal tries count.
    pub const MAX_TRIES: u8 = 15;

    /// Relative boot rank. 0 means never boot.
    pub fn priority(&self) -> u8 {
        get_field(self.0, Self::PRIORITY_OFFSET, Self::PRIORITY_MASK)
    }

    /// Sets the priority. `priority` must not exceed [EntryAttributes::MAX_PRIORITY].
    pub fn set_priority(&mut self, priority: u8) {
        debug_assert!(priority <= Self::MAX_PRIORITY);
        self.0 = set_field(self.0, priority, Self::PRIORITY_OFFSET, Self::PRIORITY_MASK);
    }

    /// Remaining boot attempts.
    pub fn tries(&self) -> u8 {
        get_field(self.0, Self::TRIES_OFFSET, Self::TRIES_MASK)
    }

    /// Sets the remaining attempts. `tries` must not exceed [EntryAttributes::MAX_TRIES].
    pub fn set_tries(&mut self, tries: u8) {
        debug_assert!(tries <= Self::MAX_TRIES);
        self.0 = set_field(self.0, tries, Self::TRIES_OFFSET, Self::TRIES_MASK);
    }

    /// Whether the partition has booted successfully at least once.
    pub fn successful(&self) -> bool {
        get_field(self.0, Self::SUCCESSFUL_OFFSET, Self::SUCCESSFUL_MASK) != 0
    }

    /// Sets the successful flag.
    pub fn set_successful(&mut self, successful: bool) {
        self.0 = set_field(self.0, successful.into(), Self::SUCCESSFUL_OFFSET, Self::SUCCESSFUL_MASK);
    }

    /// Whether the partition has been permanently disqualified.
    pub fn bad(&self) -> bool {
        get_field(self.0, Self::BAD_OFFSET, Self::BAD_MASK) != 0
    }

    /// Sets the bad flag.
    pub fn set_bad(&mut self, bad: bool) {
        self.0 = set_field(self.0, bad.into(), Self::BAD_OFFSET, Self::BAD_MASK);
    }
}

/// A partition entry.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct GptEntry {
    /// Partition type GUID.
    pub type_guid: Guid,
    /// Unique partition GUID.
    pub unique_guid: Guid,
    /// First sector.
    pub starting_lba: u64,
    /// Last sector (inclusive).
    pub ending_lba: u64,
    /// Partition attributes.
    pub attributes: EntryAttributes,
    /// Partition name in UTF-16.
    pub name: [u16; GPT_NAME_LEN_U16],
}

const_assert_eq!(size_of::<GptEntry>(), 128);
const_assert_eq!(TOTAL_ENTRIES_SIZE, 16384);

impl GptEntry {
    /// Casts the fixed entries region at the start of `bytes` into entries.
    pub fn slice_from_bytes_mut(bytes: &mut [u8]) -> Result<&mut [GptEntry]> {
        let region = bytes
            .get_mut(..TOTAL_ENTRIES_SIZE)
            .ok_or(Error::BufferTooSmall(Some(TOTAL_ENTRIES_SIZE)))?;
        Ref::<_, [GptEntry]>::new_slice(region)
            .map(|v| v.into_mut_slice())
            .ok_or(Error::BufferTooSmall(Some(TOTAL_ENTRIES_SIZE)))
    }

    /// An unused entry has the zero type GUID and is skipped by every check.
    pub fn is_unused(&self) -> bool {
        self.type_guid.is_zero()
    }

    /// Whether this is a ChromeOS kernel partition.
    pub fn is_kernel(&self) -> bool {
        self.type_guid == Guid::CHROMEOS_KERNEL
    }

    /// A kernel entry that may be tried: not bad, and either known good or with tries left.
    pub fn is_bootable_kernel(&self) -> bool {
        self.is_kernel()
            && !self.bad()
            && (self.successful() || self.tries() > 0)
    }

    /// Returns the partition size in sectors. `None` if the range is inverted.
    pub fn sectors(&self) -> Option<u64> {
        // "+1" first so that an empty inverted range cannot underflow silently.
        self.ending_lba.checked_add(1)?.checked_sub(self.starting_lba)
    }

    /// See [EntryAttributes::priority].
    pub fn priority(&self) -> u8 {
        self.attributes.priority()
    }

    /// See [EntryAttributes::set_priority].
    pub fn set_priority(&mut self, priority: u8) {
        self.attributes.set_priority(priority)
    }

    /// See [EntryAttributes::tries].
    pub fn tries(&self) -> u8 {
        self.attributes.tries()
    }

    /// See [EntryAttributes::set_tries].
    pub fn set_tries(&mut self, tries: u8) {
        self.attributes.set_tries(tries)
    }

    /// See [EntryAttributes::successful].
    pub fn successful(&self) -> bool {
        self.attributes.successful()
    }

    /// See [EntryAttributes::set_successful].
    pub fn set_successful(&mut self, successful: bool) {
        self.attributes.set_successful(successful)
    }

    /// See [EntryAttributes::bad].
    pub fn bad(&self) -> bool {
        self.attributes.bad()
    }

    /// See [EntryAttributes::set_bad].
    pub fn set_bad(&mut self, bad: bool) {
        self.attributes.set_bad(bad)
    }

    /// Decodes the partition name into a string. A safe size for `buffer` is
    /// `3 * GPT_NAME_LEN_U16`.
    pub fn name_to_str<'a>(&self, buffer: &'a mut [u8]) -> Result<&'a str> {
        let name = self.name;
        let mut index = 0;
        for c in char::decode_utf16(name) {
            match c.unwrap_or(char::REPLACEMENT_CHARACTER) {
                '\0' => break,
                c if c.len_utf8() <= buffer.len() - index => {
                    index += c.encode_utf8(&mut buffer[index..]).len()
                }
                _ => return Err(Error::BufferTooSmall(None)),
            }
        }
        core::str::from_utf8(&buffer[..index]).map_err(|_| Error::InvalidInput)
    }

    /// Encodes `name` as UTF-16. Fails if it does not fit.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let mut encoded = [0u16; GPT_NAME_LEN_U16];
        let mut len = 0;
        for unit in name.encode_utf16() {
            *encoded.get_mut(len).ok_or(Error::InvalidInput)? = unit;
            len += 1;
        }
        self.name = encoded;
        Ok(())
    }
}

impl core::fmt::Display for GptEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut buf = [0u8; GPT_NAME_LEN_U16 * 3];
        let name = self.name_to_str(&mut buf).map_err(|_| core::fmt::Error)?;
        write!(
            f,
            "partition name: \"{}\", [first, last]: [{}, {}], priority: {}, tries: {}, \
            successful: {}",
            name,
            { self.starting_lba },
            { self.ending_lba },
            self.priority(),
            self.tries(),
            self.successful()
        )
    }
}
