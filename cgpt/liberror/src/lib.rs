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

//! Unified error type library
//!
//! This crate defines a common error type for the GPT libraries.
//!
//! The per-copy structural errors (`CrcCorrupted`, `OutOfRegion`, `StartLbaOverlap`,
//! `EndLbaOverlap`, `DupGuid`) are normally absorbed by the validator and turned into validity
//! masks. Only `InvalidHeaders`, `InvalidEntries` and the parameter errors are fatal to the
//! caller. `NoValidKernel` is an expected outcome that sends the bootloader to recovery.
//!
//! New error variants should be inserted alphabetically.

#![cfg_attr(not(test), no_std)]

/// Common, universal error type
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The external sector reader/writer failed.
    BlockIoError,
    /// The provided buffer is too small.
    /// If Some(n), provides the minimum required buffer size.
    BufferTooSmall(Option<usize>),
    /// The CRC32 of a partition entries array does not match its header.
    CrcCorrupted,
    /// Two active partition entries share a unique GUID.
    DupGuid,
    /// The ending LBA of a partition falls inside another partition.
    EndLbaOverlap,
    /// Neither copy of the partition entries array is usable.
    InvalidEntries,
    /// Neither copy of the GPT header is usable.
    InvalidHeaders,
    /// At least one parameter fails preconditions.
    InvalidInput,
    /// The drive is too small to hold the GPT, or its sector counts disagree.
    InvalidSectorNumber,
    /// Sector size is not supported.
    InvalidSectorSize,
    /// No kernel is selected, the selected entry is not a kernel, or the update operation is
    /// unknown.
    InvalidUpdateType,
    /// No bootable kernel partition remains.
    NoValidKernel,
    /// The requested partition entry does not exist.
    NotFound,
    /// Catch-all error with optional debugging string.
    Other(Option<&'static str>),
    /// A partition lies outside the usable region or ends before it starts.
    OutOfRegion,
    /// The starting LBA of a partition falls inside another partition.
    StartLbaOverlap,
}

impl Error {
    /// Returns a short human readable description of the error kind.
    pub fn description(&self) -> &'static str {
        match self {
            Self::BlockIoError => "Block device I/O failed",
            Self::BufferTooSmall(_) => "Buffer too small",
            Self::CrcCorrupted => "Entries' crc corrupted",
            Self::DupGuid => "Duplicated GUID",
            Self::EndLbaOverlap => "Ending LBA overlaps",
            Self::InvalidEntries => "Invalid entries",
            Self::InvalidHeaders => "Invalid headers",
            Self::InvalidInput => "Invalid input",
            Self::InvalidSectorNumber => "Invalid sector number",
            Self::InvalidSectorSize => "Invalid sector size",
            Self::InvalidUpdateType => "Invalid update type",
            Self::NoValidKernel => "Invalid kernel",
            Self::NotFound => "No entry found",
            Self::Other(Some(msg)) => msg,
            Self::Other(None) => "Unknown",
            Self::OutOfRegion => "Entry outside of valid region",
            Self::StartLbaOverlap => "Starting LBA overlaps",
        }
    }
}

impl From<Option<&'static str>> for Error {
    fn from(val: Option<&'static str>) -> Self {
        Self::Other(val)
    }
}

impl From<&'static str> for Error {
    fn from(val: &'static str) -> Self {
        Self::Other(Some(val))
    }
}

impl From<core::num::TryFromIntError> for Error {
    fn from(_: core::num::TryFromIntError) -> Self {
        Self::InvalidInput
    }
}

impl From<core::fmt::Error> for Error {
    fn from(_: core::fmt::Error) -> Self {
        Self::Other(Some("Formatting failed"))
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BufferTooSmall(Some(n)) => write!(f, "{} (need {} bytes)", self.description(), n),
            _ => write!(f, "{}", self.description()),
        }
    }
}

/// Helper type alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    const ALL_KINDS: &[Error] = &[
        Error::BlockIoError,
        Error::BufferTooSmall(None),
        Error::CrcCorrupted,
        Error::DupGuid,
        Error::EndLbaOverlap,
        Error::InvalidEntries,
        Error::InvalidHeaders,
        Error::InvalidInput,
        Error::InvalidSectorNumber,
        Error::InvalidSectorSize,
        Error::InvalidUpdateType,
        Error::NoValidKernel,
        Error::NotFound,
        Error::OutOfRegion,
        Error::StartLbaOverlap,
    ];

    #[test]
    fn test_known_errors_have_description() {
        for e in ALL_KINDS {
            assert!(!e.description().is_empty());
            assert_ne!(e.description(), "Unknown");
        }
    }

    #[test]
    fn test_descriptions_are_distinct() {
        for (i, a) in ALL_KINDS.iter().enumerate() {
            for b in &ALL_KINDS[i + 1..] {
                assert_ne!(a.description(), b.description());
            }
        }
    }

    #[test]
    fn test_unknown_error_text() {
        assert_eq!(Error::Other(None).description(), "Unknown");
        assert_eq!(Error::from("custom").description(), "custom");
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::NoValidKernel.to_string(), "Invalid kernel");
        assert_eq!(Error::BufferTooSmall(Some(512)).to_string(), "Buffer too small (need 512 bytes)");
    }

    #[test]
    fn test_from_str_option() {
        let _e: Error = Some("error string").into();
        let n: Option<&str> = None;
        let e2: Error = n.into();
        assert_eq!(e2, Error::Other(None));
    }

    #[test]
    fn test_from_try_from_int_error() {
        let e: Error = u8::try_from(256u32).unwrap_err().into();
        assert_eq!(e, Error::InvalidInput);
    }
}
