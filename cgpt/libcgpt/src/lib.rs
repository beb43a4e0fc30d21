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

//! ChromeOS GPT library.
//!
//! This library validates the two redundant copies of a GUID Partition Table, repairs whichever
//! copy is damaged, and drives the boot-time kernel selection state machine over the
//! priority/tries/successful attributes of ChromeOS kernel partitions.
//!
//! The library performs no I/O and no allocation. The caller loads the four GPT regions (primary
//! header, primary entries, secondary entries, secondary header) into byte buffers, wraps them in
//! a [GptData], and persists whichever regions [GptData::modified] reports afterwards. The
//! [disk] module provides the glue for doing so through an [Ops] implementation.
//!
//! A typical boot flow:
//!
//! ```ignore
//! let mut gpt = GptData::new(&mut h1, &mut h2, &mut e1, &mut e2, 512, drive_sectors)?;
//! gpt.init()?;
//! while let Ok((start, size)) = gpt.next_kernel_entry() {
//!     match try_boot(start, size) {
//!         Ok(()) => break,
//!         Err(_) => gpt.update_kernel_entry(UpdateType::Bad)?,
//!     }
//! }
//! gpt.write_modified(&mut ops)?;
//! ```

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use core::fmt::Write;
use liberror::{Error, Result};

/// Prints to the console attached to a [GptData] or an [Ops].
macro_rules! gpt_print {
    ( $ops:expr, $( $x:expr ),* $(,)? ) => {
        match $ops.console() {
            Some(f) => {
                let _ = write!(f, $($x,)*);
            }
            _ => {}
        }
    };
}

/// Same as `gpt_print!` with a trailing newline.
macro_rules! gpt_println {
    ( $ops:expr, $( $x:expr ),* $(,)? ) => {
        gpt_print!($ops, "{}\n", format_args!($($x,)*))
    };
}

mod check;
pub mod disk;
mod kernel;
pub mod layout;
mod repair;

pub use check::{check_entries, check_header, check_parameters, HeaderDefect};
pub use disk::{GptBuffers, Ops};
pub use kernel::UpdateType;
pub use layout::{EntryAttributes, GptEntry, GptHeader, Guid, Signature};

use layout::EntryAttributes as Attrs;

bitflags! {
    /// Selects the primary and/or secondary copy of the header or entries.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct CopyMask: u8 {
        /// The primary copy (start of disk).
        const PRIMARY = 1 << 0;
        /// The secondary copy (end of disk).
        const SECONDARY = 1 << 1;
        /// Both copies.
        const BOTH = Self::PRIMARY.bits() | Self::SECONDARY.bits();
    }
}

bitflags! {
    /// Buffers that changed in memory and must be written back.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Modified: u8 {
        /// Primary header.
        const HEADER1 = 1 << 0;
        /// Secondary header.
        const HEADER2 = 1 << 1;
        /// Primary entries.
        const ENTRIES1 = 1 << 2;
        /// Secondary entries.
        const ENTRIES2 = 1 << 3;
    }
}

bitflags! {
    /// Behavior flags for a [GptData].
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct GptFlags: u32 {
        /// The GPT structures live on a separate device from the partitions they describe.
        /// Entry placement checks are relaxed and fewer than 128 entries are allowed.
        const EXTERNAL = 1 << 0;
    }
}

/// Identifies one of the two copies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GptCopy {
    /// Primary copy.
    Primary,
    /// Secondary copy.
    Secondary,
}

impl GptCopy {
    /// Returns the other copy.
    pub fn other(&self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }

    /// Returns the single-bit mask for this copy.
    pub fn mask(&self) -> CopyMask {
        match self {
            Self::Primary => CopyMask::PRIMARY,
            Self::Secondary => CopyMask::SECONDARY,
        }
    }

    /// Returns the modified bits covering both buffers of this copy.
    pub fn modified(&self) -> Modified {
        match self {
            Self::Primary => Modified::HEADER1 | Modified::ENTRIES1,
            Self::Secondary => Modified::HEADER2 | Modified::ENTRIES2,
        }
    }
}

impl core::fmt::Display for GptCopy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// Priority value that outranks every legal priority. Used before the first selection.
pub const NO_PRIORITY: u8 = Attrs::MAX_PRIORITY + 1;

/// `GptData` is the working state for one disk.
///
/// It borrows the four GPT buffers for its whole lifetime. Validation results, the `modified`
/// bookkeeping and the kernel selection cursor all live here so that a caller can start over
/// at any time by calling [GptData::init] again.
pub struct GptData<'a> {
    primary_header: &'a mut GptHeader,
    secondary_header: &'a mut GptHeader,
    primary_entries: &'a mut [GptEntry],
    secondary_entries: &'a mut [GptEntry],
    /// Sector size in bytes. Only 512 is supported.
    pub sector_bytes: u32,
    /// Size of the device holding the partitions, in sectors.
    pub streaming_drive_sectors: u64,
    /// Size of the device holding the GPT, in sectors. Equal to `streaming_drive_sectors` unless
    /// [GptFlags::EXTERNAL] is set.
    pub gpt_drive_sectors: u64,
    /// Behavior flags.
    pub flags: GptFlags,
    valid_headers: CopyMask,
    valid_entries: CopyMask,
    ignored: CopyMask,
    modified: Modified,
    current_kernel: Option<usize>,
    current_priority: u8,
    console: Option<&'a mut dyn Write>,
}

impl<'a> GptData<'a> {
    /// Wraps the four GPT buffers. Header buffers must hold at least one sector and entries
    /// buffers at least [layout::TOTAL_ENTRIES_SIZE] bytes.
    pub fn new(
        primary_header: &'a mut [u8],
        secondary_header: &'a mut [u8],
        primary_entries: &'a mut [u8],
        secondary_entries: &'a mut [u8],
        sector_bytes: u32,
        drive_sectors: u64,
    ) -> Result<Self> {
        Ok(Self {
            primary_header: GptHeader::from_bytes_mut(primary_header)?,
            secondary_header: GptHeader::from_bytes_mut(secondary_header)?,
            primary_entries: GptEntry::slice_from_bytes_mut(primary_entries)?,
            secondary_entries: GptEntry::slice_from_bytes_mut(secondary_entries)?,
            sector_bytes,
            streaming_drive_sectors: drive_sectors,
            gpt_drive_sectors: drive_sectors,
            flags: GptFlags::empty(),
            valid_headers: CopyMask::empty(),
            valid_entries: CopyMask::empty(),
            ignored: CopyMask::empty(),
            modified: Modified::empty(),
            current_kernel: None,
            current_priority: NO_PRIORITY,
            console: None,
        })
    }

    /// Sets the behavior flags.
    pub fn with_flags(mut self, flags: GptFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the size of the device holding the GPT, for [GptFlags::EXTERNAL] setups.
    pub fn with_gpt_drive_sectors(mut self, gpt_drive_sectors: u64) -> Self {
        self.gpt_drive_sectors = gpt_drive_sectors;
        self
    }

    /// Attaches a console for diagnostic messages.
    pub fn with_console(mut self, console: &'a mut dyn Write) -> Self {
        self.console = Some(console);
        self
    }

    fn console(&mut self) -> Option<&mut dyn Write> {
        match self.console.as_mut() {
            Some(c) => Some(&mut **c),
            _ => None,
        }
    }

    /// Validates both copies, repairs whichever is damaged, and resets kernel selection.
    ///
    /// Fails only when a parameter is invalid or when neither copy of the header or of the
    /// entries is usable. On success [GptData::modified] reports the buffers that were rewritten.
    pub fn init(&mut self) -> Result<()> {
        self.sanity_check()?;
        self.modified = Modified::empty();
        self.gpt_repair();
        self.current_kernel = None;
        self.current_priority = NO_PRIORITY;
        Ok(())
    }

    /// Copies that passed the last validation (or were restored by repair).
    pub fn valid_headers(&self) -> CopyMask {
        self.valid_headers
    }

    /// Entry arrays that passed the last validation (or were restored by repair).
    pub fn valid_entries(&self) -> CopyMask {
        self.valid_entries
    }

    /// Copies whose header carries the "IGNOREME" signature.
    pub fn ignored(&self) -> CopyMask {
        self.ignored
    }

    /// Buffers that must be written back to disk.
    pub fn modified(&self) -> Modified {
        self.modified
    }

    /// Forgets pending modifications, e.g. after the caller persisted them.
    pub fn clear_modified(&mut self) {
        self.modified = Modified::empty();
    }

    /// Index of the selected kernel entry.
    pub fn current_kernel(&self) -> Option<usize> {
        self.current_kernel
    }

    /// Priority of the last selected kernel, [NO_PRIORITY] before the first selection, or 0 once
    /// candidates are exhausted.
    pub fn current_priority(&self) -> u8 {
        self.current_priority
    }

    /// Returns the header of the given copy.
    pub fn header(&self, copy: GptCopy) -> &GptHeader {
        match copy {
            GptCopy::Primary => &*self.primary_header,
            GptCopy::Secondary => &*self.secondary_header,
        }
    }

    /// Returns the mutable header of the given copy. The caller is responsible for calling
    /// [GptData::sync_from_primary] or refreshing CRCs afterwards.
    pub fn header_mut(&mut self, copy: GptCopy) -> &mut GptHeader {
        match copy {
            GptCopy::Primary => &mut *self.primary_header,
            GptCopy::Secondary => &mut *self.secondary_header,
        }
    }

    /// Returns the whole fixed entries region of the given copy.
    pub fn entries(&self, copy: GptCopy) -> &[GptEntry] {
        match copy {
            GptCopy::Primary => &*self.primary_entries,
            GptCopy::Secondary => &*self.secondary_entries,
        }
    }

    /// Returns the whole mutable entries region of the given copy.
    pub fn entries_mut(&mut self, copy: GptCopy) -> &mut [GptEntry] {
        match copy {
            GptCopy::Primary => &mut *self.primary_entries,
            GptCopy::Secondary => &mut *self.secondary_entries,
        }
    }

    /// The copy that kernel selection reads and updates: the primary unless it is ignored.
    pub fn authoritative_copy(&self) -> GptCopy {
        match self.ignored.contains(CopyMask::PRIMARY) {
            true => GptCopy::Secondary,
            _ => GptCopy::Primary,
        }
    }

    /// Number of entries declared by the authoritative header, bounded by the buffer.
    pub fn entry_count(&self) -> usize {
        let copy = self.authoritative_copy();
        let declared = usize::try_from(self.header(copy).number_of_entries).unwrap_or(usize::MAX);
        declared.min(self.entries(copy).len())
    }

    /// Returns the entry at `index` in the authoritative copy.
    pub fn entry(&self, index: usize) -> Result<&GptEntry> {
        let count = self.entry_count();
        self.entries(self.authoritative_copy())[..count].get(index).ok_or(Error::NotFound)
    }

    /// Returns the unique GUID of the selected kernel entry.
    pub fn current_kernel_unique_guid(&self) -> Result<Guid> {
        let index = self.current_kernel.ok_or(Error::NotFound)?;
        Ok(self.entry(index)?.unique_guid)
    }
}
