// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Simulated physical memory: a flat arena of page frames.
//!
//! Page-table nodes live in these frames like any other page, addressed by their
//! [`PageNumber`]; entries are stored as little-endian 64-bit words.

use byteorder::{ByteOrder, LittleEndian};

use crate::physical::{PageNumber, PAGE_SIZE};

/// Size of one page-table entry in bytes.
pub const ENTRY_SIZE: usize = core::mem::size_of::<u64>();

/// Byte-addressable physical memory backing every frame.
#[derive(Clone)]
pub struct PhysicalMemory {
    bytes: Vec<u8>,
}

impl core::fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysicalMemory").field("size", &self.bytes.len()).finish()
    }
}

impl PhysicalMemory {
    /// Allocates `size` bytes of zeroed memory. `size` is rounded down to whole pages.
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0; size - size % PAGE_SIZE] }
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Number of frames.
    pub fn page_count(&self) -> usize {
        self.bytes.len() / PAGE_SIZE
    }

    /// Whether `page` is backed by memory.
    pub fn contains(&self, page: PageNumber) -> bool {
        page.get() < self.page_count()
    }

    /// Borrows the frame for `page`.
    pub fn frame(&self, page: PageNumber) -> Option<&[u8]> {
        let start = page.get().checked_mul(PAGE_SIZE)?;
        self.bytes.get(start..start + PAGE_SIZE)
    }

    /// Mutably borrows the frame for `page`.
    pub fn frame_mut(&mut self, page: PageNumber) -> Option<&mut [u8]> {
        let start = page.get().checked_mul(PAGE_SIZE)?;
        self.bytes.get_mut(start..start + PAGE_SIZE)
    }

    /// Clears a frame. Returns false when `page` is not backed.
    pub fn zero_frame(&mut self, page: PageNumber) -> bool {
        match self.frame_mut(page) {
            Some(frame) => {
                frame.fill(0);
                true
            }
            None => false,
        }
    }

    /// Borrows `len` bytes at physical address `pa`.
    pub fn read_bytes(&self, pa: usize, len: usize) -> Option<&[u8]> {
        self.bytes.get(pa..pa.checked_add(len)?)
    }

    /// Copies `src` to physical address `pa`. Returns false when the range is not backed.
    pub fn write_bytes(&mut self, pa: usize, src: &[u8]) -> bool {
        let Some(end) = pa.checked_add(src.len()) else {
            return false;
        };
        match self.bytes.get_mut(pa..end) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Sets `len` bytes at `pa` to `value`. Returns false when the range is not backed.
    pub fn fill_bytes(&mut self, pa: usize, value: u8, len: usize) -> bool {
        let Some(end) = pa.checked_add(len) else {
            return false;
        };
        match self.bytes.get_mut(pa..end) {
            Some(dst) => {
                dst.fill(value);
                true
            }
            None => false,
        }
    }

    /// Reads entry `index` of the table stored in frame `table`; unbacked frames read as zero.
    pub(crate) fn read_entry(&self, table: PageNumber, index: usize) -> u64 {
        self.frame(table)
            .and_then(|frame| frame.get(index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE))
            .map_or(0, LittleEndian::read_u64)
    }

    /// Writes entry `index` of the table stored in frame `table`.
    pub(crate) fn write_entry(&mut self, table: PageNumber, index: usize, value: u64) {
        let slot = self
            .frame_mut(table)
            .and_then(|frame| frame.get_mut(index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE));
        debug_assert!(slot.is_some(), "page-table node {table} is not backed by memory");
        if let Some(slot) = slot {
            LittleEndian::write_u64(slot, value);
        }
    }
}
