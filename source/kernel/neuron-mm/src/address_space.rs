// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Active address-space switching and memory access through the active table.

use log::{debug, error};
use thiserror::Error;

use crate::context::KernelContext;
use crate::page_table::{translate, PageFlags, PageTable};
use crate::physical::{PageNumber, PAGE_OFFSET_MASK, PAGE_SIZE};

/// Kernel mapping missing from a table that was about to become active.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MappingInvariant {
    #[error("kernel address {va:#x} is not mapped")]
    Unmapped { va: usize },
    #[error("kernel address {va:#x} maps to {found:#x}")]
    NotIdentity { va: usize, found: usize },
    #[error("kernel address {va:#x} lacks {missing:?}")]
    MissingPermission { va: usize, missing: PageFlags },
}

/// Errors raised when accessing virtual memory through the active table.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("virtual address {0:#x} is not mapped")]
    NotMapped(usize),
    #[error("virtual address {0:#x} is not writable")]
    NotWritable(usize),
    #[error("access {va:#x}+{len:#x} wraps the address space")]
    Overflow { va: usize, len: usize },
}

impl AccessError {
    /// Virtual address the access failed at.
    pub fn address(&self) -> usize {
        match *self {
            AccessError::NotMapped(va) | AccessError::NotWritable(va) => va,
            AccessError::Overflow { va, .. } => va,
        }
    }
}

/// Physical piece of a virtual range: `(pa, offset into the range, length)`.
type Chunk = (usize, usize, usize);

impl KernelContext {
    /// Verifies that `table` keeps the kernel image and kernel stack identity mapped and
    /// kernel-writable.
    pub fn check_kernel_mappings(&self, table: &PageTable) -> Result<(), MappingInvariant> {
        self.verify_root(table.root())
    }

    fn verify_root(&self, root: PageNumber) -> Result<(), MappingInvariant> {
        let stack = self.config.kernel_stack_page();
        let image = (self.config.kernel_start..self.config.kernel_end).step_by(PAGE_SIZE);
        for va in image.chain(core::iter::once(stack)) {
            let mapping = translate(&self.memory, root, va);
            if !mapping.is_mapped() {
                return Err(MappingInvariant::Unmapped { va });
            }
            if mapping.pa != va {
                return Err(MappingInvariant::NotIdentity { va, found: mapping.pa });
            }
            let missing = PageFlags::KERNEL_RW.difference(mapping.perm);
            if !missing.is_empty() {
                return Err(MappingInvariant::MissingPermission { va, missing });
            }
        }
        Ok(())
    }

    /// Makes `table` the active table.
    ///
    /// # Panics
    ///
    /// Panics when `table` does not preserve the kernel mappings: the kernel could not keep
    /// running on it, so this is fatal rather than recoverable.
    pub fn switch_active(&mut self, table: &PageTable) {
        self.install(table.root());
    }

    /// Makes the kernel's own table active again.
    pub fn activate_kernel(&mut self) {
        self.install(self.kernel_table.root());
    }

    /// Whether `table` is the active table.
    pub fn is_active(&self, table: &PageTable) -> bool {
        self.active == table.root()
    }

    fn install(&mut self, root: PageNumber) {
        if let Err(violation) = self.verify_root(root) {
            error!(target: "pt", "PT-VERIFY: table {root} rejected: {violation}");
            panic!("fatal mapping invariant: {violation}");
        }
        if self.active != root {
            debug!(target: "pt", "switch active table {} -> {root}", self.active);
        }
        self.active = root;
    }

    /// Copies `src` to virtual address `va` of the active address space.
    ///
    /// Every page touched must be mapped writable; nothing is written otherwise.
    pub fn write_active(&mut self, va: usize, src: &[u8]) -> Result<(), AccessError> {
        for (pa, offset, len) in self.translate_range(va, src.len(), true)? {
            if !self.memory.write_bytes(pa, &src[offset..offset + len]) {
                return Err(AccessError::NotMapped(va + offset));
            }
        }
        Ok(())
    }

    /// Sets `len` bytes at `va` of the active address space to `value`.
    pub fn fill_active(&mut self, va: usize, value: u8, len: usize) -> Result<(), AccessError> {
        for (pa, offset, chunk) in self.translate_range(va, len, true)? {
            if !self.memory.fill_bytes(pa, value, chunk) {
                return Err(AccessError::NotMapped(va + offset));
            }
        }
        Ok(())
    }

    /// Reads `len` bytes at `va` of the active address space.
    pub fn read_active(&self, va: usize, len: usize) -> Result<Vec<u8>, AccessError> {
        let mut out = Vec::with_capacity(len);
        for (pa, offset, chunk) in self.translate_range(va, len, false)? {
            let bytes = self.memory.read_bytes(pa, chunk).ok_or(AccessError::NotMapped(va + offset))?;
            out.extend_from_slice(bytes);
        }
        Ok(out)
    }

    fn translate_range(&self, va: usize, len: usize, write: bool) -> Result<Vec<Chunk>, AccessError> {
        if va.checked_add(len).is_none() {
            return Err(AccessError::Overflow { va, len });
        }
        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < len {
            let addr = va + offset;
            let chunk = (PAGE_SIZE - (addr & PAGE_OFFSET_MASK)).min(len - offset);
            let mapping = translate(&self.memory, self.active, addr);
            if !mapping.is_mapped() {
                return Err(AccessError::NotMapped(addr));
            }
            if write && !mapping.perm.contains(PageFlags::WRITABLE) {
                return Err(AccessError::NotWritable(addr));
            }
            chunks.push((mapping.pa, offset, chunk));
            offset += chunk;
        }
        Ok(chunks)
    }
}
