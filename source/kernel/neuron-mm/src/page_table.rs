// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Four-level x86-64 style page tables with lazy allocation of interior levels.
//!
//! Every node is one physical page inside [`PhysicalMemory`]; a [`PageTable`] is only the
//! handle of its root page. Interior nodes come from a caller-selected [`NodeAllocator`].

use bitflags::bitflags;
use log::debug;
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::memory::{PhysicalMemory, ENTRY_SIZE};
use crate::physical::{
    is_page_aligned, Owner, PageNumber, PhysicalPages, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE,
};

/// Number of index bits consumed per level.
pub const PAGE_INDEX_BITS: usize = 9;
/// Entries per page-table node.
pub const PT_ENTRIES: usize = 1 << PAGE_INDEX_BITS;
/// Depth of the tree.
pub const PT_LEVELS: usize = 4;
/// First virtual address beyond the range four levels can translate.
pub const VA_LIMIT: usize = 1 << (PAGE_SHIFT + PT_LEVELS * PAGE_INDEX_BITS);

const_assert_eq!(PT_ENTRIES * ENTRY_SIZE, PAGE_SIZE);

/// Physical-address bits of an entry.
const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Flags stored in the low bits of a page-table entry.
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

impl PageFlags {
    /// Kernel-only read/write.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);
    /// User-accessible read/write.
    pub const USER_RW: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
    /// Bits that combine across levels into the effective permission.
    const ACCESS: Self = Self::USER_RW;
    /// Interior entries never restrict access; leaves decide.
    const INTERIOR: Self = Self::USER_RW;
}

/// Error returned by mapping operations.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address, physical address or size is not a page multiple.
    #[error("{0:#x} is not page aligned")]
    Unaligned(usize),
    /// Virtual range wraps or extends past what four levels translate.
    #[error("virtual range {va:#x}+{size:#x} is not translatable")]
    OutOfRange { va: usize, size: usize },
    /// Physical range extends past the end of memory.
    #[error("physical range {pa:#x}+{size:#x} is outside memory")]
    PhysicalOutOfRange { pa: usize, size: usize },
    /// The node allocator had no page for an interior node.
    #[error("no page available for a page-table node covering {va:#x}")]
    AllocationFailed { va: usize },
}

/// Result of [`PageTable::lookup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VaMapping {
    /// Physical page number; `usize::MAX` when unmapped.
    pub pn: usize,
    /// Physical address including the page offset; `usize::MAX` when unmapped.
    pub pa: usize,
    /// PRESENT/WRITABLE/USER bits granted by every level; empty when unmapped.
    pub perm: PageFlags,
}

impl VaMapping {
    /// Sentinel for a virtual address with no present mapping.
    pub const UNMAPPED: Self = Self { pn: usize::MAX, pa: usize::MAX, perm: PageFlags::empty() };

    /// Whether a present leaf was found.
    pub fn is_mapped(&self) -> bool {
        self.perm.contains(PageFlags::PRESENT)
    }

    /// Mapped physical page, if any.
    pub fn page(&self) -> Option<PageNumber> {
        self.is_mapped().then_some(PageNumber::new(self.pn))
    }
}

#[derive(Clone, Copy)]
struct Entry(u64);

impl Entry {
    fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    fn address(self) -> usize {
        (self.0 & ADDRESS_MASK) as usize
    }

    fn page(self) -> PageNumber {
        PageNumber::containing(self.address())
    }
}

/// Index into the node at `level` (0 = root) for `va`.
const fn page_index(va: usize, level: usize) -> usize {
    (va >> (PAGE_SHIFT + (PT_LEVELS - 1 - level) * PAGE_INDEX_BITS)) & (PT_ENTRIES - 1)
}

/// Bytes covered by one entry of a node at `level`.
const fn level_span(level: usize) -> usize {
    1 << (PAGE_SHIFT + (PT_LEVELS - 1 - level) * PAGE_INDEX_BITS)
}

/// Supplies pages for new interior nodes.
///
/// The table zeroes a returned page before linking it, so implementations only decide which
/// page (if any) to hand out.
pub trait NodeAllocator {
    /// Returns a page for a new node, or `None` when none can be provided.
    fn allocate_node(&mut self) -> Option<PageNumber>;
}

/// Allocator for tables whose interior levels were all built up front.
///
/// Any mapping that would need a new node fails with [`MapError::AllocationFailed`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PrebuiltNodes;

impl NodeAllocator for PrebuiltNodes {
    fn allocate_node(&mut self) -> Option<PageNumber> {
        None
    }
}

/// Allocator claiming free physical pages for `owner`.
///
/// Remembers every page it handed out so a caller can undo a partially built mapping.
#[derive(Debug)]
pub struct ClaimingNodes<'a> {
    pages: &'a mut PhysicalPages,
    owner: Owner,
    claimed: Vec<PageNumber>,
}

impl<'a> ClaimingNodes<'a> {
    /// Creates an allocator charging nodes to `owner`.
    pub fn new(pages: &'a mut PhysicalPages, owner: Owner) -> Self {
        Self { pages, owner, claimed: Vec::new() }
    }

    /// Pages claimed so far, in allocation order.
    pub fn claimed(&self) -> &[PageNumber] {
        &self.claimed
    }

    /// Consumes the allocator, returning the pages it claimed.
    pub fn into_claimed(self) -> Vec<PageNumber> {
        self.claimed
    }
}

impl NodeAllocator for ClaimingNodes<'_> {
    fn allocate_node(&mut self) -> Option<PageNumber> {
        let page = self.pages.find_free()?;
        self.pages.claim(page, self.owner).ok()?;
        self.claimed.push(page);
        Some(page)
    }
}

/// Handle to a page-table tree, identified by its root page.
///
/// Not `Clone`: the holder of the handle owns the table.
#[derive(Debug, PartialEq, Eq)]
pub struct PageTable {
    root: PageNumber,
}

impl PageTable {
    /// Allocates and zeroes a root node.
    pub fn create(
        memory: &mut PhysicalMemory,
        nodes: &mut dyn NodeAllocator,
    ) -> Result<Self, MapError> {
        let root = nodes.allocate_node().ok_or(MapError::AllocationFailed { va: 0 })?;
        if !memory.zero_frame(root) {
            return Err(MapError::AllocationFailed { va: 0 });
        }
        Ok(Self { root })
    }

    /// Page holding the root node.
    pub fn root(&self) -> PageNumber {
        self.root
    }

    /// Maps `[va, va + size)` to `[pa, pa + size)` with `perm`.
    ///
    /// Interior nodes missing along the way are requested from `nodes`. Without
    /// [`PageFlags::PRESENT`] in `perm` the range is unmapped instead and `pa` is ignored;
    /// unmapping never allocates. Re-mapping a page overwrites its leaf.
    ///
    /// On [`MapError::AllocationFailed`] the pages before the failing one stay mapped.
    pub fn map(
        &mut self,
        memory: &mut PhysicalMemory,
        va: usize,
        pa: usize,
        size: usize,
        perm: PageFlags,
        nodes: &mut dyn NodeAllocator,
    ) -> Result<(), MapError> {
        let present = perm.contains(PageFlags::PRESENT);
        for value in [va, size] {
            if !is_page_aligned(value) {
                return Err(MapError::Unaligned(value));
            }
        }
        if present && !is_page_aligned(pa) {
            return Err(MapError::Unaligned(pa));
        }
        if va.checked_add(size).map_or(true, |end| end > VA_LIMIT) {
            return Err(MapError::OutOfRange { va, size });
        }
        if present && pa.checked_add(size).map_or(true, |end| end > memory.size()) {
            return Err(MapError::PhysicalOutOfRange { pa, size });
        }

        let mut offset = 0;
        while offset < size {
            let addr = va + offset;
            if let Some((table, index)) = self.leaf_slot(memory, addr, present, nodes)? {
                let value = if present {
                    ((pa + offset) as u64 & ADDRESS_MASK) | perm.bits()
                } else {
                    0
                };
                memory.write_entry(table, index, value);
            }
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    /// Walks to the last-level node for `va`, creating interior nodes when `allocate` is set.
    fn leaf_slot(
        &mut self,
        memory: &mut PhysicalMemory,
        va: usize,
        allocate: bool,
        nodes: &mut dyn NodeAllocator,
    ) -> Result<Option<(PageNumber, usize)>, MapError> {
        let mut table = self.root;
        for level in 0..PT_LEVELS - 1 {
            let index = page_index(va, level);
            let entry = Entry(memory.read_entry(table, index));
            if entry.is_present() {
                table = entry.page();
                continue;
            }
            if !allocate {
                return Ok(None);
            }
            let node = nodes.allocate_node().ok_or(MapError::AllocationFailed { va })?;
            if !memory.zero_frame(node) {
                return Err(MapError::AllocationFailed { va });
            }
            memory.write_entry(table, index, node.address() as u64 | PageFlags::INTERIOR.bits());
            debug!(target: "pt", "table {}: level {} node {node} for {va:#x}", self.root, level + 1);
            table = node;
        }
        Ok(Some((table, page_index(va, PT_LEVELS - 1))))
    }

    /// Translates `va` without modifying the table.
    pub fn lookup(&self, memory: &PhysicalMemory, va: usize) -> VaMapping {
        translate(memory, self.root, va)
    }

    /// Every node page of the tree, root first.
    pub fn node_pages(&self, memory: &PhysicalMemory) -> Vec<PageNumber> {
        let mut out = vec![self.root];
        collect_nodes(memory, self.root, 0, &mut out);
        out
    }

    /// Every present leaf as `(virtual page address, mapping)`, in address order.
    pub fn leaves(&self, memory: &PhysicalMemory) -> Vec<(usize, VaMapping)> {
        let mut out = Vec::new();
        collect_leaves(memory, self.root, 0, 0, PageFlags::ACCESS, &mut out);
        out
    }

    /// Clears every interior entry pointing at one of `nodes`, cutting those subtrees loose.
    ///
    /// Returns the number of entries cleared. The pages themselves are left to the caller.
    pub(crate) fn detach_nodes(&mut self, memory: &mut PhysicalMemory, nodes: &[PageNumber]) -> usize {
        detach_below(memory, self.root, 0, nodes)
    }
}

/// Translates `va` through the tree rooted at `root`.
pub(crate) fn translate(memory: &PhysicalMemory, root: PageNumber, va: usize) -> VaMapping {
    if va >= VA_LIMIT {
        return VaMapping::UNMAPPED;
    }
    let mut table = root;
    let mut perm = PageFlags::ACCESS;
    for level in 0..PT_LEVELS {
        let entry = Entry(memory.read_entry(table, page_index(va, level)));
        if !entry.is_present() {
            return VaMapping::UNMAPPED;
        }
        perm &= entry.flags();
        table = entry.page();
    }
    let pa = table.address() + (va & PAGE_OFFSET_MASK);
    VaMapping { pn: table.get(), pa, perm }
}

fn collect_nodes(memory: &PhysicalMemory, table: PageNumber, level: usize, out: &mut Vec<PageNumber>) {
    if level == PT_LEVELS - 1 {
        return;
    }
    for index in 0..PT_ENTRIES {
        let entry = Entry(memory.read_entry(table, index));
        if entry.is_present() {
            out.push(entry.page());
            collect_nodes(memory, entry.page(), level + 1, out);
        }
    }
}

fn collect_leaves(
    memory: &PhysicalMemory,
    table: PageNumber,
    level: usize,
    base: usize,
    perm: PageFlags,
    out: &mut Vec<(usize, VaMapping)>,
) {
    for index in 0..PT_ENTRIES {
        let entry = Entry(memory.read_entry(table, index));
        if !entry.is_present() {
            continue;
        }
        let va = base + index * level_span(level);
        let perm = perm & entry.flags();
        if level == PT_LEVELS - 1 {
            let pa = entry.address();
            out.push((va, VaMapping { pn: pa >> PAGE_SHIFT, pa, perm }));
        } else {
            collect_leaves(memory, entry.page(), level + 1, va, perm, out);
        }
    }
}

fn detach_below(memory: &mut PhysicalMemory, table: PageNumber, level: usize, nodes: &[PageNumber]) -> usize {
    if level == PT_LEVELS - 1 {
        return 0;
    }
    let mut cleared = 0;
    for index in 0..PT_ENTRIES {
        let entry = Entry(memory.read_entry(table, index));
        if !entry.is_present() {
            continue;
        }
        if nodes.contains(&entry.page()) {
            memory.write_entry(table, index, 0);
            cleared += 1;
        } else {
            cleared += detach_below(memory, entry.page(), level + 1, nodes);
        }
    }
    cleared
}
