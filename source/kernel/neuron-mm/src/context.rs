// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel memory context owning the owner ledger, physical memory and the active table
//! OWNERS: @kernel-mm-team
//! PUBLIC API: KernelContext{boot,map,map_kernel,lookup,create_table,audit_table}, NodePolicy
//! DEPENDS_ON: config, physical, memory, page_table
//! INVARIANTS: The active root always passes kernel-mapping verification; every table node is a
//!             claimed page

use log::{debug, info};
use thiserror::Error;

use crate::config::{ConfigError, MachineConfig};
use crate::memory::PhysicalMemory;
use crate::page_table::{
    ClaimingNodes, MapError, PageFlags, PageTable, PrebuiltNodes, VaMapping,
};
use crate::physical::{Owner, PageNumber, PhysError, PhysicalPages, PAGE_SIZE};

/// Pages rendered per line by [`KernelContext::memory_map`].
const MAP_PAGES_PER_LINE: usize = 64;

/// Errors raised while bringing up a [`KernelContext`].
#[derive(Debug, Error)]
pub enum BootError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("boot reservation failed: {0}")]
    Phys(#[from] PhysError),
    #[error("kernel page table construction failed: {0}")]
    Map(#[from] MapError),
}

/// Selects where interior nodes come from when mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodePolicy {
    /// Only existing nodes may be used.
    Prebuilt,
    /// Missing nodes are claimed for the given owner.
    Claim(Owner),
}

/// Page-table node or leaf that breaks the ownership rules.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum OwnershipViolation {
    #[error("table node {page} is owned by {owner}")]
    Node { page: PageNumber, owner: Owner },
    #[error("{va:#x} maps page {page} owned by {owner}")]
    Leaf { va: usize, page: PageNumber, owner: Owner },
}

/// Explicit owner of every piece of process-wide memory state.
#[derive(Debug)]
pub struct KernelContext {
    pub(crate) config: MachineConfig,
    pub(crate) pages: PhysicalPages,
    pub(crate) memory: PhysicalMemory,
    pub(crate) kernel_table: PageTable,
    pub(crate) active: PageNumber,
}

impl KernelContext {
    /// Builds the owner ledger and the kernel page table for `config` and activates it.
    ///
    /// All of physical memory is identity mapped: kernel-only below `process_start`, user
    /// accessible above it. The null page stays unmapped.
    pub fn boot(config: MachineConfig) -> Result<Self, BootError> {
        config.validate()?;
        let mut pages = PhysicalPages::new(config.physical_pages());
        let mut memory = PhysicalMemory::new(config.physical_size);

        for region in &config.reserved {
            pages.reserve_range(region.start, region.end)?;
        }
        let mut addr = config.kernel_start;
        while addr < config.kernel_end {
            pages.claim(PageNumber::containing(addr), Owner::Kernel)?;
            addr += PAGE_SIZE;
        }
        pages.claim(PageNumber::containing(config.kernel_stack_page()), Owner::Kernel)?;

        let mut nodes = ClaimingNodes::new(&mut pages, Owner::Kernel);
        let mut kernel_table = PageTable::create(&mut memory, &mut nodes)?;
        let low = config.process_start;
        kernel_table.map(&mut memory, 0, 0, low, PageFlags::KERNEL_RW, &mut nodes)?;
        kernel_table.map(
            &mut memory,
            low,
            low,
            config.physical_size - low,
            PageFlags::USER_RW,
            &mut nodes,
        )?;
        kernel_table.map(&mut memory, 0, 0, PAGE_SIZE, PageFlags::empty(), &mut nodes)?;
        let node_count = nodes.claimed().len();

        let active = kernel_table.root();
        info!(
            target: "mm",
            "boot: {} pages, {} free, kernel table {} ({} nodes)",
            pages.page_count(),
            pages.free_count(),
            active,
            node_count
        );
        Ok(Self { config, pages, memory, kernel_table, active })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn pages(&self) -> &PhysicalPages {
        &self.pages
    }

    /// Mutable ledger access for collaborators (boot-time reservations, teardown).
    pub fn pages_mut(&mut self) -> &mut PhysicalPages {
        &mut self.pages
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    /// The kernel's own page table.
    pub fn kernel_table(&self) -> &PageTable {
        &self.kernel_table
    }

    /// Root page of the currently active table.
    pub fn active_root(&self) -> PageNumber {
        self.active
    }

    /// Number of free physical pages.
    pub fn free_count(&self) -> usize {
        self.pages.free_count()
    }

    /// Maps a range into `table`, drawing interior nodes according to `policy`.
    pub fn map(
        &mut self,
        table: &mut PageTable,
        va: usize,
        pa: usize,
        size: usize,
        perm: PageFlags,
        policy: NodePolicy,
    ) -> Result<(), MapError> {
        map_with(&mut self.memory, &mut self.pages, table, va, pa, size, perm, policy)
    }

    /// Maps a range into the kernel table.
    pub fn map_kernel(
        &mut self,
        va: usize,
        pa: usize,
        size: usize,
        perm: PageFlags,
        policy: NodePolicy,
    ) -> Result<(), MapError> {
        map_with(&mut self.memory, &mut self.pages, &mut self.kernel_table, va, pa, size, perm, policy)
    }

    /// Translates `va` through `table`.
    pub fn lookup(&self, table: &PageTable, va: usize) -> VaMapping {
        table.lookup(&self.memory, va)
    }

    /// Creates an empty table whose root is claimed for `owner`.
    pub fn create_table(&mut self, owner: Owner) -> Result<PageTable, MapError> {
        let table = PageTable::create(&mut self.memory, &mut ClaimingNodes::new(&mut self.pages, owner))?;
        debug!(target: "pt", "new table {} for {owner}", table.root());
        Ok(table)
    }

    /// Checks that `table` only references pages it may reference.
    ///
    /// Node pages must belong to `owner` or the kernel. For process tables, every present leaf at
    /// or above `process_start` must point at a page owned by the process, the kernel, or a
    /// reserved page.
    pub fn audit_table(&self, table: &PageTable, owner: Owner) -> Result<(), OwnershipViolation> {
        for page in table.node_pages(&self.memory) {
            let found = self.pages.owner(page).unwrap_or(Owner::Free);
            if found != owner && found != Owner::Kernel {
                return Err(OwnershipViolation::Node { page, owner: found });
            }
        }
        if !matches!(owner, Owner::Process(_)) {
            return Ok(());
        }
        for (va, mapping) in table.leaves(&self.memory) {
            if va < self.config.process_start {
                continue;
            }
            let page = PageNumber::new(mapping.pn);
            let found = self.pages.owner(page).unwrap_or(Owner::Free);
            if found != owner && !matches!(found, Owner::Kernel | Owner::Reserved) {
                return Err(OwnershipViolation::Leaf { va, page, owner: found });
            }
        }
        Ok(())
    }

    /// One character per physical page: `.` free, `R` reserved, `K` kernel, a digit per pid.
    pub fn memory_map(&self) -> String {
        self.pages.render_map(MAP_PAGES_PER_LINE)
    }
}

#[allow(clippy::too_many_arguments)]
fn map_with(
    memory: &mut PhysicalMemory,
    pages: &mut PhysicalPages,
    table: &mut PageTable,
    va: usize,
    pa: usize,
    size: usize,
    perm: PageFlags,
    policy: NodePolicy,
) -> Result<(), MapError> {
    match policy {
        NodePolicy::Prebuilt => table.map(memory, va, pa, size, perm, &mut PrebuiltNodes),
        NodePolicy::Claim(owner) => {
            table.map(memory, va, pa, size, perm, &mut ClaimingNodes::new(pages, owner))
        }
    }
}
