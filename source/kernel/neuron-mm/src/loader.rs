// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Identity-mapped executable loader with rollback
//! OWNERS: @kernel-mm-team
//! PUBLIC API: load, load_program, LoadError
//! DEPENDS_ON: image (parsing), context/address_space (mapping, active table), process
//! INVARIANTS: A failed load leaves the free-page count and every leaf of the process table
//!             exactly as before; the kernel table is active again whenever load returns

use log::{debug, info, warn};
use thiserror::Error;

use crate::context::KernelContext;
use crate::image::{ExecutableImage, ImageError, ProgramImages, Segment};
use crate::page_table::{ClaimingNodes, PageFlags, PageTable, PrebuiltNodes, VaMapping};
use crate::physical::{page_round_down, Owner, PageNumber, Pid, PAGE_SIZE};
use crate::process::Process;

/// Errors returned by [`load`] and [`load_program`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] ImageError),
    #[error("no program image {0}")]
    NoSuchImage(usize),
    #[error("pid {0} has no page table")]
    NoPageTable(Pid),
    /// Claiming, mapping or copying failed at `va`; everything done so far was undone.
    #[error("loading pid {pid} failed at {va:#x}")]
    LoadFailed { pid: Pid, va: usize },
}

/// Everything one load call changed, undone on failure.
#[derive(Debug, Default)]
struct Journal {
    /// Leaves as they were before the load rewrote them, in rewrite order.
    leaves: Vec<(usize, VaMapping)>,
    pages: Vec<PageNumber>,
    nodes: Vec<PageNumber>,
}

impl Journal {
    fn rollback(self, ctx: &mut KernelContext, table: &mut PageTable) {
        for (va, prior) in self.leaves.iter().rev() {
            let (pa, perm) = match prior.page() {
                Some(page) => (page.address(), prior.perm),
                None => (0, PageFlags::empty()),
            };
            if let Err(err) = table.map(&mut ctx.memory, *va, pa, PAGE_SIZE, perm, &mut PrebuiltNodes) {
                warn!(target: "loader", "rollback: restoring {va:#x} failed: {err}");
            }
        }
        for page in &self.pages {
            ctx.pages.release(*page);
        }
        table.detach_nodes(&mut ctx.memory, &self.nodes);
        for node in &self.nodes {
            ctx.pages.release(*node);
        }
        debug!(
            target: "loader",
            "rollback restored {} leaves, released {} pages and {} nodes",
            self.leaves.len(),
            self.pages.len(),
            self.nodes.len()
        );
    }
}

/// Loads image `index` of `images` into `process`.
pub fn load_program(
    ctx: &mut KernelContext,
    process: &mut Process,
    images: &ProgramImages,
    index: usize,
) -> Result<(), LoadError> {
    let bytes = images.get(index).ok_or(LoadError::NoSuchImage(index))?;
    load(ctx, process, bytes)
}

/// Loads the executable `bytes` into `process` and points its instruction pointer at the entry.
///
/// Every page a loadable segment touches is claimed for the process and identity mapped
/// user-writable. A page already owned by the same process and already identity mapped in its
/// table is reused; any other owned page fails the load. File bytes are copied to the exact
/// segment address and the remainder of the in-memory size is zero filled.
pub fn load(ctx: &mut KernelContext, process: &mut Process, bytes: &[u8]) -> Result<(), LoadError> {
    let image = ExecutableImage::parse(bytes)?;
    let pid = process.pid();
    let owner = process.owner();
    let table = process.page_table.as_mut().ok_or(LoadError::NoPageTable(pid))?;

    let mut journal = Journal::default();
    for segment in image.segments() {
        if let Err(va) = map_segment(ctx, table, owner, segment, &mut journal) {
            journal.rollback(ctx, table);
            warn!(target: "loader", "pid {pid}: cannot map {va:#x}, load rolled back");
            return Err(LoadError::LoadFailed { pid, va });
        }
    }

    ctx.switch_active(table);
    let copied = copy_segments(ctx, &image);
    ctx.activate_kernel();
    if let Err(va) = copied {
        journal.rollback(ctx, table);
        warn!(target: "loader", "pid {pid}: cannot fill {va:#x}, load rolled back");
        return Err(LoadError::LoadFailed { pid, va });
    }

    process.registers.rip = image.entry() as u64;
    info!(
        target: "loader",
        "pid {pid}: loaded {} segments, entry {:#x}",
        image.segments().len(),
        image.entry()
    );
    Ok(())
}

/// Maps every page of `segment`; returns the failing address on error.
fn map_segment(
    ctx: &mut KernelContext,
    table: &mut PageTable,
    owner: Owner,
    segment: &Segment,
    journal: &mut Journal,
) -> Result<(), usize> {
    let mut addr = page_round_down(segment.va);
    while addr < segment.end() {
        let page = PageNumber::containing(addr);
        let prior = table.lookup(&ctx.memory, addr);
        if ctx.pages.owner(page) == Some(owner) && prior.pa == addr {
            journal.leaves.push((addr, prior));
            table
                .map(&mut ctx.memory, addr, addr, PAGE_SIZE, PageFlags::USER_RW, &mut PrebuiltNodes)
                .map_err(|_| addr)?;
        } else {
            if let Err(err) = ctx.pages.claim(page, owner) {
                debug!(target: "loader", "{owner}: {err}");
                return Err(addr);
            }
            journal.pages.push(page);
            journal.leaves.push((addr, prior));
            let mut nodes = ClaimingNodes::new(&mut ctx.pages, owner);
            let mapped =
                table.map(&mut ctx.memory, addr, addr, PAGE_SIZE, PageFlags::USER_RW, &mut nodes);
            journal.nodes.extend(nodes.into_claimed());
            if let Err(err) = mapped {
                debug!(target: "loader", "{owner}: {err}");
                return Err(addr);
            }
        }
        addr += PAGE_SIZE;
    }
    Ok(())
}

/// Copies file bytes and zero fills the tail of every segment through the active table.
fn copy_segments(ctx: &mut KernelContext, image: &ExecutableImage<'_>) -> Result<(), usize> {
    for segment in image.segments() {
        ctx.write_active(segment.va, image.data(segment)).map_err(|err| err.address())?;
        ctx.fill_active(segment.va + segment.file_size, 0, segment.mem_size - segment.file_size)
            .map_err(|err| err.address())?;
    }
    Ok(())
}
