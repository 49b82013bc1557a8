// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process descriptors and the fixed slot table.
//!
//! A descriptor exclusively owns its page table. Slot 0 is never handed out; pids double as
//! slot indices.

use log::{info, warn};
use thiserror::Error;

use crate::config::MachineConfig;
use crate::context::{KernelContext, NodePolicy};
use crate::image::ProgramImages;
use crate::loader::{load_program, LoadError};
use crate::page_table::{MapError, PageFlags, PageTable};
use crate::physical::{Owner, PhysError, Pid, PAGE_SIZE};

/// Saved register snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

/// Scheduling state of a slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProcState {
    /// Slot unused.
    #[default]
    Free,
    Runnable,
    Blocked,
    /// Hit an irrecoverable fault.
    Broken,
}

/// A process descriptor.
#[derive(Debug, Default)]
pub struct Process {
    pid: Pid,
    pub state: ProcState,
    pub registers: Registers,
    pub(crate) page_table: Option<PageTable>,
}

impl Process {
    /// Wraps an existing table. The process starts out blocked until it has been loaded.
    pub fn with_page_table(pid: Pid, page_table: PageTable) -> Self {
        Self { pid, state: ProcState::Blocked, registers: Registers::default(), page_table: Some(page_table) }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn page_table(&self) -> Option<&PageTable> {
        self.page_table.as_ref()
    }

    /// Ledger owner for pages of this process.
    pub fn owner(&self) -> Owner {
        Owner::Process(self.pid)
    }
}

/// Errors raised by [`ProcessTable`] operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProcessError {
    #[error("pid {0} is not a usable process slot")]
    InvalidPid(Pid),
    #[error("process slot {0} is in use")]
    SlotInUse(Pid),
    #[error("process slot {0} is free")]
    SlotFree(Pid),
    #[error("no free page for the stack of pid {0}")]
    OutOfMemory(Pid),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Phys(#[from] PhysError),
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Fixed array of process slots.
#[derive(Debug)]
pub struct ProcessTable {
    slots: Vec<Process>,
}

impl ProcessTable {
    /// Creates `nproc` free slots.
    pub fn new(nproc: usize) -> Self {
        let slots = (0..nproc)
            .map_while(|pid| Pid::try_from(pid).ok())
            .map(|pid| Process { pid, ..Process::default() })
            .collect();
        Self { slots }
    }

    /// Creates one free slot per process the machine supports.
    pub fn for_config(config: &MachineConfig) -> Self {
        Self::new(config.nproc)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(usize::from(pid))
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(usize::from(pid))
    }

    /// Processes ready to run, in pid order.
    pub fn runnable(&self) -> impl Iterator<Item = &Process> + '_ {
        self.slots.iter().filter(|process| process.state == ProcState::Runnable)
    }

    fn slot_mut(&mut self, pid: Pid) -> Result<&mut Process, ProcessError> {
        match self.slots.get_mut(usize::from(pid)) {
            Some(slot) if pid != 0 => Ok(slot),
            _ => Err(ProcessError::InvalidPid(pid)),
        }
    }

    /// Gives free slot `pid` a fresh page table sharing the kernel mappings below
    /// `process_start`. The process stays blocked.
    pub fn spawn(&mut self, ctx: &mut KernelContext, pid: Pid) -> Result<(), ProcessError> {
        let slot = self.slot_mut(pid)?;
        if slot.state != ProcState::Free {
            return Err(ProcessError::SlotInUse(pid));
        }
        let owner = Owner::Process(pid);
        let mut table = ctx.create_table(owner)?;
        let process_start = ctx.config.process_start;
        let kernel_leaves = ctx.kernel_table.leaves(&ctx.memory);
        for (va, mapping) in kernel_leaves.into_iter().take_while(|(va, _)| *va < process_start) {
            let policy = NodePolicy::Claim(owner);
            if let Err(err) = ctx.map(&mut table, va, mapping.pa, PAGE_SIZE, mapping.perm, policy) {
                ctx.pages.release_all(owner);
                return Err(err.into());
            }
        }
        *slot = Process::with_page_table(pid, table);
        Ok(())
    }

    /// Spawns `pid`, loads program `index` into it and gives it a stack page at the top of
    /// virtual memory. On success the process is runnable; on failure the slot is torn down.
    pub fn setup(
        &mut self,
        ctx: &mut KernelContext,
        pid: Pid,
        images: &ProgramImages,
        index: usize,
    ) -> Result<(), ProcessError> {
        self.spawn(ctx, pid)?;
        let result = self.slot_mut(pid).and_then(|process| finish_setup(ctx, process, images, index));
        if let Err(err) = result {
            warn!(target: "proc", "pid {pid}: setup failed: {err}");
            self.teardown(ctx, pid)?;
            return Err(err);
        }
        info!(target: "proc", "pid {pid}: runnable with program {index}");
        Ok(())
    }

    /// Frees slot `pid` and every page its process owns. Returns the number of pages released.
    pub fn teardown(&mut self, ctx: &mut KernelContext, pid: Pid) -> Result<usize, ProcessError> {
        let slot = self.slot_mut(pid)?;
        if slot.state == ProcState::Free {
            return Err(ProcessError::SlotFree(pid));
        }
        if let Some(table) = slot.page_table.take() {
            if ctx.is_active(&table) {
                ctx.activate_kernel();
            }
        }
        let released = ctx.pages.release_all(Owner::Process(pid));
        *slot = Process { pid, ..Process::default() };
        info!(target: "proc", "pid {pid}: torn down, {released} pages released");
        Ok(released)
    }
}

fn finish_setup(
    ctx: &mut KernelContext,
    process: &mut Process,
    images: &ProgramImages,
    index: usize,
) -> Result<(), ProcessError> {
    load_program(ctx, process, images, index)?;

    let pid = process.pid;
    let owner = process.owner();
    let stack_page = ctx.pages.find_free().ok_or(ProcessError::OutOfMemory(pid))?;
    ctx.pages.claim(stack_page, owner)?;
    ctx.memory.zero_frame(stack_page);
    let stack_top = ctx.config.virtual_size;
    let table = process.page_table.as_mut().ok_or(LoadError::NoPageTable(pid))?;
    ctx.map(
        table,
        stack_top - PAGE_SIZE,
        stack_page.address(),
        PAGE_SIZE,
        PageFlags::USER_RW,
        NodePolicy::Claim(owner),
    )?;
    process.registers.rsp = stack_top as u64;
    process.state = ProcState::Runnable;
    Ok(())
}
