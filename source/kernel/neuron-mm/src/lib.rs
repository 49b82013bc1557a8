// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Memory management and program loading for the NEURON teaching kernel.
//!
//! Physical memory is modeled as an arena of 4 KiB frames owned by an explicit
//! [`KernelContext`]. Four-level page tables live in those frames and are addressed by page
//! number, so the whole mapping path runs (and is tested) on the host.

#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod address_space;
pub mod config;
pub mod context;
pub mod image;
pub mod loader;
pub mod memory;
pub mod page_table;
pub mod physical;
pub mod process;

pub use address_space::{AccessError, MappingInvariant};
pub use config::{ConfigError, MachineConfig, Region};
pub use context::{BootError, KernelContext, NodePolicy, OwnershipViolation};
pub use image::{ExecutableImage, ImageError, ProgramImages, Segment, ELF_MAGIC};
pub use loader::{load, load_program, LoadError};
pub use memory::PhysicalMemory;
pub use page_table::{
    ClaimingNodes, MapError, NodeAllocator, PageFlags, PageTable, PrebuiltNodes, VaMapping,
};
pub use physical::{Owner, PageNumber, PhysError, PhysicalPages, Pid, PAGE_SIZE};
pub use process::{ProcState, Process, ProcessError, ProcessTable, Registers};
