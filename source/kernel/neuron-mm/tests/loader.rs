// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for loading ELF64 images into process address spaces
//! OWNERS: @kernel-mm-team
//!
//! TEST_SCOPE:
//!   - Segment mapping, file copy and zero fill
//!   - Rollback of data pages and page-table nodes on failure
//!   - Same-process overlap tolerance, cross-process conflicts
//!   - Process setup and teardown through ProcessTable
//!
//! DEPENDENCIES:
//!   - common::elf: byteorder-assembled ELF64 fixtures

mod common;

use common::{boot, elf, SegmentSpec, PT_GNU_STACK};
use neuron_mm::{
    load, ImageError, LoadError, Owner, PageFlags, PageNumber, ProcState, Process, ProcessTable,
    ProgramImages, PAGE_SIZE,
};

fn spawned(ctx: &mut neuron_mm::KernelContext, procs: &mut ProcessTable, pid: u16) -> Process {
    procs.spawn(ctx, pid).expect("spawn");
    let slot = procs.get_mut(pid).expect("slot");
    std::mem::take(slot)
}

#[test]
fn trailing_bytes_read_as_zero() {
    let mut ctx = boot();
    let mut procs = ProcessTable::new(4);
    let mut process = spawned(&mut ctx, &mut procs, 1);
    ctx.fill_active(0x11_0000, 0xaa, 2 * PAGE_SIZE).expect("dirty");

    let image = elf(0x11_0010, &[SegmentSpec::load(0x11_0010, b"hello", 0x1800)]);
    load(&mut ctx, &mut process, image).expect("load");

    assert_eq!(process.registers.rip, 0x11_0010);
    assert_eq!(ctx.active_root(), ctx.kernel_table().root());
    assert_eq!(ctx.read_active(0x11_0010, 5).expect("read"), b"hello");
    let tail = ctx.read_active(0x11_0015, 0x1800 - 5).expect("read");
    assert!(tail.iter().all(|byte| *byte == 0));

    let table = process.page_table().expect("table");
    for va in [0x11_0000, 0x11_1000] {
        let mapping = ctx.lookup(table, va);
        assert_eq!(mapping.pa, va);
        assert_eq!(mapping.perm, PageFlags::USER_RW);
        assert_eq!(ctx.pages().owner(PageNumber::containing(va)), Some(Owner::Process(1)));
    }
    assert!(!ctx.lookup(table, 0x11_2000).is_mapped());
    assert_eq!(ctx.audit_table(table, process.owner()), Ok(()));
}

#[test]
fn memory_only_segment_is_allocated_and_zeroed() {
    let mut ctx = boot();
    let mut procs = ProcessTable::new(4);
    let mut process = spawned(&mut ctx, &mut procs, 1);
    ctx.fill_active(0x12_0000, 0x55, 2 * PAGE_SIZE).expect("dirty");

    let image = elf(0x12_0000, &[SegmentSpec::load(0x12_0000, &[], 0x2000)]);
    load(&mut ctx, &mut process, image).expect("load");
    let bytes = ctx.read_active(0x12_0000, 0x2000).expect("read");
    assert!(bytes.iter().all(|byte| *byte == 0));
    assert_eq!(ctx.pages().pages_owned_by(Owner::Process(1)).count(), 4 + 2);
}

#[test]
fn overlapping_segments_of_one_process_share_pages() {
    let mut ctx = boot();
    let mut procs = ProcessTable::new(4);
    let mut process = spawned(&mut ctx, &mut procs, 1);

    let image = elf(
        0x13_0000,
        &[
            SegmentSpec::load(0x13_0000, &[1; 0x10], 0x1010),
            SegmentSpec::other(PT_GNU_STACK, 0xdead_b000),
            SegmentSpec::load(0x13_1800, &[2; 8], 0x800),
        ],
    );
    load(&mut ctx, &mut process, image).expect("load");
    assert_eq!(ctx.read_active(0x13_0000, 0x10).expect("read"), vec![1; 0x10]);
    assert_eq!(ctx.read_active(0x13_1000, 0x10).expect("read"), vec![0; 0x10]);
    assert_eq!(ctx.read_active(0x13_1800, 8).expect("read"), vec![2; 8]);
    assert_eq!(ctx.pages().pages_owned_by(Owner::Process(1)).count(), 4 + 2);

    // A second load of an image touching the same pages reuses them as well.
    let again = elf(0x13_1000, &[SegmentSpec::load(0x13_1000, &[3; 4], 4)]);
    load(&mut ctx, &mut process, again).expect("reload");
    assert_eq!(ctx.read_active(0x13_1000, 4).expect("read"), vec![3; 4]);
    assert_eq!(ctx.pages().pages_owned_by(Owner::Process(1)).count(), 4 + 2);
}

#[test]
fn invalid_magic_performs_no_claims() {
    let mut ctx = boot();
    let mut procs = ProcessTable::new(4);
    let mut process = spawned(&mut ctx, &mut procs, 1);
    let free = ctx.free_count();

    let mut image = elf(0x10_0000, &[SegmentSpec::load(0x10_0000, b"code", 4)]).to_vec();
    image[0] = 0x7e;
    let err = load(&mut ctx, &mut process, &image).expect_err("bad magic");
    assert!(matches!(err, LoadError::InvalidImage(ImageError::BadMagic(_))));
    assert_eq!(ctx.free_count(), free);
}

#[test]
fn malformed_segment_is_invalid_image() {
    let mut ctx = boot();
    let mut procs = ProcessTable::new(4);
    let mut process = spawned(&mut ctx, &mut procs, 1);
    let image = elf(0x10_0000, &[SegmentSpec::load(0x10_0000, &[0; 0x10], 8)]);
    assert_eq!(
        load(&mut ctx, &mut process, image),
        Err(LoadError::InvalidImage(ImageError::BadSegment {
            index: 0,
            reason: "file size exceeds memory size",
        }))
    );
}

#[test]
fn exhaustion_rolls_back_every_claim() {
    let mut ctx = boot();
    let mut procs = ProcessTable::new(16);
    let mut process = spawned(&mut ctx, &mut procs, 1);
    ctx.pages_mut().claim(PageNumber::new(0x101), Owner::Process(9)).expect("claim");
    let free = ctx.free_count();

    let image = elf(0x10_0000, &[SegmentSpec::load(0x10_0000, &[7; 0x20], 0x3000)]);
    assert_eq!(
        load(&mut ctx, &mut process, image),
        Err(LoadError::LoadFailed { pid: 1, va: 0x10_1000 })
    );
    assert_eq!(ctx.free_count(), free);
    assert_eq!(ctx.pages().owner(PageNumber::new(0x100)), Some(Owner::Free));
    let table = process.page_table().expect("table");
    assert!(!ctx.lookup(table, 0x10_0000).is_mapped());
    assert_eq!(ctx.active_root(), ctx.kernel_table().root());
    assert_eq!(process.registers.rip, 0);
}

#[test]
fn rollback_restores_inherited_kernel_leaves() {
    let mut ctx = boot();
    let mut procs = ProcessTable::for_config(ctx.config());
    let mut process = spawned(&mut ctx, &mut procs, 1);
    let free = ctx.free_count();
    let before = {
        let table = process.page_table().expect("table");
        [0x1_0000, 0x1_1000].map(|va| ctx.lookup(table, va))
    };
    assert_eq!(before[0].perm, PageFlags::KERNEL_RW);

    let image = elf(
        0x1_0000,
        &[
            SegmentSpec::load(0x1_0000, &[5; 0x10], 0x1800),
            SegmentSpec::load(0xa_0000, &[6], 1),
        ],
    );
    assert_eq!(
        load(&mut ctx, &mut process, image),
        Err(LoadError::LoadFailed { pid: 1, va: 0xa_0000 })
    );
    assert_eq!(ctx.free_count(), free);
    let table = process.page_table().expect("table");
    let after = [0x1_0000, 0x1_1000].map(|va| ctx.lookup(table, va));
    assert_eq!(after, before);
    assert_eq!(ctx.check_kernel_mappings(table), Ok(()));
}

#[test]
fn node_allocation_failure_releases_nodes() {
    let mut ctx = boot();
    let owner = Owner::Process(1);
    let table = ctx.create_table(owner).expect("table");
    let root = table.root();
    let mut process = Process::with_page_table(1, table);

    let keep = [PageNumber::new(0x150), PageNumber::new(0x1f0)];
    let free: Vec<_> = ctx.pages().pages_owned_by(Owner::Free).collect();
    for page in free.into_iter().filter(|page| !keep.contains(page)) {
        ctx.pages_mut().claim(page, Owner::Process(9)).expect("claim");
    }
    assert_eq!(ctx.free_count(), 2);

    let image = elf(0x15_0000, &[SegmentSpec::load(0x15_0000, b"x", 1)]);
    assert_eq!(
        load(&mut ctx, &mut process, image),
        Err(LoadError::LoadFailed { pid: 1, va: 0x15_0000 })
    );
    assert_eq!(ctx.free_count(), 2);
    let table = process.page_table().expect("table");
    assert_eq!(table.node_pages(ctx.memory()), vec![root]);
}

#[test]
fn pages_of_other_owners_are_never_taken() {
    let mut ctx = boot();
    let mut procs = ProcessTable::new(4);
    let mut first = spawned(&mut ctx, &mut procs, 2);
    let mut second = spawned(&mut ctx, &mut procs, 1);

    let image = elf(0x14_0000, &[SegmentSpec::load(0x14_0000, b"two", 3)]);
    load(&mut ctx, &mut first, image).expect("load");
    let free = ctx.free_count();
    assert_eq!(
        load(&mut ctx, &mut second, image),
        Err(LoadError::LoadFailed { pid: 1, va: 0x14_0000 })
    );
    assert_eq!(ctx.free_count(), free);
    assert_eq!(ctx.read_active(0x14_0000, 3).expect("read"), b"two");

    for (va, what) in [(0xa_0000, "reserved"), (0x4_0000, "kernel"), (0x25_0000, "beyond memory")] {
        let image = elf(va as u64, &[SegmentSpec::load(va as u64, &[0], 1)]);
        assert_eq!(
            load(&mut ctx, &mut second, image),
            Err(LoadError::LoadFailed { pid: 1, va }),
            "{what}"
        );
    }
    assert_eq!(ctx.free_count(), free);
}

#[test]
fn setup_and_teardown_cycle() {
    let mut ctx = boot();
    let mut procs = ProcessTable::for_config(ctx.config());
    let free = ctx.free_count();
    let images = ProgramImages::new(vec![
        elf(0x10_0000, &[SegmentSpec::load(0x10_0000, &[0x90; 0x40], 0x100)]),
        elf(0x10_0000, &[SegmentSpec::load(0xa_0000, &[0], 1)]),
    ]);

    procs.setup(&mut ctx, 1, &images, 0).expect("setup");
    let process = procs.get(1).expect("slot");
    assert_eq!(process.state, ProcState::Runnable);
    assert_eq!(process.registers.rip, 0x10_0000);
    assert_eq!(process.registers.rsp, 0x30_0000);
    let table = process.page_table().expect("table");
    let stack = ctx.lookup(table, 0x2f_f000);
    assert_eq!(stack.perm, PageFlags::USER_RW);
    assert_eq!(ctx.pages().owner(PageNumber::new(stack.pn)), Some(Owner::Process(1)));
    assert_eq!(ctx.check_kernel_mappings(table), Ok(()));
    assert_eq!(ctx.audit_table(table, Owner::Process(1)), Ok(()));
    assert_eq!(procs.runnable().count(), 1);

    let err = procs.setup(&mut ctx, 2, &images, 1).expect_err("reserved segment");
    assert_eq!(err, neuron_mm::ProcessError::Load(LoadError::LoadFailed { pid: 2, va: 0xa_0000 }));
    assert_eq!(procs.get(2).map(|p| p.state), Some(ProcState::Free));

    // Four table nodes, one data page, the stack page and its table node.
    assert_eq!(procs.teardown(&mut ctx, 1), Ok(7));
    assert_eq!(ctx.free_count(), free);
    assert_eq!(procs.runnable().count(), 0);
}
