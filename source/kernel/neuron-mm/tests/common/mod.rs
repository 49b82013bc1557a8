// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures: booted contexts and hand-assembled ELF64 images.

#![allow(dead_code)]

use std::io::Cursor;

use byteorder::{LittleEndian, WriteBytesExt};
use neuron_mm::{KernelContext, MachineConfig};

pub const EHDR_SIZE: u64 = 64;
pub const PHDR_SIZE: u64 = 56;
pub const PT_LOAD: u32 = 1;
pub const PT_GNU_STACK: u32 = 0x6474_e551;

pub fn boot() -> KernelContext {
    KernelContext::boot(MachineConfig::default()).expect("boot")
}

/// One program header plus the file bytes it carries.
#[derive(Clone, Debug)]
pub struct SegmentSpec {
    pub p_type: u32,
    pub vaddr: u64,
    pub data: Vec<u8>,
    pub mem_size: u64,
}

impl SegmentSpec {
    pub fn load(vaddr: u64, data: &[u8], mem_size: u64) -> Self {
        Self { p_type: PT_LOAD, vaddr, data: data.to_vec(), mem_size }
    }

    pub fn other(p_type: u32, vaddr: u64) -> Self {
        Self { p_type, vaddr, data: Vec::new(), mem_size: 0 }
    }
}

/// Assembles a little-endian x86-64 executable.
pub fn elf(entry: u64, segments: &[SegmentSpec]) -> &'static [u8] {
    let phnum = segments.len() as u64;
    let mut cursor = Cursor::new(Vec::new());
    cursor.get_mut().extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    cursor.get_mut().extend_from_slice(&[0u8; 8]);
    cursor.set_position(16);
    cursor.write_u16::<LittleEndian>(2).unwrap(); // e_type: executable
    cursor.write_u16::<LittleEndian>(62).unwrap(); // e_machine: x86-64
    cursor.write_u32::<LittleEndian>(1).unwrap(); // e_version
    cursor.write_u64::<LittleEndian>(entry).unwrap();
    cursor.write_u64::<LittleEndian>(EHDR_SIZE).unwrap(); // e_phoff
    cursor.write_u64::<LittleEndian>(0).unwrap(); // e_shoff
    cursor.write_u32::<LittleEndian>(0).unwrap(); // e_flags
    cursor.write_u16::<LittleEndian>(EHDR_SIZE as u16).unwrap();
    cursor.write_u16::<LittleEndian>(PHDR_SIZE as u16).unwrap();
    cursor.write_u16::<LittleEndian>(phnum as u16).unwrap();
    cursor.write_u16::<LittleEndian>(0).unwrap(); // e_shentsize
    cursor.write_u16::<LittleEndian>(0).unwrap(); // e_shnum
    cursor.write_u16::<LittleEndian>(0).unwrap(); // e_shstrndx

    let mut offset = EHDR_SIZE + phnum * PHDR_SIZE;
    for segment in segments {
        let filesz = segment.data.len() as u64;
        cursor.write_u32::<LittleEndian>(segment.p_type).unwrap();
        cursor.write_u32::<LittleEndian>(6).unwrap(); // p_flags: R|W
        cursor.write_u64::<LittleEndian>(offset).unwrap();
        cursor.write_u64::<LittleEndian>(segment.vaddr).unwrap();
        cursor.write_u64::<LittleEndian>(segment.vaddr).unwrap(); // p_paddr
        cursor.write_u64::<LittleEndian>(filesz).unwrap();
        cursor.write_u64::<LittleEndian>(segment.mem_size).unwrap();
        cursor.write_u64::<LittleEndian>(0x1000).unwrap(); // p_align
        offset += filesz;
    }
    let mut bytes = cursor.into_inner();
    for segment in segments {
        bytes.extend_from_slice(&segment.data);
    }
    Box::leak(bytes.into_boxed_slice())
}
