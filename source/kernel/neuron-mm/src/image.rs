// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Resident executable images (ELF64) and their loadable segments
//! OWNERS: @kernel-mm-team
//! PUBLIC API: ExecutableImage::parse, Segment, ProgramImages, ImageError
//! INVARIANTS: Every parsed segment has file_size <= mem_size and its file bytes lie inside the
//!             image; non-loadable program headers are dropped

use byteorder::{ByteOrder, LittleEndian};
use goblin::elf::{
    header::{self, header64},
    program_header::PT_LOAD,
    Elf,
};
use thiserror::Error;

/// Little-endian view of `\x7fELF`.
pub const ELF_MAGIC: u32 = 0x464C_457F;

/// Errors raised while parsing an executable image.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("image truncated")]
    Truncated,
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("malformed image: {0}")]
    Malformed(&'static str),
    #[error("segment {index}: {reason}")]
    BadSegment { index: usize, reason: &'static str },
}

/// A loadable segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Target virtual address (not necessarily page aligned).
    pub va: usize,
    /// Offset of the file-backed bytes within the image.
    pub offset: usize,
    /// Bytes copied from the image.
    pub file_size: usize,
    /// Bytes occupied in memory; the tail past `file_size` reads as zero.
    pub mem_size: usize,
}

impl Segment {
    /// First virtual address past the segment.
    pub fn end(&self) -> usize {
        self.va + self.mem_size
    }
}

/// Parsed view of a resident executable.
#[derive(Clone, Debug)]
pub struct ExecutableImage<'a> {
    bytes: &'a [u8],
    entry: usize,
    segments: Vec<Segment>,
}

impl<'a> ExecutableImage<'a> {
    /// Validates the header and collects the loadable segments.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ImageError> {
        if bytes.len() < header::SELFMAG {
            return Err(ImageError::Truncated);
        }
        let magic = LittleEndian::read_u32(&bytes[..header::SELFMAG]);
        if magic != ELF_MAGIC {
            return Err(ImageError::BadMagic(magic));
        }
        if bytes.len() < header64::SIZEOF_EHDR {
            return Err(ImageError::Truncated);
        }
        if bytes[header::EI_CLASS] != header::ELFCLASS64 {
            return Err(ImageError::Malformed("not ELF64"));
        }

        let elf = Elf::parse(bytes).map_err(|_| ImageError::Malformed("unreadable headers"))?;
        let entry = usize::try_from(elf.entry).map_err(|_| ImageError::Malformed("entry out of range"))?;

        let mut segments = Vec::new();
        for (index, ph) in elf.program_headers.iter().enumerate() {
            if ph.p_type != PT_LOAD {
                continue;
            }
            let bad = |reason| ImageError::BadSegment { index, reason };
            let field = |value: u64| usize::try_from(value).map_err(|_| bad("field out of range"));
            let segment = Segment {
                va: field(ph.p_vaddr)?,
                offset: field(ph.p_offset)?,
                file_size: field(ph.p_filesz)?,
                mem_size: field(ph.p_memsz)?,
            };
            if segment.file_size > segment.mem_size {
                return Err(bad("file size exceeds memory size"));
            }
            if segment.offset.checked_add(segment.file_size).map_or(true, |end| end > bytes.len()) {
                return Err(bad("file bytes outside image"));
            }
            if segment.va.checked_add(segment.mem_size).is_none() {
                return Err(bad("virtual range wraps"));
            }
            segments.push(segment);
        }
        Ok(Self { bytes, entry, segments })
    }

    /// Entry-point virtual address.
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Loadable segments in program-header order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// File-backed bytes of `segment`.
    pub fn data(&self, segment: &Segment) -> &'a [u8] {
        &self.bytes[segment.offset..segment.offset + segment.file_size]
    }
}

/// Fixed set of resident images addressed by index.
#[derive(Clone, Debug, Default)]
pub struct ProgramImages {
    images: Vec<&'static [u8]>,
}

impl ProgramImages {
    pub fn new(images: Vec<&'static [u8]>) -> Self {
        Self { images }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Bytes of image `index`.
    pub fn get(&self, index: usize) -> Option<&'static [u8]> {
        self.images.get(index).copied()
    }
}
