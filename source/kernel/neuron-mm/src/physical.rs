// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical page owner ledger
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PageNumber, Owner, PhysicalPages{reserve,claim,release,is_reserved}
//! INVARIANTS: Exactly one owner classification per page; reserved pages never change owner;
//!             a claimed page must be released before anyone else can claim it

use core::fmt;

use log::trace;
use static_assertions::const_assert_eq;
use thiserror::Error;

/// Number of bits in a page offset.
pub const PAGE_SHIFT: usize = 12;
/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask selecting the offset within a page.
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

const_assert_eq!(PAGE_SIZE, 4096);

/// Rounds `addr` down to its page boundary.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !PAGE_OFFSET_MASK
}

/// Rounds `addr` up to the next page boundary, saturating at the last page.
#[inline]
pub fn page_round_up(addr: usize) -> usize {
    addr.checked_add(PAGE_OFFSET_MASK)
        .map_or(usize::MAX & !PAGE_OFFSET_MASK, page_round_down)
}

/// Returns true when `addr` sits on a page boundary.
#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & PAGE_OFFSET_MASK == 0
}

/// Process identifier.
pub type Pid = u16;

/// Physical page number (physical address divided by [`PAGE_SIZE`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageNumber(usize);

impl PageNumber {
    /// Wraps a raw page number.
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the page containing physical address `pa`.
    pub const fn containing(pa: usize) -> Self {
        Self(pa >> PAGE_SHIFT)
    }

    /// Returns the raw page number.
    pub const fn get(self) -> usize {
        self.0
    }

    /// Returns the physical address of the first byte of the page.
    pub const fn address(self) -> usize {
        self.0 << PAGE_SHIFT
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Ownership classification of a physical page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Unallocated; may be claimed.
    #[default]
    Free,
    /// Hardware or firmware region; fixed at boot.
    Reserved,
    /// Kernel image, kernel stack and kernel page-table nodes.
    Kernel,
    /// Owned by a single process.
    Process(Pid),
}

impl Owner {
    /// Whether this owner may appear as the claimant of a page.
    pub const fn can_claim(self) -> bool {
        matches!(self, Owner::Kernel | Owner::Process(_))
    }

    fn map_char(self) -> char {
        const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        match self {
            Owner::Free => '.',
            Owner::Reserved => 'R',
            Owner::Kernel => 'K',
            Owner::Process(pid) => DIGITS[usize::from(pid) % DIGITS.len()] as char,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Free => f.write_str("free"),
            Owner::Reserved => f.write_str("reserved"),
            Owner::Kernel => f.write_str("kernel"),
            Owner::Process(pid) => write!(f, "pid {pid}"),
        }
    }
}

/// Errors reported by the owner ledger.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PhysError {
    /// The page is reserved or already claimed (including by the caller itself).
    #[error("physical page {page} is already owned by {owner}")]
    AlreadyOwned { page: PageNumber, owner: Owner },
    /// The page lies beyond the end of physical memory.
    #[error("physical page {0} is outside physical memory")]
    NoSuchPage(PageNumber),
    /// Only the kernel or a process may claim pages.
    #[error("{0} cannot claim physical pages")]
    InvalidOwner(Owner),
}

/// Per-page owner table covering all of physical memory.
///
/// This is a ledger, not a free-list: callers name the exact page they want.
/// [`PhysicalPages::find_free`] exists for callers (page-table node allocation)
/// that do not care which page they receive.
#[derive(Clone, Debug)]
pub struct PhysicalPages {
    owners: Vec<Owner>,
}

impl PhysicalPages {
    /// Creates a ledger with `page_count` free pages.
    pub fn new(page_count: usize) -> Self {
        Self { owners: vec![Owner::Free; page_count] }
    }

    /// Number of pages tracked.
    pub fn page_count(&self) -> usize {
        self.owners.len()
    }

    /// Current owner of `page`, or `None` past the end of memory.
    pub fn owner(&self, page: PageNumber) -> Option<Owner> {
        self.owners.get(page.get()).copied()
    }

    /// Marks `page` permanently unavailable to processes. Reserving a reserved page is a no-op;
    /// a page claimed by the kernel or a process is left alone and reported as
    /// [`PhysError::AlreadyOwned`].
    pub fn reserve(&mut self, page: PageNumber) -> Result<(), PhysError> {
        let slot = self.owners.get_mut(page.get()).ok_or(PhysError::NoSuchPage(page))?;
        match *slot {
            Owner::Reserved => Ok(()),
            Owner::Free => {
                *slot = Owner::Reserved;
                Ok(())
            }
            owner => Err(PhysError::AlreadyOwned { page, owner }),
        }
    }

    /// Reserves every page overlapping `[start, end)`.
    pub fn reserve_range(&mut self, start: usize, end: usize) -> Result<(), PhysError> {
        let mut addr = page_round_down(start);
        while addr < end {
            self.reserve(PageNumber::containing(addr))?;
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Assigns a free page to `owner`.
    ///
    /// Fails with [`PhysError::AlreadyOwned`] when the page is reserved or claimed, even when
    /// `owner` already holds it: a repeated claim is a caller bug and is surfaced, not merged.
    pub fn claim(&mut self, page: PageNumber, owner: Owner) -> Result<(), PhysError> {
        if !owner.can_claim() {
            return Err(PhysError::InvalidOwner(owner));
        }
        let slot = self.owners.get_mut(page.get()).ok_or(PhysError::NoSuchPage(page))?;
        if *slot != Owner::Free {
            return Err(PhysError::AlreadyOwned { page, owner: *slot });
        }
        *slot = owner;
        trace!(target: "mm", "claim page {page} for {owner}");
        Ok(())
    }

    /// Returns a kernel- or process-owned page to the free pool.
    ///
    /// Free, reserved and out-of-range pages are left untouched. Returns whether the page changed
    /// hands.
    pub fn release(&mut self, page: PageNumber) -> bool {
        match self.owners.get_mut(page.get()) {
            Some(slot) if slot.can_claim() => {
                trace!(target: "mm", "release page {page} from {slot}");
                *slot = Owner::Free;
                true
            }
            _ => false,
        }
    }

    /// Releases every page held by `owner`, returning how many were freed.
    pub fn release_all(&mut self, owner: Owner) -> usize {
        if !owner.can_claim() {
            return 0;
        }
        let mut released = 0;
        for slot in self.owners.iter_mut().filter(|slot| **slot == owner) {
            *slot = Owner::Free;
            released += 1;
        }
        released
    }

    /// Whether physical address `pa` falls in a reserved page.
    pub fn is_reserved(&self, pa: usize) -> bool {
        self.owner(PageNumber::containing(pa)) == Some(Owner::Reserved)
    }

    /// Number of free pages.
    pub fn free_count(&self) -> usize {
        self.owners.iter().filter(|owner| **owner == Owner::Free).count()
    }

    /// Pages currently held by `owner`, in ascending order.
    pub fn pages_owned_by(&self, owner: Owner) -> impl Iterator<Item = PageNumber> + '_ {
        self.owners
            .iter()
            .enumerate()
            .filter(move |(_, slot)| **slot == owner)
            .map(|(index, _)| PageNumber::new(index))
    }

    /// Highest-numbered free page.
    ///
    /// Searching from the top keeps incidental allocations (page-table nodes) away from the
    /// low addresses that executables are identity-loaded into.
    pub fn find_free(&self) -> Option<PageNumber> {
        self.owners.iter().rposition(|owner| *owner == Owner::Free).map(PageNumber::new)
    }

    /// Renders one character per page, `per_line` pages to a line, each line prefixed by the
    /// physical address of its first page.
    pub fn render_map(&self, per_line: usize) -> String {
        let per_line = per_line.max(1);
        let mut out = String::new();
        for (line, chunk) in self.owners.chunks(per_line).enumerate() {
            out.push_str(&format!("{:#08x} ", line * per_line * PAGE_SIZE));
            out.extend(chunk.iter().map(|owner| owner.map_char()));
            out.push('\n');
        }
        out
    }
}
