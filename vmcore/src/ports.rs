//! Trait boundaries standing in for the hardware/OS collaborators that
//! `SPEC_FULL.md` §1 and §6.1 treat as external: the software-managed TLB,
//! the swap backing-store vnode, and the kernel's direct-mapped window onto
//! physical memory. A real kernel implements these against real hardware;
//! tests and the `vmkernel` demonstration binary implement them with plain
//! in-memory structures.

use crate::error::VmResult;
use crate::page::{Frame, Page, PAGE_SIZE};

/// A 64-bit MIPS-style TLB entry pair, opaque to the core beyond construction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryHi(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryLo(pub u64);

impl EntryLo {
    pub fn encode(frame: Frame, dirty: bool, valid: bool) -> EntryLo {
        let mut raw = frame.index() << 12;
        if dirty {
            raw |= 1 << 10;
        }
        if valid {
            raw |= 1 << 9;
        }
        EntryLo(raw)
    }

    pub const INVALID: EntryLo = EntryLo(0);
}

impl EntryHi {
    pub fn encode(page: Page) -> EntryHi {
        EntryHi(page.index() << 12)
    }
}

/// Software-refilled TLB. Installation only ever happens from the fault
/// handler or the eviction engine; there is no speculative prefetch.
pub trait TlbPort {
    /// Install `(entry_hi, entry_lo)` at a random slot, per the random-slot
    /// replacement primitive named in §6.
    fn install_random(&self, entry_hi: EntryHi, entry_lo: EntryLo);

    /// Probe for an entry matching `entry_hi`, returning its slot if present.
    fn probe(&self, entry_hi: EntryHi) -> Option<usize>;

    /// Overwrite a specific slot (used to invalidate rather than search).
    fn write_slot(&self, slot: usize, entry_hi: EntryHi, entry_lo: EntryLo);

    /// Invalidate any TLB entry mapping `page` for `asid`'s address space.
    ///
    /// Single-CPU assumption: if `asid` does not belong to the address space
    /// currently active on this CPU, this is a reported-not-implemented gap
    /// (§1 Non-goals — no cross-CPU shootdown) and callers must not rely on
    /// it invalidating a *different* CPU's TLB.
    fn invalidate(&self, page: Page) {
        if let Some(slot) = self.probe(EntryHi::encode(page)) {
            self.write_slot(slot, EntryHi(0), EntryLo::INVALID);
        }
    }

    /// Flush every slot. Used by `AddressSpace::activate`.
    fn flush_all(&self);
}

/// The backing device for swap: a vnode opened by fixed name at swap-init
/// time, supporting page-sized synchronous read/write at byte offsets
/// `slot * PAGE_SIZE`.
pub trait BackingDevice {
    /// Total capacity in page-sized slots.
    fn size_in_slots(&self) -> usize;

    fn read_page(&self, slot: usize, buf: &mut [u8; PAGE_SIZE.as_raw() as usize]) -> VmResult<()>;

    fn write_page(&self, slot: usize, buf: &[u8; PAGE_SIZE.as_raw() as usize]) -> VmResult<()>;
}

/// The kernel direct-mapped window: every physical frame is reachable
/// through it without a page-table walk. Stands in for the high-address
/// linear mapping described in the glossary.
pub trait KernelDirectMap {
    fn zero_frame(&self, frame: Frame);

    fn copy_frame(&self, src: Frame, dst: Frame);

    fn read_frame(&self, frame: Frame, buf: &mut [u8; PAGE_SIZE.as_raw() as usize]);

    fn write_frame(&self, frame: Frame, buf: &[u8; PAGE_SIZE.as_raw() as usize]);
}
