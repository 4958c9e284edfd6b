//! Per-address-space two-level page table: container types and index
//! arithmetic only. The double-checked lazy materialization logic lives in
//! [`crate::addrspace`], since it shares the structural lock with the
//! address space's region list and heap range (see `SPEC_FULL.md` §3
//! "Address space").
//!
//! Each PTE is reached through an `Arc`, not a borrow tied to the
//! structural lock's guard: `get_entry` must be able to hand a caller a
//! handle it can lock *after* the structural lock has been released (§4.3).
//! A raw pointer into boxed storage would do the same job in the teacher's
//! source language; here the reference count is the mechanism that keeps
//! the entry alive without unsafe code.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::lock::EntryLock;

/// Bits of a 20-bit VPN (32-bit address space, 4 KiB pages) assigned to
/// each level: 10 bits of L1 index over 10 bits of L2 index.
const L1_BITS: u32 = 10;
const L2_BITS: u32 = 10;

pub const L1_ENTRIES: usize = 1 << L1_BITS;
pub const L2_ENTRIES: usize = 1 << L2_BITS;

static_assertions::const_assert_eq!(L1_ENTRIES * L2_ENTRIES, 1 << 20);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PteState {
    Unalloc,
    Zero,
    Ram,
    Swap,
}

#[derive(Clone, Copy, Debug)]
pub struct PteData {
    pub state: PteState,
    pub pfn: u64,
    pub swap_slot: usize,
    pub dirty: bool,
    pub readonly: bool,
    pub referenced: bool,
}

impl Default for PteData {
    fn default() -> Self {
        PteData {
            state: PteState::Unalloc,
            pfn: 0,
            swap_slot: 0,
            dirty: false,
            readonly: false,
            referenced: false,
        }
    }
}

/// A reference-counted handle to one PTE's lock. Cloning is cheap and is
/// how `get_entry` escapes the structural-lock critical section.
pub type PteHandle = Arc<EntryLock<PteData>>;

pub type L2Table = Vec<PteHandle>;
pub type L1Table = Vec<Option<Box<L2Table>>>;

pub fn new_l1_table() -> L1Table {
    let mut l1 = Vec::with_capacity(L1_ENTRIES);
    l1.resize_with(L1_ENTRIES, || None);
    l1
}

/// A freshly materialized L2 table: every entry UNALLOC behind its own lock.
pub fn new_l2_table() -> Box<L2Table> {
    Box::new(
        (0..L2_ENTRIES)
            .map(|_| Arc::new(EntryLock::new(PteData::default())))
            .collect(),
    )
}

/// Splits a virtual page number into (L1 index, L2 index).
pub const fn split_vpn(vpn: u64) -> (usize, usize) {
    let l1 = (vpn >> L2_BITS) as usize & (L1_ENTRIES - 1);
    let l2 = vpn as usize & (L2_ENTRIES - 1);
    (l1, l2)
}

/// Inverse of [`split_vpn`].
pub const fn join_vpn(l1_idx: usize, l2_idx: usize) -> u64 {
    (l1_idx as u64) << L2_BITS | l2_idx as u64
}
