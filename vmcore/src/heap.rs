//! The `adjust_break` syscall: grows or shrinks an address space's heap.
//!
//! Grounded in the teacher kernel's resource-release pattern in
//! `AddressSpace::destroy` (`src/mm/paging.rs`-derived `addrspace.rs`):
//! shrinking releases exactly the frames and swap slots the departing pages
//! held, the same per-state match destroying a whole address space uses,
//! just scoped to the pages being cut off the top of the heap.

use log::trace;

use crate::addr::VirtAddress;
use crate::addrspace::AddressSpace;
use crate::config::Config;
use crate::error::{VmError, VmResult};
use crate::frame_table::FrameTable;
use crate::page::{Page, PAGE_SIZE};
use crate::page_table::PteState;
use crate::ports::BackingDevice;
use crate::swap::{SwapSlot, SwapStore};

/// Grows or shrinks `asp`'s heap by `delta` bytes, which must be a multiple
/// of the page size (including negative multiples). `delta == 0` is a
/// no-op query of the current break. Returns the break *before* this call,
/// so a grow's caller can use the return value as the base of the newly
/// available range — the same convention as a Unix `sbrk`.
pub fn adjust_break<D: BackingDevice>(
    asp: &AddressSpace,
    frame_table: &FrameTable,
    swap: &SwapStore<D>,
    config: &Config,
    delta: i64,
) -> VmResult<u64> {
    let (heap_start, heap_end) = asp.heap_range();
    if delta == 0 {
        return Ok(heap_end);
    }
    if delta % PAGE_SIZE.as_raw() as i64 != 0 {
        return Err(VmError::InvalidAddress);
    }

    let new_end = if delta > 0 {
        heap_end.checked_add(delta as u64).ok_or(VmError::InvalidAddress)?
    } else {
        heap_end.checked_sub(delta.unsigned_abs()).ok_or(VmError::InvalidAddress)?
    };

    if new_end < heap_start || new_end > config.heap_ceiling() {
        return Err(VmError::InvalidAddress);
    }

    if new_end < heap_end {
        release_range(asp, frame_table, swap, new_end, heap_end);
    }

    asp.set_heap_end(new_end);
    trace!("adjust_break: delta={delta} heap_end {heap_end:#x} -> {new_end:#x}");
    Ok(heap_end)
}

/// Releases every resident frame or swap slot backing pages in
/// `[new_end, old_end)`, then marks their PTEs UNALLOC. Pages that were
/// never faulted in (still UNALLOC) cost nothing to release.
fn release_range<D: BackingDevice>(asp: &AddressSpace, frame_table: &FrameTable, swap: &SwapStore<D>, new_end: u64, old_end: u64) {
    let first_vpn = Page::containing(VirtAddress::from_raw(new_end)).index();
    let last_vpn = Page::containing(VirtAddress::from_raw(old_end - 1)).index();

    for vpn in first_vpn..=last_vpn {
        let Some(handle) = asp.get_entry(vpn, false) else {
            continue;
        };
        let mut pte = handle.lock();
        match pte.state {
            PteState::Ram => frame_table.free_user(pte.pfn as usize),
            PteState::Swap => swap.free_slot(SwapSlot(pte.swap_slot)),
            PteState::Zero | PteState::Unalloc => {}
        }
        pte.state = PteState::Unalloc;
    }
}
