//! Clock (second-chance) eviction and the allocation facade that retries
//! through it once. Kept separate from [`crate::frame_table`] so the
//! coremap itself stays a set of low-level, non-sleeping primitives — the
//! "retry alloc once via eviction" policy lives here instead, mirroring how
//! the teacher kernel's `src/sched` keeps scheduling policy out of the raw
//! `Task` bookkeeping it dispatches over.

use spin::Mutex;

use crate::addrspace::AddressSpace;
use crate::error::{VmError, VmResult};
use crate::frame_table::{AsHandle, FrameState, FrameTable};
use crate::page::{Frame, PAGE_SIZE};
use crate::page_table::PteState;
use crate::ports::{BackingDevice, KernelDirectMap, TlbPort};
use crate::swap::SwapStore;

/// The clock hand shared across eviction calls. One instance per running
/// kernel, alongside the frame table and swap store.
pub struct EvictionClock {
    next: Mutex<usize>,
}

impl EvictionClock {
    pub const fn new() -> Self {
        EvictionClock { next: Mutex::new(0) }
    }
}

impl Default for EvictionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates one user frame for `(owner, vpn)`, evicting a victim exactly
/// once if the frame table has no FREE frame to give.
pub fn alloc_user<D: BackingDevice>(
    frame_table: &FrameTable,
    swap: &SwapStore<D>,
    tlb: &impl TlbPort,
    direct_map: &impl KernelDirectMap,
    clock: &EvictionClock,
    owner: AsHandle,
    vpn: u64,
) -> VmResult<usize> {
    if let Some(idx) = frame_table.try_alloc_user_one(owner.clone(), vpn) {
        return Ok(idx);
    }
    evict_one(frame_table, swap, tlb, direct_map, clock)?;
    frame_table
        .try_alloc_user_one(owner, vpn)
        .ok_or(VmError::OutOfMemory)
}

/// Allocates `n` contiguous kernel frames. For `n == 1`, retries once via
/// eviction on failure; for `n > 1`, a scattered set of reclaimed user
/// pages could never satisfy a contiguity requirement, so no eviction is
/// attempted.
pub fn alloc_kernel<D: BackingDevice>(
    frame_table: &FrameTable,
    swap: &SwapStore<D>,
    tlb: &impl TlbPort,
    direct_map: &impl KernelDirectMap,
    clock: &EvictionClock,
    n: usize,
) -> VmResult<usize> {
    if n == 1 {
        if let Some(idx) = frame_table.try_alloc_fixed_one() {
            return Ok(idx);
        }
        evict_one(frame_table, swap, tlb, direct_map, clock)?;
        return frame_table.try_alloc_fixed_one().ok_or(VmError::OutOfMemory);
    }
    frame_table.try_alloc_fixed_run(n).ok_or(VmError::OutOfMemory)
}

/// Runs one full victim-selection-and-eviction cycle, returning the index
/// of the now-FREE frame.
pub fn evict_one<D: BackingDevice>(
    frame_table: &FrameTable,
    swap: &SwapStore<D>,
    tlb: &impl TlbPort,
    direct_map: &impl KernelDirectMap,
    clock: &EvictionClock,
) -> VmResult<usize> {
    let victim = select_victim(frame_table, clock)?;
    evict_frame(frame_table, swap, tlb, direct_map, victim)
}

fn select_victim(frame_table: &FrameTable, clock: &EvictionClock) -> VmResult<usize> {
    let total = frame_table.total_frames();
    if total == 0 {
        return Err(VmError::OutOfMemory);
    }
    let start = *clock.next.lock() % total;

    let mut pass1 = None;
    for offset in 0..total {
        let idx = (start + offset) % total;
        if frame_table.frame_state(idx) != FrameState::User {
            continue;
        }
        let Some((owner, page)) = frame_table.owner_and_vpn(idx) else {
            continue;
        };
        let Some(inner) = owner.upgrade() else {
            continue;
        };
        let asp = AddressSpace::from_inner(inner);
        let Some(pte) = asp.get_entry(page.index(), false) else {
            continue;
        };
        let mut data = pte.lock();
        if data.state != PteState::Ram || data.pfn != idx as u64 {
            continue;
        }
        if data.referenced {
            data.referenced = false;
            continue;
        }
        pass1 = Some(idx);
        break;
    }

    let victim = match pass1 {
        Some(idx) => idx,
        None => (0..total)
            .map(|offset| (start + offset) % total)
            .find(|&idx| frame_table.frame_state(idx) == FrameState::User)
            .ok_or(VmError::OutOfMemory)?,
    };

    *clock.next.lock() = (victim + 1) % total;
    Ok(victim)
}

/// The seven-step eviction sequence of §4.6. Any failure between
/// `mark_evicting` and the final `eviction_finished` reverts the frame to
/// USER, leaving the PTE's RAM state untouched, rather than freeing a frame
/// that is still resident and owned.
fn evict_frame<D: BackingDevice>(
    frame_table: &FrameTable,
    swap: &SwapStore<D>,
    tlb: &impl TlbPort,
    direct_map: &impl KernelDirectMap,
    victim: usize,
) -> VmResult<usize> {
    frame_table.mark_evicting(victim).ok_or(VmError::Busy)?;

    let (owner, page) = frame_table
        .owner_and_vpn(victim)
        .expect("an EVICTING frame must still carry its owner/vpn");
    let Some(inner) = owner.upgrade() else {
        frame_table.revert_evicting_to_user(victim);
        return Err(VmError::Busy);
    };
    let asp = AddressSpace::from_inner(inner);
    let pte_handle = asp
        .get_entry(page.index(), false)
        .expect("victim's PTE must already exist");

    let mut pte = pte_handle.lock();
    assert_eq!(pte.state, PteState::Ram, "victim PTE must be RAM");
    assert_eq!(pte.pfn, victim as u64, "victim PTE must point back at the frame being evicted");

    let slot = match swap.alloc_slot() {
        Ok(slot) => slot,
        Err(e) => {
            drop(pte);
            frame_table.revert_evicting_to_user(victim);
            return Err(e);
        }
    };

    let mut buf = [0u8; PAGE_SIZE.as_raw() as usize];
    direct_map.read_frame(Frame::from_index(victim as u64), &mut buf);
    if let Err(e) = swap.write_out(slot, &buf) {
        swap.free_slot(slot);
        drop(pte);
        frame_table.revert_evicting_to_user(victim);
        return Err(e);
    }

    tlb.invalidate(page);

    pte.state = PteState::Swap;
    pte.swap_slot = slot.0;
    pte.pfn = 0;
    drop(pte);

    frame_table.eviction_finished(victim);
    Ok(victim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fault::{handle_fault, FaultType};
    use crate::swap::SwapSlot;
    use alloc::vec::Vec;
    use pretty_assertions::assert_eq;

    struct ArenaDirectMap {
        frames: Mutex<Vec<[u8; PAGE_SIZE.as_raw() as usize]>>,
    }

    impl ArenaDirectMap {
        fn new(count: usize) -> Self {
            ArenaDirectMap {
                frames: Mutex::new(alloc::vec![[0u8; PAGE_SIZE.as_raw() as usize]; count]),
            }
        }
    }

    impl KernelDirectMap for ArenaDirectMap {
        fn zero_frame(&self, frame: Frame) {
            self.frames.lock()[frame.index() as usize] = [0u8; PAGE_SIZE.as_raw() as usize];
        }

        fn copy_frame(&self, src: Frame, dst: Frame) {
            let buf = self.frames.lock()[src.index() as usize];
            self.frames.lock()[dst.index() as usize] = buf;
        }

        fn read_frame(&self, frame: Frame, buf: &mut [u8; PAGE_SIZE.as_raw() as usize]) {
            buf.copy_from_slice(&self.frames.lock()[frame.index() as usize]);
        }

        fn write_frame(&self, frame: Frame, buf: &[u8; PAGE_SIZE.as_raw() as usize]) {
            self.frames.lock()[frame.index() as usize].copy_from_slice(buf);
        }
    }

    struct MemoryBackingDevice {
        slots: Mutex<Vec<[u8; PAGE_SIZE.as_raw() as usize]>>,
    }

    impl MemoryBackingDevice {
        fn new(count: usize) -> Self {
            MemoryBackingDevice {
                slots: Mutex::new(alloc::vec![[0u8; PAGE_SIZE.as_raw() as usize]; count]),
            }
        }
    }

    impl BackingDevice for MemoryBackingDevice {
        fn size_in_slots(&self) -> usize {
            self.slots.lock().len()
        }
        fn read_page(&self, slot: usize, buf: &mut [u8; PAGE_SIZE.as_raw() as usize]) -> VmResult<()> {
            buf.copy_from_slice(&self.slots.lock()[slot]);
            Ok(())
        }
        fn write_page(&self, slot: usize, buf: &[u8; PAGE_SIZE.as_raw() as usize]) -> VmResult<()> {
            self.slots.lock()[slot].copy_from_slice(buf);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeTlb {
        flushed: Mutex<usize>,
    }

    impl TlbPort for FakeTlb {
        fn install_random(&self, _entry_hi: crate::ports::EntryHi, _entry_lo: crate::ports::EntryLo) {}
        fn probe(&self, _entry_hi: crate::ports::EntryHi) -> Option<usize> {
            None
        }
        fn write_slot(&self, _slot: usize, _entry_hi: crate::ports::EntryHi, _entry_lo: crate::ports::EntryLo) {}
        fn flush_all(&self) {
            *self.flushed.lock() += 1;
        }
    }

    /// A one-frame machine must still be able to serve single-page user
    /// allocations by evicting the sole resident page.
    #[test_log::test]
    fn eviction_reclaims_the_only_frame() {
        let (frame_table, free) = FrameTable::bootstrap(PAGE_SIZE.as_raw(), 0);
        assert_eq!(free, 1);
        let swap = SwapStore::new(MemoryBackingDevice::new(4));
        let direct_map = ArenaDirectMap::new(1);
        let tlb = FakeTlb::default();
        let clock = EvictionClock::new();
        let config = Config::default();

        let asp1 = AddressSpace::create().unwrap();
        asp1.define_region(0x400000, PAGE_SIZE.as_raw(), true, true, false);
        handle_fault(&asp1, &frame_table, &swap, &tlb, &direct_map, &clock, &config, FaultType::Write, 0x400000).unwrap();

        let asp2 = AddressSpace::create().unwrap();
        asp2.define_region(0x500000, PAGE_SIZE.as_raw(), true, true, false);
        // This fault cannot find a FREE frame and must evict asp1's page.
        handle_fault(&asp2, &frame_table, &swap, &tlb, &direct_map, &clock, &config, FaultType::Write, 0x500000).unwrap();

        let pte1 = asp1.get_entry(0x400000 / PAGE_SIZE.as_raw(), false).unwrap();
        assert_eq!(pte1.lock().state, PteState::Swap);

        // Touching it again should swap it back in transparently.
        handle_fault(&asp1, &frame_table, &swap, &tlb, &direct_map, &clock, &config, FaultType::Read, 0x400000).unwrap();
        assert_eq!(pte1.lock().state, PteState::Ram);
    }

    #[test_log::test]
    fn revert_on_swap_exhaustion_keeps_page_resident() {
        let (frame_table, _) = FrameTable::bootstrap(2 * PAGE_SIZE.as_raw(), 0);
        let swap = SwapStore::new(MemoryBackingDevice::new(0));
        let direct_map = ArenaDirectMap::new(2);
        let tlb = FakeTlb::default();

        let asp = AddressSpace::create().unwrap();
        let vpn = 7u64;
        let handle = asp.get_entry(vpn, true).unwrap();
        {
            let mut pte = handle.lock();
            pte.state = PteState::Ram;
        }
        let frame = frame_table.try_alloc_user_one(asp.downgrade(), vpn).unwrap();
        handle.lock().pfn = frame as u64;

        let clock = EvictionClock::new();
        let result = evict_one(&frame_table, &swap, &tlb, &direct_map, &clock);
        assert!(matches!(result, Err(VmError::OutOfSwap)));

        assert_eq!(frame_table.frame_state(frame), FrameState::User);
        assert_eq!(handle.lock().state, PteState::Ram);
    }
}
