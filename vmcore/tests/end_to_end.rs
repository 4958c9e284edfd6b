//! End-to-end scenarios exercised against `VmSystem` as an outside
//! consumer would use it: a fresh address space, a handful of regions,
//! and faults/heap adjustments driven straight through the public API.
//!
//! These run as ordinary host tests (no real hardware needed) since the
//! TLB and backing device are abstracted behind `TlbPort`/`BackingDevice`.

use std::sync::Mutex;

use vmcore::{
    BackingDevice, Config, EntryHi, EntryLo, Frame, FaultType, KernelDirectMap, PAGE_SIZE,
    TlbPort, VmError, VmSystem,
};
use vmcore::page_table::PteState;

struct ArenaDirectMap {
    frames: Mutex<Vec<[u8; PAGE_SIZE.as_raw() as usize]>>,
}

impl ArenaDirectMap {
    fn new(count: usize) -> Self {
        ArenaDirectMap {
            frames: Mutex::new(vec![[0u8; PAGE_SIZE.as_raw() as usize]; count]),
        }
    }
}

impl KernelDirectMap for ArenaDirectMap {
    fn zero_frame(&self, frame: Frame) {
        self.frames.lock().unwrap()[frame.index() as usize] = [0u8; PAGE_SIZE.as_raw() as usize];
    }
    fn copy_frame(&self, src: Frame, dst: Frame) {
        let buf = self.frames.lock().unwrap()[src.index() as usize];
        self.frames.lock().unwrap()[dst.index() as usize] = buf;
    }
    fn read_frame(&self, frame: Frame, buf: &mut [u8; PAGE_SIZE.as_raw() as usize]) {
        buf.copy_from_slice(&self.frames.lock().unwrap()[frame.index() as usize]);
    }
    fn write_frame(&self, frame: Frame, buf: &[u8; PAGE_SIZE.as_raw() as usize]) {
        self.frames.lock().unwrap()[frame.index() as usize].copy_from_slice(buf);
    }
}

struct MemoryBackingDevice {
    slots: Mutex<Vec<[u8; PAGE_SIZE.as_raw() as usize]>>,
}

impl MemoryBackingDevice {
    fn new(count: usize) -> Self {
        MemoryBackingDevice {
            slots: Mutex::new(vec![[0u8; PAGE_SIZE.as_raw() as usize]; count]),
        }
    }
}

impl BackingDevice for MemoryBackingDevice {
    fn size_in_slots(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
    fn read_page(&self, slot: usize, buf: &mut [u8; PAGE_SIZE.as_raw() as usize]) -> vmcore::VmResult<()> {
        buf.copy_from_slice(&self.slots.lock().unwrap()[slot]);
        Ok(())
    }
    fn write_page(&self, slot: usize, buf: &[u8; PAGE_SIZE.as_raw() as usize]) -> vmcore::VmResult<()> {
        self.slots.lock().unwrap()[slot].copy_from_slice(buf);
        Ok(())
    }
}

#[derive(Default)]
struct FakeTlb;

impl TlbPort for FakeTlb {
    fn install_random(&self, _entry_hi: EntryHi, _entry_lo: EntryLo) {}
    fn probe(&self, _entry_hi: EntryHi) -> Option<usize> {
        None
    }
    fn write_slot(&self, _slot: usize, _entry_hi: EntryHi, _entry_lo: EntryLo) {}
    fn flush_all(&self) {}
}

fn system(frames: u64, slots: usize) -> (VmSystem<MemoryBackingDevice>, ArenaDirectMap, FakeTlb) {
    let sys = VmSystem::bootstrap(frames * PAGE_SIZE.as_raw(), 0, MemoryBackingDevice::new(slots), Config::default());
    (sys, ArenaDirectMap::new(frames as usize), FakeTlb)
}

/// A fresh region's first touch zero-fills; reading it back through the
/// direct map sees all zeros.
#[test]
fn zero_fill_fault_end_to_end() {
    let (sys, dm, tlb) = system(4, 4);
    let asp = sys.create_address_space().unwrap();
    sys.define_region(&asp, 0x400000, PAGE_SIZE.as_raw(), true, true, false);

    sys.handle_fault(&asp, &tlb, &dm, FaultType::Read, 0x400000).unwrap();
    assert_eq!(sys.coremap_used_bytes(), PAGE_SIZE.as_raw());
}

/// A write fault against a read-only, already-loaded page fails and
/// leaves the coremap untouched.
#[test]
fn write_to_readonly_fails_end_to_end() {
    let (sys, dm, tlb) = system(4, 4);
    let asp = sys.create_address_space().unwrap();
    sys.define_region(&asp, 0x400000, PAGE_SIZE.as_raw(), true, false, true);
    sys.prepare_load(&asp).unwrap();
    sys.complete_load(&asp).unwrap();

    let err = sys.handle_fault(&asp, &tlb, &dm, FaultType::ReadOnlyWrite, 0x400000).unwrap_err();
    assert_eq!(err, VmError::Permission);
    assert_eq!(sys.coremap_used_bytes(), 0);
}

/// Heap grow then shrink returns to the original break and frees
/// whatever frame was faulted in along the way.
#[test]
fn heap_grow_shrink_round_trip_end_to_end() {
    let (sys, dm, tlb) = system(4, 4);
    let asp = sys.create_address_space().unwrap();
    sys.define_region(&asp, 0x400000, PAGE_SIZE.as_raw(), true, false, false);
    let (_, heap_before) = asp.heap_range();

    sys.adjust_break(&asp, PAGE_SIZE.as_raw() as i64).unwrap();
    sys.handle_fault(&asp, &tlb, &dm, FaultType::Write, heap_before).unwrap();
    assert_eq!(sys.coremap_used_bytes(), PAGE_SIZE.as_raw());

    sys.adjust_break(&asp, -(PAGE_SIZE.as_raw() as i64)).unwrap();
    assert_eq!(sys.coremap_used_bytes(), 0);
    let (_, heap_after) = asp.heap_range();
    assert_eq!(heap_after, heap_before);
}

/// Copying an address space duplicates a resident page's contents into
/// a distinct frame.
#[test]
fn fork_preserves_contents_end_to_end() {
    let (sys, dm, tlb) = system(4, 4);
    let parent = sys.create_address_space().unwrap();
    sys.define_region(&parent, 0x400000, PAGE_SIZE.as_raw(), true, true, false);
    sys.handle_fault(&parent, &tlb, &dm, FaultType::Write, 0x400000).unwrap();

    let parent_pte = parent.get_entry(0x400000 / PAGE_SIZE.as_raw(), false).unwrap();
    let parent_frame = Frame::from_index(parent_pte.lock().pfn);
    let mut marker = [0u8; PAGE_SIZE.as_raw() as usize];
    marker[0] = 0x42;
    dm.write_frame(parent_frame, &marker);

    let child = sys.copy_address_space(&parent, &dm).unwrap();
    let child_pte = child.get_entry(0x400000 / PAGE_SIZE.as_raw(), false).unwrap();
    assert_eq!(child_pte.lock().state, PteState::Ram);
    let child_frame = Frame::from_index(child_pte.lock().pfn);
    assert_ne!(child_frame, parent_frame);

    let mut readback = [0u8; PAGE_SIZE.as_raw() as usize];
    dm.read_frame(child_frame, &mut readback);
    assert_eq!(readback[0], 0x42);
}

/// With only one frame in the whole machine, a second address space's
/// fault must evict the first's resident page rather than failing
/// outright.
#[test]
fn eviction_under_pressure_end_to_end() {
    let (sys, dm, tlb) = system(1, 4);
    let asp1 = sys.create_address_space().unwrap();
    sys.define_region(&asp1, 0x400000, PAGE_SIZE.as_raw(), true, true, false);
    sys.handle_fault(&asp1, &tlb, &dm, FaultType::Write, 0x400000).unwrap();

    let asp2 = sys.create_address_space().unwrap();
    sys.define_region(&asp2, 0x500000, PAGE_SIZE.as_raw(), true, true, false);
    sys.handle_fault(&asp2, &tlb, &dm, FaultType::Write, 0x500000).unwrap();

    let pte1 = asp1.get_entry(0x400000 / PAGE_SIZE.as_raw(), false).unwrap();
    assert_eq!(pte1.lock().state, PteState::Swap);
    assert_eq!(sys.coremap_used_bytes(), PAGE_SIZE.as_raw());
}

/// A kernel allocation requiring more than one contiguous frame never
/// evicts to satisfy it, per the non-contiguity rule.
#[test]
fn kernel_large_run_never_evicts() {
    let (sys, dm, tlb) = system(2, 4);
    let asp = sys.create_address_space().unwrap();
    sys.define_region(&asp, 0x400000, PAGE_SIZE.as_raw(), true, true, false);
    sys.handle_fault(&asp, &tlb, &dm, FaultType::Write, 0x400000).unwrap();

    let err = sys.alloc_kpages(2, &tlb, &dm).unwrap_err();
    assert_eq!(err, VmError::OutOfMemory);
}
