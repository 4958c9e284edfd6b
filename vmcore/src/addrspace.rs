//! Per-process address space: region list, heap range, and the two-level
//! page table that backs them. Adapted from the teacher kernel's
//! `src/mm/paging.rs` lazy-materialization idiom (there applied to a
//! hardware 4-level x86 table; here to the software-walked 2-level table
//! `SPEC_FULL.md` §3 describes), wrapped the way `src/sched/mod.rs` wraps
//! its `Task` shell in an `Arc` for cheap, shared, reference-counted
//! ownership.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use log::{debug, trace};

use crate::addr::VirtAddress;
use crate::error::{VmError, VmResult};
use crate::frame_table::{AsHandle, FrameTable};
use crate::lock::StructuralLock;
use crate::page::{Frame, Page, PAGE_SIZE};
use crate::page_table::{join_vpn, new_l1_table, new_l2_table, split_vpn, L1Table, PteHandle, PteState};
use crate::ports::{BackingDevice, KernelDirectMap};
use crate::swap::{SwapSlot, SwapStore};

#[derive(Clone, Copy, Debug)]
pub struct Region {
    pub vbase: u64,
    pub npages: u64,
    pub readable: bool,
    pub writeable: bool,
    pub executable: bool,
}

impl Region {
    fn end(&self) -> u64 {
        self.vbase + self.npages * PAGE_SIZE.as_raw()
    }

    fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.vbase && vaddr < self.end()
    }
}

struct Structural {
    l1: Option<L1Table>,
    regions: Vec<Region>,
    heap_start: u64,
    heap_end: u64,
}

pub struct AddressSpaceInner {
    structural: StructuralLock<Structural>,
}

/// A cheaply-cloned handle to an address space. Frame-table back-references
/// hold only a [`Weak`] to the same `AddressSpaceInner`; an `AddressSpace`
/// holds the strong `Arc`.
#[derive(Clone)]
pub struct AddressSpace {
    inner: Arc<AddressSpaceInner>,
}

/// Where a faulting or heap-shrinking address falls relative to an address
/// space's layout.
pub enum Placement {
    /// Inside a mapped region; carries its writeability.
    Region { writeable: bool },
    /// Inside the live heap range `[heap_start, heap_end)`.
    Heap,
    /// Neither: an unmapped hole.
    Unmapped,
}

impl AddressSpace {
    pub fn create() -> VmResult<AddressSpace> {
        let inner = AddressSpaceInner {
            structural: StructuralLock::new(Structural {
                l1: None,
                regions: Vec::new(),
                heap_start: 0,
                heap_end: 0,
            }),
        };
        Ok(AddressSpace { inner: Arc::new(inner) })
    }

    pub fn downgrade(&self) -> AsHandle {
        Arc::downgrade(&self.inner)
    }

    /// Rewraps a strong handle obtained by upgrading a frame's weak
    /// back-reference. Used by the eviction engine to reach the victim's
    /// address space without holding a strong reference of its own.
    pub(crate) fn from_inner(inner: Arc<AddressSpaceInner>) -> AddressSpace {
        AddressSpace { inner }
    }

    pub fn ptr_eq(&self, weak: &Weak<AddressSpaceInner>) -> bool {
        weak.upgrade().is_some_and(|other| Arc::ptr_eq(&self.inner, &other))
    }

    /// Page-aligns `size`, prepends a region, and advances the heap range if
    /// the region's end lies above the current `heap_start` — regions are
    /// laid out by the loader/stack setup below the heap.
    pub fn define_region(&self, vbase: u64, size: u64, r: bool, w: bool, x: bool) {
        let npages = size.div_ceil(PAGE_SIZE.as_raw());
        let region = Region {
            vbase: vbase.align_down(),
            npages,
            readable: r,
            writeable: w,
            executable: x,
        };
        let end = region.end();

        let mut structural = self.inner.structural.lock();
        structural.regions.push(region);
        if end > structural.heap_start {
            structural.heap_start = end;
            structural.heap_end = end;
        }
        trace!("define_region: vbase={:#x} npages={npages} r={r} w={w} x={x}", region.vbase);
    }

    /// For every page of every region, ensure a PTE exists and set it to
    /// ZERO, writable, so the loader can write text/rodata during load.
    pub fn prepare_load(&self) -> VmResult<()> {
        let regions = self.inner.structural.lock().regions.clone();
        for region in regions {
            for i in 0..region.npages {
                let vpn = Page::containing(VirtAddress::from_raw(region.vbase)).index() + i;
                let handle = self
                    .get_entry(vpn, true)
                    .ok_or(VmError::OutOfMemory)?;
                let mut pte = handle.lock();
                pte.state = PteState::Zero;
                pte.readonly = false;
            }
        }
        Ok(())
    }

    /// Revisits every page of every region and locks in the real
    /// readonly flag now that loading is finished.
    pub fn complete_load(&self) -> VmResult<()> {
        let regions = self.inner.structural.lock().regions.clone();
        for region in regions {
            for i in 0..region.npages {
                let vpn = Page::containing(VirtAddress::from_raw(region.vbase)).index() + i;
                let handle = self.get_entry(vpn, false).ok_or(VmError::InvalidAddress)?;
                let mut pte = handle.lock();
                assert!(
                    matches!(pte.state, PteState::Zero | PteState::Ram),
                    "complete_load saw PTE in unexpected state {:?}",
                    pte.state
                );
                pte.readonly = !region.writeable;
            }
        }
        Ok(())
    }

    /// Defines the fixed-size stack region ending at `userstack`, then
    /// restores the prior heap range (the stack is not part of the heap).
    /// Returns the initial user stack pointer.
    pub fn define_stack(&self, userstack: u64, stack_pages: u64) -> u64 {
        let (prior_start, prior_end) = {
            let structural = self.inner.structural.lock();
            (structural.heap_start, structural.heap_end)
        };
        let stack_bytes = stack_pages * PAGE_SIZE.as_raw();
        self.define_region(userstack - stack_bytes, stack_bytes, true, true, false);

        let mut structural = self.inner.structural.lock();
        structural.heap_start = prior_start;
        structural.heap_end = prior_end;
        debug!("define_stack: userstack={userstack:#x} stack_pages={stack_pages}");
        userstack
    }

    pub fn heap_range(&self) -> (u64, u64) {
        let structural = self.inner.structural.lock();
        (structural.heap_start, structural.heap_end)
    }

    pub(crate) fn set_heap_end(&self, new_end: u64) {
        self.inner.structural.lock().heap_end = new_end;
    }

    /// Classifies `vaddr` as falling in a region, the live heap, or nowhere.
    pub fn classify(&self, vaddr: u64) -> Placement {
        let structural = self.inner.structural.lock();
        for region in &structural.regions {
            if region.contains(vaddr) {
                return Placement::Region { writeable: region.writeable };
            }
        }
        if vaddr >= structural.heap_start && vaddr < structural.heap_end {
            return Placement::Heap;
        }
        Placement::Unmapped
    }

    /// Double-checked lazy materialization of the L1 array and, within it,
    /// the L2 array covering `vpn`. Each candidate array is built before the
    /// structural lock is taken; if a racing caller already installed one,
    /// the loser's allocation is simply dropped.
    pub fn get_entry(&self, vpn: u64, create: bool) -> Option<PteHandle> {
        let (l1_idx, l2_idx) = split_vpn(vpn);

        if let Some(handle) = self.lookup_existing(l1_idx, l2_idx) {
            return Some(handle);
        }
        if !create {
            return None;
        }

        let candidate_l1 = new_l1_table();
        {
            let mut structural = self.inner.structural.lock();
            if structural.l1.is_none() {
                structural.l1 = Some(candidate_l1);
                trace!("page table: materialized L1");
            }
        }

        let candidate_l2 = new_l2_table();
        let mut structural = self.inner.structural.lock();
        let l1 = structural.l1.as_mut().expect("L1 materialized above");
        if l1[l1_idx].is_none() {
            l1[l1_idx] = Some(candidate_l2);
            trace!("page table: materialized L2 at l1_idx={l1_idx}");
        }
        let l2 = l1[l1_idx].as_ref().expect("L2 materialized above");
        Some(Arc::clone(&l2[l2_idx]))
    }

    fn lookup_existing(&self, l1_idx: usize, l2_idx: usize) -> Option<PteHandle> {
        let structural = self.inner.structural.lock();
        let l1 = structural.l1.as_ref()?;
        let l2 = l1[l1_idx].as_ref()?;
        Some(Arc::clone(&l2[l2_idx]))
    }

    /// Flushes every TLB slot. Called under a raised interrupt priority by
    /// the embedding kernel; this core makes no assumption beyond "runs to
    /// completion before a fault can be taken".
    pub fn activate(&self, tlb: &impl crate::ports::TlbPort) {
        tlb.flush_all();
    }

    pub fn deactivate(&self) {
        // `activate` of the next address space already invalidates every
        // slot; nothing to do here.
    }

    /// Frees every region, releases every resident frame and swap slot, and
    /// drops the page-table storage. No concurrent access to this address
    /// space may occur once `destroy` is called.
    pub fn destroy<D: BackingDevice>(&self, frame_table: &FrameTable, swap: &SwapStore<D>) {
        let l1 = {
            let mut structural = self.inner.structural.lock();
            structural.regions.clear();
            structural.l1.take()
        };

        let Some(l1) = l1 else { return };
        for l2 in l1.into_iter().flatten() {
            for pte in l2.iter() {
                let mut data = pte.lock();
                match data.state {
                    PteState::Ram => frame_table.free_user(data.pfn as usize),
                    PteState::Swap => swap.free_slot(SwapSlot(data.swap_slot)),
                    PteState::Zero | PteState::Unalloc => {}
                }
                data.state = PteState::Unalloc;
            }
        }
        debug!("address space destroyed");
    }

    /// Deep-copies `self` (the source) into a freshly created address
    /// space: same regions and heap range, and, per resident page, a
    /// private copy of its contents (RAM), a private duplicate swap slot
    /// (SWAP), or the same logical emptiness (ZERO/UNALLOC).
    pub fn copy<D: BackingDevice>(
        &self,
        frame_table: &FrameTable,
        swap: &SwapStore<D>,
        direct_map: &impl KernelDirectMap,
    ) -> VmResult<AddressSpace> {
        let dest = AddressSpace::create()?;

        let (regions, heap_start, heap_end, populated) = {
            let structural = self.inner.structural.lock();
            let populated = Self::populated_indices(&structural.l1);
            (
                structural.regions.clone(),
                structural.heap_start,
                structural.heap_end,
                populated,
            )
        };
        {
            let mut dst_structural = dest.inner.structural.lock();
            dst_structural.regions = regions;
            dst_structural.heap_start = heap_start;
            dst_structural.heap_end = heap_end;
        }

        for (l1_idx, l2_idx) in populated {
            let vpn = join_vpn(l1_idx, l2_idx);
            let src_handle = self.get_entry(vpn, false).expect("enumerated as populated");
            let dst_handle = dest.get_entry(vpn, true).ok_or(VmError::OutOfMemory)?;

            let src_pte = src_handle.lock();
            let mut dst_pte = dst_handle.lock();
            assert_eq!(dst_pte.state, PteState::Unalloc, "fresh destination PTE must be UNALLOC");

            match src_pte.state {
                PteState::Unalloc => {}
                PteState::Zero => {
                    dst_pte.state = PteState::Zero;
                    dst_pte.readonly = src_pte.readonly;
                }
                PteState::Ram => {
                    let src_frame = Frame::from_index(src_pte.pfn);
                    let owner = dest.downgrade();
                    let new_frame = frame_table
                        .try_alloc_user_one(owner, vpn)
                        .ok_or(VmError::OutOfMemory)?;
                    let dst_frame = Frame::from_index(new_frame as u64);
                    direct_map.copy_frame(src_frame, dst_frame);
                    dst_pte.state = PteState::Ram;
                    dst_pte.pfn = new_frame as u64;
                    dst_pte.readonly = src_pte.readonly;
                }
                PteState::Swap => {
                    let new_slot = swap.alloc_slot()?;
                    let owner = dest.downgrade();
                    let temp_frame = frame_table
                        .try_alloc_user_one(owner, vpn)
                        .ok_or(VmError::OutOfMemory)?;
                    let frame = Frame::from_index(temp_frame as u64);

                    let mut buf = [0u8; PAGE_SIZE.as_raw() as usize];
                    swap.read_in(SwapSlot(src_pte.swap_slot), &mut buf)?;
                    direct_map.write_frame(frame, &buf);

                    let mut out = [0u8; PAGE_SIZE.as_raw() as usize];
                    direct_map.read_frame(frame, &mut out);
                    swap.write_out(new_slot, &out)?;

                    frame_table.free_user(temp_frame);
                    dst_pte.state = PteState::Swap;
                    dst_pte.swap_slot = new_slot.0;
                    dst_pte.readonly = src_pte.readonly;
                }
            }
        }

        Ok(dest)
    }

    fn populated_indices(l1: &Option<L1Table>) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let Some(l1) = l1 else { return out };
        for (l1_idx, l2_slot) in l1.iter().enumerate() {
            let Some(l2) = l2_slot else { continue };
            for (l2_idx, pte) in l2.iter().enumerate() {
                if pte.lock().state != PteState::Unalloc {
                    out.push((l1_idx, l2_idx));
                }
            }
        }
        out
    }
}

trait AlignDown {
    fn align_down(self) -> u64;
}

impl AlignDown for u64 {
    fn align_down(self) -> u64 {
        self & !(PAGE_SIZE.as_raw() - 1)
    }
}
