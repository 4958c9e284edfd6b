//! The fault handler: classifies a faulting address, materializes or
//! swaps in a page, and installs a TLB entry. Grounded in the
//! double-checked lazy-install idiom the teacher kernel uses for its own
//! hardware page tables (`src/mm/paging.rs`), generalized to the
//! software-walked, swap-backed table this crate implements.

use log::trace;

use crate::addr::VirtAddress;
use crate::addrspace::{AddressSpace, Placement};
use crate::config::Config;
use crate::error::{VmError, VmResult};
use crate::evict::{self, EvictionClock};
use crate::frame_table::FrameTable;
use crate::page::{Frame, Page, PAGE_SIZE};
use crate::page_table::PteState;
use crate::ports::{BackingDevice, EntryHi, EntryLo, KernelDirectMap, TlbPort};
use crate::swap::{SwapSlot, SwapStore};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultType {
    Read,
    Write,
    /// A write that hardware trapped because the mapping was read-only.
    /// Since copy-on-write sharing is out of scope, this always fails.
    ReadOnlyWrite,
}

/// Handles one page fault against `asp`. On success, a TLB entry mapping
/// the faulting page is installed and the call returns `Ok(())`.
#[allow(clippy::too_many_arguments)]
pub fn handle_fault<D: BackingDevice>(
    asp: &AddressSpace,
    frame_table: &FrameTable,
    swap: &SwapStore<D>,
    tlb: &impl TlbPort,
    direct_map: &impl KernelDirectMap,
    clock: &EvictionClock,
    config: &Config,
    fault_type: FaultType,
    vaddr: u64,
) -> VmResult<()> {
    let page = Page::containing(VirtAddress::from_raw(vaddr));
    let page_vaddr = page.start().as_raw();

    if page_vaddr >= config.userstack {
        return Err(VmError::InvalidAddress);
    }
    if fault_type == FaultType::ReadOnlyWrite {
        return Err(VmError::Permission);
    }

    let writeable = match asp.classify(page_vaddr) {
        Placement::Region { writeable } => writeable,
        Placement::Heap => true,
        Placement::Unmapped => return Err(VmError::InvalidAddress),
    };

    let handle = match asp.get_entry(page.index(), false) {
        Some(handle) => handle,
        None => {
            let handle = asp.get_entry(page.index(), true).ok_or(VmError::OutOfMemory)?;
            {
                let mut pte = handle.lock();
                assert_eq!(pte.state, PteState::Unalloc, "freshly materialized PTE must start UNALLOC");
                pte.state = PteState::Zero;
                pte.readonly = !writeable;
            }
            handle
        }
    };

    enum NextStep {
        Done,
        ZeroFill,
    }

    let next = {
        let mut pte = handle.lock();
        match pte.state {
            PteState::Ram => {
                pte.referenced = true;
                let frame = Frame::from_index(pte.pfn);
                install_tlb(tlb, page, frame, !pte.readonly);
                NextStep::Done
            }
            PteState::Swap => {
                let slot = SwapSlot(pte.swap_slot);
                let new_frame = evict::alloc_user(
                    frame_table,
                    swap,
                    tlb,
                    direct_map,
                    clock,
                    asp.downgrade(),
                    page.index(),
                )?;
                let frame = Frame::from_index(new_frame as u64);
                let mut buf = [0u8; PAGE_SIZE.as_raw() as usize];
                swap.read_in(slot, &mut buf)?;
                direct_map.write_frame(frame, &buf);
                swap.free_slot(slot);

                pte.state = PteState::Ram;
                pte.pfn = new_frame as u64;
                pte.swap_slot = 0;
                pte.referenced = true;
                install_tlb(tlb, page, frame, !pte.readonly);
                NextStep::Done
            }
            PteState::Unalloc | PteState::Zero => NextStep::ZeroFill,
        }
    };

    if let NextStep::ZeroFill = next {
        let new_frame = evict::alloc_user(
            frame_table,
            swap,
            tlb,
            direct_map,
            clock,
            asp.downgrade(),
            page.index(),
        )?;
        let frame = Frame::from_index(new_frame as u64);
        direct_map.zero_frame(frame);

        let handle = asp.get_entry(page.index(), false).expect("PTE materialized above must still exist");
        let mut pte = handle.lock();
        match pte.state {
            PteState::Unalloc | PteState::Zero => {
                let readonly = pte.readonly;
                pte.state = PteState::Ram;
                pte.pfn = new_frame as u64;
                pte.referenced = true;
                drop(pte);
                install_tlb(tlb, page, frame, !readonly);
            }
            PteState::Ram => {
                // A concurrent fault on the same page already finished
                // zero-filling; discard our redundant frame rather than
                // clobber the winner's install.
                drop(pte);
                trace!("zero-fill race on page {:#x}: freeing redundant frame {new_frame}", page_vaddr);
                frame_table.free_user(new_frame);
            }
            PteState::Swap => unreachable!("a page cannot reach SWAP before its first fault completes"),
        }
    }

    Ok(())
}

fn install_tlb(tlb: &impl TlbPort, page: Page, frame: Frame, writeable: bool) {
    tlb.install_random(EntryHi::encode(page), EntryLo::encode(frame, writeable, true));
}
