//! Virtual-memory core for a teaching kernel targeting a 32-bit MIPS-like
//! machine with a software-managed TLB.
//!
//! This crate owns the frame table (coremap), the swap store, the
//! two-level software page table, per-address-space state, the clock
//! (second-chance) eviction engine, and the page-fault and heap-growth
//! entry points. File descriptors, the process table, the syscall
//! dispatcher, ELF loading and the sleeping-mutex/condvar primitives
//! themselves are external collaborators, reached only through the traits
//! in [`ports`].
//!
//! `no_std`: the embedding kernel supplies its own global allocator: every
//! allocation here goes through `alloc`.

#![no_std]

extern crate alloc;

pub mod addr;
pub mod addrspace;
pub mod config;
pub mod error;
pub mod evict;
pub mod fault;
pub mod frame_table;
pub mod heap;
pub mod lock;
pub mod page;
pub mod page_table;
pub mod ports;
pub mod swap;

pub use addrspace::{AddressSpace, Placement};
pub use config::Config;
pub use error::{VmError, VmResult};
pub use evict::EvictionClock;
pub use fault::FaultType;
pub use frame_table::FrameTable;
pub use page::{Frame, Page, PAGE_SIZE};
pub use ports::{BackingDevice, EntryHi, EntryLo, KernelDirectMap, TlbPort};
pub use swap::{SwapSlot, SwapStore};

use log::info;

/// Everything a kernel instantiates once at boot and threads through every
/// address space it creates afterward. Hardware collaborators (the TLB,
/// the kernel direct map) are passed in per call rather than stored here —
/// see [`ports`] for why.
pub struct VmSystem<D: BackingDevice> {
    frame_table: FrameTable,
    swap: SwapStore<D>,
    clock: EvictionClock,
    config: Config,
}

impl<D: BackingDevice> VmSystem<D> {
    /// Brings up the core over `ram_top` bytes of physical memory, of which
    /// the first `first_free` bytes are reserved by the pre-boot kernel
    /// image, with `device` backing swap.
    pub fn bootstrap(ram_top: u64, first_free: u64, device: D, config: Config) -> Self {
        let (frame_table, free_count) = FrameTable::bootstrap(ram_top, first_free);
        let swap = SwapStore::new(device);
        info!("vm core bootstrap: {free_count} frames free, {} swap slots", swap.slot_count());
        VmSystem {
            frame_table,
            swap,
            clock: EvictionClock::new(),
            config,
        }
    }

    pub fn config(&self) -> Config {
        self.config
    }

    pub fn create_address_space(&self) -> VmResult<AddressSpace> {
        AddressSpace::create()
    }

    pub fn copy_address_space(&self, src: &AddressSpace, direct_map: &impl KernelDirectMap) -> VmResult<AddressSpace> {
        src.copy(&self.frame_table, &self.swap, direct_map)
    }

    pub fn destroy_address_space(&self, asp: &AddressSpace) {
        asp.destroy(&self.frame_table, &self.swap);
    }

    pub fn activate(&self, asp: &AddressSpace, tlb: &impl TlbPort) {
        asp.activate(tlb);
    }

    pub fn deactivate(&self, asp: &AddressSpace) {
        asp.deactivate();
    }

    pub fn define_region(&self, asp: &AddressSpace, vbase: u64, size: u64, readable: bool, writeable: bool, executable: bool) {
        asp.define_region(vbase, size, readable, writeable, executable);
    }

    pub fn prepare_load(&self, asp: &AddressSpace) -> VmResult<()> {
        asp.prepare_load()
    }

    pub fn complete_load(&self, asp: &AddressSpace) -> VmResult<()> {
        asp.complete_load()
    }

    /// Lays out the fixed-size user stack ending at the configured
    /// `userstack` boundary. Returns the initial stack pointer.
    pub fn define_stack(&self, asp: &AddressSpace) -> u64 {
        asp.define_stack(self.config.userstack, self.config.stack_pages)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn handle_fault(
        &self,
        asp: &AddressSpace,
        tlb: &impl TlbPort,
        direct_map: &impl KernelDirectMap,
        fault_type: FaultType,
        vaddr: u64,
    ) -> VmResult<()> {
        fault::handle_fault(
            asp,
            &self.frame_table,
            &self.swap,
            tlb,
            direct_map,
            &self.clock,
            &self.config,
            fault_type,
            vaddr,
        )
    }

    pub fn adjust_break(&self, asp: &AddressSpace, delta: i64) -> VmResult<u64> {
        heap::adjust_break(asp, &self.frame_table, &self.swap, &self.config, delta)
    }

    /// Allocates `n` contiguous kernel-owned frames, evicting once if
    /// `n == 1` and no FREE frame is available outright.
    pub fn alloc_kpages(&self, n: usize, tlb: &impl TlbPort, direct_map: &impl KernelDirectMap) -> VmResult<Frame> {
        let head = evict::alloc_kernel(&self.frame_table, &self.swap, tlb, direct_map, &self.clock, n)?;
        Ok(Frame::from_index(head as u64))
    }

    pub fn free_kpages(&self, head: Frame) {
        self.frame_table.free_kernel_run(head.index() as usize);
    }

    pub fn coremap_used_bytes(&self) -> u64 {
        self.frame_table.used_bytes()
    }

    pub fn swap_used_slots(&self) -> usize {
        self.swap.used_slots()
    }
}

