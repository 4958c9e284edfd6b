//! Demonstration binary wiring a [`vmcore::VmSystem`] to in-process stand-ins
//! for the hardware collaborators a real kernel would supply: a TLB, a swap
//! backing device, and the kernel's direct-mapped window onto physical RAM.

use std::sync::Mutex;

use log::info;

use vmcore::{
    BackingDevice, Config, EntryHi, EntryLo, FaultType, Frame, KernelDirectMap, TlbPort, VmResult, VmSystem, PAGE_SIZE,
};

const FRAME_COUNT: usize = 64;
const SWAP_SLOTS: usize = 64;

struct HostRam {
    frames: Mutex<Vec<[u8; PAGE_SIZE.as_raw() as usize]>>,
}

impl HostRam {
    fn new(count: usize) -> Self {
        HostRam {
            frames: Mutex::new(vec![[0u8; PAGE_SIZE.as_raw() as usize]; count]),
        }
    }
}

impl KernelDirectMap for HostRam {
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

struct HostSwapFile {
    slots: Mutex<Vec<[u8; PAGE_SIZE.as_raw() as usize]>>,
}

impl HostSwapFile {
    fn new(count: usize) -> Self {
        HostSwapFile {
            slots: Mutex::new(vec![[0u8; PAGE_SIZE.as_raw() as usize]; count]),
        }
    }
}

impl BackingDevice for HostSwapFile {
    fn size_in_slots(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    fn read_page(&self, slot: usize, buf: &mut [u8; PAGE_SIZE.as_raw() as usize]) -> VmResult<()> {
        buf.copy_from_slice(&self.slots.lock().unwrap()[slot]);
        Ok(())
    }

    fn write_page(&self, slot: usize, buf: &[u8; PAGE_SIZE.as_raw() as usize]) -> VmResult<()> {
        self.slots.lock().unwrap()[slot].copy_from_slice(buf);
        Ok(())
    }
}

#[derive(Default)]
struct HostTlb {
    installs: Mutex<usize>,
}

impl TlbPort for HostTlb {
    fn install_random(&self, _entry_hi: EntryHi, _entry_lo: EntryLo) {
        *self.installs.lock().unwrap() += 1;
    }

    fn probe(&self, _entry_hi: EntryHi) -> Option<usize> {
        None
    }

    fn write_slot(&self, _slot: usize, _entry_hi: EntryHi, _entry_lo: EntryLo) {}

    fn flush_all(&self) {}
}

fn main() {
    env_logger::init();

    let direct_map = HostRam::new(FRAME_COUNT);
    let tlb = HostTlb::default();
    let sys = VmSystem::bootstrap(
        FRAME_COUNT as u64 * PAGE_SIZE.as_raw(),
        0,
        HostSwapFile::new(SWAP_SLOTS),
        Config::default(),
    );

    let asp = sys.create_address_space().expect("create address space");
    sys.define_region(&asp, 0x400000, 4 * PAGE_SIZE.as_raw(), true, false, true);
    sys.prepare_load(&asp).expect("prepare load");
    sys.complete_load(&asp).expect("complete load");
    let sp = sys.define_stack(&asp);
    info!("address space ready, initial stack pointer {sp:#x}");

    sys.activate(&asp, &tlb);

    sys.handle_fault(&asp, &tlb, &direct_map, FaultType::Read, 0x400000)
        .expect("zero-fill fault");
    info!("touched text page, coremap now using {} bytes", sys.coremap_used_bytes());

    let old_break = sys.adjust_break(&asp, 2 * PAGE_SIZE.as_raw() as i64).expect("grow heap");
    info!("heap grown, previous break was {old_break:#x}");
    sys.handle_fault(&asp, &tlb, &direct_map, FaultType::Write, old_break)
        .expect("heap fault");

    let child = sys.copy_address_space(&asp, &direct_map).expect("fork address space");
    info!(
        "forked address space; parent coremap {} bytes, shared frame table still one instance",
        sys.coremap_used_bytes()
    );

    sys.destroy_address_space(&child);
    sys.destroy_address_space(&asp);
    info!("torn down, coremap now using {} bytes", sys.coremap_used_bytes());
}
