//! The coremap: a dense, per-physical-frame state array guarded by one
//! spinning lock. Grounded in the teacher kernel's
//! `shared::memory::alloc::phys::BitmapFrameAllocator` — same first-fit
//! linear-scan allocation policy and free/reserve bookkeeping — generalized
//! from a plain free/used bitmap into a richer per-frame state machine
//! (FREE/FIXED/USER/EVICTING) carrying ownership metadata, per
//! `SPEC_FULL.md` §3/§4.1.

use alloc::sync::Weak;
use alloc::vec::Vec;

use log::{debug, trace};

use crate::addrspace::AddressSpaceInner;
use crate::lock::FrameTableLock;
use crate::page::{Frame, Page, PAGE_SIZE};

/// Weak, lookup-only back-reference from a frame to the address space that
/// owns it. Never keeps the address space alive: `AddressSpace::destroy`
/// releases every frame it owns before the last strong `Arc` is dropped, so
/// in correct operation `upgrade()` never observes a torn-down owner: if it
/// does, the caller (eviction, `free_user`) treats it as already-gone.
pub type AsHandle = Weak<AddressSpaceInner>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameState {
    Free,
    Fixed,
    User,
    Evicting,
}

pub struct FrameEntry {
    pub state: FrameState,
    /// For a FIXED head frame, the number of contiguous frames in the run.
    /// Zero for interior frames of a run and for all other states.
    pub chunk_len: u32,
    pub owner: Option<AsHandle>,
    pub vpn: u64,
}

impl FrameEntry {
    const fn free() -> Self {
        FrameEntry {
            state: FrameState::Free,
            chunk_len: 0,
            owner: None,
            vpn: 0,
        }
    }
}

struct Inner {
    frames: Vec<FrameEntry>,
}

/// The physical frame table. One instance is created at boot by
/// [`FrameTable::bootstrap`] and lives for the life of the kernel.
pub struct FrameTable {
    inner: FrameTableLock<Inner>,
}

impl FrameTable {
    /// `ram_top` is the exclusive top of physical RAM in bytes; `first_free`
    /// is the inclusive byte address above the pre-boot kernel image
    /// (which includes the frame table's own backing storage, conceptually
    /// — this crate allocates that storage from the host/kernel heap
    /// instead, so `first_free` only needs to cover the kernel image
    /// proper). Returns the table and the number of frames left FREE.
    pub fn bootstrap(ram_top: u64, first_free: u64) -> (FrameTable, u64) {
        let total_frames = ram_top / PAGE_SIZE.as_raw();
        let first_free_frame = first_free.div_ceil(PAGE_SIZE.as_raw());

        let mut frames = Vec::with_capacity(total_frames as usize);
        let mut free_count = 0u64;
        for i in 0..total_frames {
            if i < first_free_frame {
                frames.push(FrameEntry {
                    state: FrameState::Fixed,
                    chunk_len: 0,
                    owner: None,
                    vpn: 0,
                });
            } else {
                frames.push(FrameEntry::free());
                free_count += 1;
            }
        }

        debug!(
            "frame table bootstrap: {total_frames} total frames, {free_count} free (first_free_frame={first_free_frame})"
        );

        (
            FrameTable {
                inner: FrameTableLock::new(Inner { frames }),
            },
            free_count,
        )
    }

    pub fn total_frames(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Low-level, non-evicting allocation of a single FREE frame, marked
    /// FIXED with `chunk_len = 1`. Returns the frame index.
    pub(crate) fn try_alloc_fixed_one(&self) -> Option<usize> {
        let mut inner = self.inner.lock();
        let idx = inner.frames.iter().position(|f| f.state == FrameState::Free)?;
        inner.frames[idx].state = FrameState::Fixed;
        inner.frames[idx].chunk_len = 1;
        trace!("alloc_kernel: frame {idx}");
        Some(idx)
    }

    /// Low-level, non-evicting allocation of `n` contiguous FREE frames.
    /// First-fit linear scan; the scan state is local to this call.
    pub(crate) fn try_alloc_fixed_run(&self, n: usize) -> Option<usize> {
        assert!(n > 0);
        let mut inner = self.inner.lock();
        let len = inner.frames.len();
        if n > len {
            return None;
        }

        let mut run_start = None;
        let mut run_len = 0usize;
        let mut found = None;
        for i in 0..len {
            if inner.frames[i].state == FrameState::Free {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == n {
                    found = run_start;
                    break;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }

        let head = found?;
        inner.frames[head].state = FrameState::Fixed;
        inner.frames[head].chunk_len = n as u32;
        for i in head + 1..head + n {
            inner.frames[i].state = FrameState::Fixed;
            inner.frames[i].chunk_len = 0;
        }

        trace!("alloc_kernel: run of {n} frames starting at {head}");
        Some(head)
    }

    /// Frees a kernel run starting at `head`. `head` must be a FIXED frame
    /// with `chunk_len > 0` (a run head); violating this is a corrupted
    /// frame-table state and is fatal, per §7.
    pub fn free_kernel_run(&self, head: usize) {
        let mut inner = self.inner.lock();
        let chunk_len = {
            let entry = &inner.frames[head];
            assert!(
                entry.state == FrameState::Fixed && entry.chunk_len > 0,
                "free_kernel called on non-head or non-FIXED frame {head}"
            );
            entry.chunk_len as usize
        };

        for i in head..head + chunk_len {
            inner.frames[i] = FrameEntry::free();
        }
        trace!("free_kernel: run of {chunk_len} frames starting at {head}");
    }

    /// Low-level, non-evicting allocation of a single FREE frame, marked
    /// USER-owned by `(owner, vpn)`.
    pub(crate) fn try_alloc_user_one(&self, owner: AsHandle, vpn: u64) -> Option<usize> {
        let mut inner = self.inner.lock();
        let idx = inner.frames.iter().position(|f| f.state == FrameState::Free)?;
        inner.frames[idx].state = FrameState::User;
        inner.frames[idx].chunk_len = 1;
        inner.frames[idx].owner = Some(owner);
        inner.frames[idx].vpn = vpn;
        trace!("alloc_user: frame {idx} owner vpn={vpn}");
        Some(idx)
    }

    /// Frees a user frame. If the frame is EVICTING, this is a silent
    /// no-op: the eviction engine owns the final USER/EVICTING -> FREE
    /// transition and the caller cannot assume the frame is free on return
    /// (§7, `free_user` open question).
    pub fn free_user(&self, index: usize) {
        let mut inner = self.inner.lock();
        match inner.frames[index].state {
            FrameState::Evicting => {
                trace!("free_user: frame {index} is EVICTING, deferring to eviction engine");
            }
            FrameState::User => {
                assert_eq!(inner.frames[index].chunk_len, 1);
                inner.frames[index] = FrameEntry::free();
                trace!("free_user: frame {index}");
            }
            other => panic!("free_user called on frame {index} in state {other:?}"),
        }
    }

    /// USER -> EVICTING. Rejects non-USER frames.
    pub fn mark_evicting(&self, index: usize) -> Option<()> {
        let mut inner = self.inner.lock();
        if inner.frames[index].state != FrameState::User {
            return None;
        }
        inner.frames[index].state = FrameState::Evicting;
        Some(())
    }

    /// EVICTING -> FREE. Asserts the frame was EVICTING; any other state is
    /// a corrupted frame-table invariant and is fatal.
    pub fn eviction_finished(&self, index: usize) {
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.frames[index].state,
            FrameState::Evicting,
            "eviction_finished called on non-EVICTING frame {index}"
        );
        inner.frames[index] = FrameEntry::free();
    }

    /// EVICTING -> USER, reverting a failed eviction attempt. The frame
    /// remains resident and owned; see the swap-exhaustion open question in
    /// §9 — unlike `eviction_finished`, this does *not* free the frame.
    pub fn revert_evicting_to_user(&self, index: usize) {
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.frames[index].state,
            FrameState::Evicting,
            "revert_evicting_to_user called on non-EVICTING frame {index}"
        );
        inner.frames[index].state = FrameState::User;
    }

    /// Runs `f` with a read-only view of frame `index`'s owner/vpn. Used by
    /// the eviction engine to locate the victim's PTE without holding the
    /// frame-table lock across the PTE-lock acquisition (§4.6, §5).
    pub fn owner_and_vpn(&self, index: usize) -> Option<(AsHandle, Page)> {
        let inner = self.inner.lock();
        let entry = &inner.frames[index];
        entry.owner.clone().map(|o| (o, Page::from_index(entry.vpn)))
    }

    /// Iterates candidate USER frames starting at `start`, wrapping once
    /// around the table, calling `f(index)` for each. Stops early if `f`
    /// returns `Some`. Used by the eviction engine's clock sweep; does not
    /// hold the frame-table lock across the callback — each call takes and
    /// releases the lock to read one entry's state, honoring the rule that
    /// the frame-table lock is never held across a PTE-lock acquisition.
    pub(crate) fn frame_state(&self, index: usize) -> FrameState {
        self.inner.lock().frames[index].state
    }

    pub fn used_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        let used = inner
            .frames
            .iter()
            .filter(|f| f.state != FrameState::Free)
            .count() as u64;
        used * PAGE_SIZE.as_raw()
    }
}
