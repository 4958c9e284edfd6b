//! Lock-class newtypes.
//!
//! The spec's four lock classes — frame-table, swap, address-space
//! structural (all non-sleeping spinning locks), and per-PTE (sleeping) —
//! are, in this crate, all backed by the teacher kernel's `spin::Mutex`: a
//! real scheduler-aware sleeping mutex is one of the synchronization
//! primitives this core treats as an external collaborator (see
//! `SPEC_FULL.md` §5.1). Distinct newtypes keep the four classes from being
//! accidentally interchanged at call sites and document, at a glance, which
//! class a given lock acquisition belongs to; a kernel that supplies its own
//! sleeping mutex need only change `EntryLock`'s definition.

use spin::{Mutex, MutexGuard};

macro_rules! lock_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        pub struct $name<T>(Mutex<T>);

        impl<T> $name<T> {
            pub const fn new(value: T) -> Self {
                Self(Mutex::new(value))
            }

            pub fn lock(&self) -> MutexGuard<'_, T> {
                self.0.lock()
            }

            pub fn is_locked(&self) -> bool {
                self.0.is_locked()
            }
        }
    };
}

lock_newtype!(FrameTableLock, "Guards the frame table's dense array of frame entries.");
lock_newtype!(SwapLock, "Guards the swap store's slot bitmap.");
lock_newtype!(StructuralLock, "Guards an address space's L1 pointer and heap range.");
lock_newtype!(EntryLock, "Guards a single page-table entry; may be held across sleeping operations.");
