//! Kind-level error codes surfaced to the embedding kernel.
//!
//! The crate is `no_std`, so `VmError` implements `core::fmt::Display` by
//! hand rather than `std::error::Error`. Fatal invariant violations (a
//! corrupted frame table, a double eviction) are not represented here —
//! those `panic!`/`assert!` per the teacher's convention of never routing an
//! "impossible" condition through a typed error.

use core::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmError {
    /// No frame or PTE storage could be obtained, even after eviction.
    OutOfMemory,
    /// No swap slot is available.
    OutOfSwap,
    /// Fault on the kernel window, an unmapped region, or heap-shrink underflow.
    InvalidAddress,
    /// Write fault on a read-only, resident PTE.
    Permission,
    /// Backing-store I/O failure during swap-in/out.
    DeviceError,
    /// Concurrent eviction is in progress on the same frame; caller should retry.
    Busy,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::OutOfMemory => "out of memory",
            VmError::OutOfSwap => "out of swap",
            VmError::InvalidAddress => "invalid address",
            VmError::Permission => "permission denied",
            VmError::DeviceError => "backing device I/O error",
            VmError::Busy => "resource busy, retry",
        };
        f.write_str(msg)
    }
}

pub type VmResult<T> = Result<T, VmError>;
