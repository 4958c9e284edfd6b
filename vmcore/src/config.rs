//! Runtime configuration of the simulated machine.
//!
//! The teacher kernel bakes its physical memory ceiling into compile-time
//! constants (`MAX_MEMORY`, `MAX_MEMORY_FRAMES` in `src/mm.rs`). This core
//! generalizes that into a small `Config` value threaded through
//! `bootstrap`/`init`, since the test suite needs to exercise machines of
//! very different sizes (down to a single allocable frame, per the boundary
//! cases in the spec).

use crate::page::PAGE_SIZE;

/// Geometry of the user virtual address space and machine sizing.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Exclusive top of the user stack; the stack grows downward from here.
    pub userstack: u64,
    /// Number of pages reserved below `userstack` for the stack itself.
    pub stack_pages: u64,
}

impl Config {
    /// A reasonable default for a 32-bit address space: a 2 MiB user stack
    /// reservation ending just below the 2 GiB mark.
    pub const fn default_32bit() -> Config {
        Config {
            userstack: 0x8000_0000,
            stack_pages: 512,
        }
    }

    pub const fn stack_reserve(&self) -> u64 {
        self.stack_pages * PAGE_SIZE.as_raw()
    }

    pub const fn heap_ceiling(&self) -> u64 {
        self.userstack - self.stack_reserve()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::default_32bit()
    }
}
