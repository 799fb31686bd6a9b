//! Launch-stable names for buffers and semaphores.
//!
//! Every device of an SPMD launch runs the same program, so the n-th scoped
//! allocation on one device corresponds to the n-th on every peer. Remote
//! copies and signals travel by slot and are rebound on the target.

/// Position of a buffer within a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferSlot {
    Input(usize),
    Output(usize),
    /// Kernel-scope scratch of one execution unit.
    Scratch { unit: usize, index: usize },
    /// Allocation made by the `seq`-th scoped request of one execution unit.
    Scoped { unit: usize, seq: u64 },
}

/// Position of a semaphore within a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SemaphoreSlot {
    Barrier,
    Scratch { unit: usize, index: usize },
    Scoped { unit: usize, seq: u64 },
}
