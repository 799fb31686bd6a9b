//! Cost hints and launch counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counts a scheduler may use to place a launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CostEstimate {
    pub flops: u64,
    pub transcendentals: u64,
    pub bytes_accessed: u64,
}

impl CostEstimate {
    pub fn new(flops: u64, transcendentals: u64, bytes_accessed: u64) -> Self {
        Self { flops, transcendentals, bytes_accessed }
    }
}

/// What one launch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchStats {
    /// Grid steps executed across all units.
    pub steps: u64,
    /// Execution units the grid was split into.
    pub units: usize,
    pub windows_staged: u64,
    pub bytes_staged: u64,
    pub bytes_written_back: u64,
    pub dma_transfers: u64,
    pub dma_bytes: u64,
}

impl LaunchStats {
    pub fn merge(&mut self, other: &LaunchStats) {
        self.steps += other.steps;
        self.units += other.units;
        self.windows_staged += other.windows_staged;
        self.bytes_staged += other.bytes_staged;
        self.bytes_written_back += other.bytes_written_back;
        self.dma_transfers += other.dma_transfers;
        self.dma_bytes += other.dma_bytes;
    }
}

/// Counters shared by the execution units of one launch.
#[derive(Debug, Default)]
pub(crate) struct LaunchCounters {
    steps: AtomicU64,
    windows_staged: AtomicU64,
    bytes_staged: AtomicU64,
    bytes_written_back: AtomicU64,
    dma_transfers: AtomicU64,
    dma_bytes: AtomicU64,
}

impl LaunchCounters {
    pub fn step(&self) {
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn staged(&self, bytes: usize) {
        self.windows_staged.fetch_add(1, Ordering::Relaxed);
        self.bytes_staged.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn written_back(&self, bytes: usize) {
        self.bytes_written_back.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn dma(&self, bytes: u64) {
        self.dma_transfers.fetch_add(1, Ordering::Relaxed);
        self.dma_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self, units: usize) -> LaunchStats {
        LaunchStats {
            steps: self.steps.load(Ordering::Relaxed),
            units,
            windows_staged: self.windows_staged.load(Ordering::Relaxed),
            bytes_staged: self.bytes_staged.load(Ordering::Relaxed),
            bytes_written_back: self.bytes_written_back.load(Ordering::Relaxed),
            dma_transfers: self.dma_transfers.load(Ordering::Relaxed),
            dma_bytes: self.dma_bytes.load(Ordering::Relaxed),
        }
    }
}
