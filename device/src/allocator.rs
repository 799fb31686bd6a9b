use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use snafu::ensure;

use crate::error::{MemoryLimitExceededSnafu, Result};
use crate::memory::MemorySpace;

/// Host-resident backing bytes of one allocation.
///
/// Guarded by a reader-writer lock: DMA workers and kernel bodies touch the
/// same storage from different threads.
#[derive(Debug)]
pub struct RawBuffer {
    data: RwLock<Box<[u8]>>,
}

impl RawBuffer {
    pub fn zeroed(size: usize) -> Self {
        Self { data: RwLock::new(vec![0u8; size].into_boxed_slice()) }
    }

    /// Get the size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.data.read().len()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }
}

/// Allocation counters of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub allocations: usize,
    pub frees: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub total_bytes: usize,
}

pub trait Allocator: Send + Sync + std::fmt::Debug {
    fn alloc(&self, size: usize) -> Result<RawBuffer>;
    fn free(&self, _size: usize) {}
    fn space(&self) -> MemorySpace;
    fn name(&self) -> &str;
    fn stats(&self) -> AllocationStats {
        AllocationStats::default()
    }
}

/// Allocator drawing zeroed storage from host memory.
#[derive(Debug, Clone)]
pub struct HostAllocator {
    space: MemorySpace,
}

impl HostAllocator {
    pub fn new(space: MemorySpace) -> Self {
        Self { space: space.backing() }
    }
}

impl Allocator for HostAllocator {
    fn alloc(&self, size: usize) -> Result<RawBuffer> {
        Ok(RawBuffer::zeroed(size))
    }

    fn space(&self) -> MemorySpace {
        self.space
    }

    fn name(&self) -> &str {
        "host"
    }
}

/// Allocator enforcing a byte budget over an inner allocator.
///
/// Budgets stack: a launch-scoped limit wraps the device pool, so an
/// allocation must fit both.
#[derive(Debug)]
pub struct BudgetedAllocator {
    inner: Arc<dyn Allocator>,
    limit: Option<usize>,
    stats: Mutex<AllocationStats>,
    name: String,
}

impl BudgetedAllocator {
    pub fn new(inner: Arc<dyn Allocator>, limit: Option<usize>) -> Self {
        let name = format!("{}:{}", inner.name(), inner.space());
        Self { inner, limit, stats: Mutex::new(AllocationStats::default()), name }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

impl Allocator for BudgetedAllocator {
    fn alloc(&self, size: usize) -> Result<RawBuffer> {
        let mut stats = self.stats.lock();
        if let Some(limit) = self.limit {
            ensure!(
                stats.live_bytes + size <= limit,
                MemoryLimitExceededSnafu { space: self.space(), requested: size, live: stats.live_bytes, limit }
            );
        }

        let raw = self.inner.alloc(size)?;
        stats.allocations += 1;
        stats.live_bytes += size;
        stats.total_bytes += size;
        stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);
        Ok(raw)
    }

    fn free(&self, size: usize) {
        self.inner.free(size);
        let mut stats = self.stats.lock();
        stats.frees += 1;
        stats.live_bytes = stats.live_bytes.saturating_sub(size);
    }

    fn space(&self) -> MemorySpace {
        self.inner.space()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> AllocationStats {
        *self.stats.lock()
    }
}
