//! Emulated accelerator device.
//!
//! A device owns one budgeted pool per memory tier, a DMA engine, and the slot
//! tables through which peers address its launch-scoped buffers and
//! semaphores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use snafu::ensure;
use tessel_dtype::{DType, Element};

use crate::allocator::{AllocationStats, Allocator, BudgetedAllocator, HostAllocator};
use crate::buffer::{Buffer, BufferId};
use crate::config::DeviceConfig;
use crate::dma::{DmaEngine, DmaHandle};
use crate::error::{PeerUnavailableSnafu, Result, ShapeMismatchSnafu, SemaphoreKindMismatchSnafu};
use crate::memory::MemorySpace;
use crate::slot::{BufferSlot, SemaphoreSlot};
use crate::sync::{SemaphoreKind, SemaphoreRef};
use crate::view::MemRef;

#[derive(Debug, Default)]
struct BufferTable {
    entries: HashMap<BufferSlot, Buffer>,
    slots: HashMap<BufferId, BufferSlot>,
}

#[derive(Debug)]
pub struct Device {
    id: usize,
    config: DeviceConfig,
    /// Indexed by `MemorySpace::pool_index`.
    pools: [Arc<dyn Allocator>; 3],
    dma: DmaEngine,
    buffers: Mutex<BufferTable>,
    buffer_registered: Condvar,
    semaphores: Mutex<HashMap<SemaphoreSlot, SemaphoreRef>>,
    launch: Mutex<()>,
}

impl Device {
    pub fn new(id: usize, config: DeviceConfig) -> Result<Arc<Self>> {
        let pool = |space: MemorySpace, limit: Option<usize>| -> Arc<dyn Allocator> {
            Arc::new(BudgetedAllocator::new(Arc::new(HostAllocator::new(space)), limit))
        };
        let pools = [
            pool(MemorySpace::Hbm, config.hbm_limit_bytes),
            pool(MemorySpace::Vmem, Some(config.vmem_limit_bytes)),
            pool(MemorySpace::Smem, Some(config.smem_limit_bytes)),
        ];
        let dma = DmaEngine::new(config.dma_workers, config.stall_timeout)?;
        tracing::debug!(device.id = id, ?config, "device created");

        Ok(Arc::new(Self {
            id,
            config,
            pools,
            dma,
            buffers: Mutex::new(BufferTable::default()),
            buffer_registered: Condvar::new(),
            semaphores: Mutex::new(HashMap::new()),
            launch: Mutex::new(()),
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.config.stall_timeout
    }

    pub fn dma(&self) -> &DmaEngine {
        &self.dma
    }

    pub fn allocator(&self, space: MemorySpace) -> &Arc<dyn Allocator> {
        &self.pools[space.pool_index()]
    }

    pub fn stats(&self, space: MemorySpace) -> AllocationStats {
        self.allocator(space).stats()
    }

    pub fn allocate(&self, space: MemorySpace, dtype: DType, shape: &[usize]) -> Result<Buffer> {
        Buffer::allocate(self.allocator(space), dtype, shape)
    }

    pub fn buffer_from_slice<T: Element>(&self, space: MemorySpace, values: &[T], shape: &[usize]) -> Result<Buffer> {
        Buffer::from_slice(self.allocator(space), values, shape)
    }

    /// Rank-0 buffer holding `value`.
    pub fn scalar<T: Element>(&self, space: MemorySpace, value: T) -> Result<Buffer> {
        Buffer::from_slice(self.allocator(space), &[value], &[])
    }

    pub fn async_copy(&self, src: &MemRef, dst: &MemRef, sem: &SemaphoreRef) -> Result<DmaHandle> {
        self.dma.start(src, dst, sem)
    }

    /// Serialize launches on this device.
    pub fn lock_launch(&self) -> MutexGuard<'_, ()> {
        self.launch.lock()
    }

    pub fn register_buffer(&self, slot: BufferSlot, buffer: &Buffer) {
        let mut table = self.buffers.lock();
        table.slots.insert(buffer.id(), slot);
        table.entries.insert(slot, buffer.clone());
        self.buffer_registered.notify_all();
    }

    pub fn unregister_buffer(&self, slot: BufferSlot) {
        let mut table = self.buffers.lock();
        if let Some(buffer) = table.entries.remove(&slot) {
            table.slots.remove(&buffer.id());
        }
    }

    pub fn slot_of(&self, buffer: &Buffer) -> Option<BufferSlot> {
        self.buffers.lock().slots.get(&buffer.id()).copied()
    }

    /// Buffer registered under `slot`, waiting for the owning program to
    /// register it if it has not yet.
    pub fn resolve_buffer(&self, slot: BufferSlot, timeout: Option<Duration>) -> Result<Buffer> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut table = self.buffers.lock();
        loop {
            if let Some(buffer) = table.entries.get(&slot) {
                return Ok(buffer.clone());
            }
            match deadline {
                None => self.buffer_registered.wait(&mut table),
                Some(deadline) => {
                    if self.buffer_registered.wait_until(&mut table, deadline).timed_out()
                        && !table.entries.contains_key(&slot)
                    {
                        return PeerUnavailableSnafu {
                            device: self.id,
                            slot: format!("{slot:?}"),
                            timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
                        }
                        .fail();
                    }
                }
            }
        }
    }

    /// Semaphore in `slot`, created on first touch by either the owner or a peer.
    pub fn semaphore(&self, slot: SemaphoreSlot, kind: SemaphoreKind, shape: &[usize]) -> Result<SemaphoreRef> {
        let mut table = self.semaphores.lock();
        let sem = table.entry(slot).or_insert_with(|| SemaphoreRef::with_slot(kind, shape, Some(slot)));
        ensure!(sem.kind() == kind, SemaphoreKindMismatchSnafu { expected: kind, actual: sem.kind() });
        ensure!(
            sem.array_shape() == shape,
            ShapeMismatchSnafu { expected: shape.to_vec(), actual: sem.array_shape().to_vec() }
        );
        Ok(sem.clone())
    }

    pub fn remove_semaphore(&self, slot: SemaphoreSlot) -> Option<SemaphoreRef> {
        self.semaphores.lock().remove(&slot)
    }

    /// Drop every slot registration, returning semaphores still registered.
    pub fn clear_slots(&self) -> Vec<(SemaphoreSlot, SemaphoreRef)> {
        let mut table = self.buffers.lock();
        table.entries.clear();
        table.slots.clear();
        drop(table);
        self.semaphores.lock().drain().collect()
    }
}
