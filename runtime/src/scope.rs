//! Scoped allocation.
//!
//! Kernel scratch, per-step staging windows and `run_scoped` regions all
//! allocate through an explicit stack of frames. Popping a frame releases its
//! resources inner to outer and checks that every semaphore it owned drained
//! back to zero.

use std::sync::Arc;

use smallvec::SmallVec;
use snafu::{OptionExt, ResultExt};
use tessel_device::{
    Allocator, Buffer, BudgetedAllocator, BufferSlot, Device, MemRef, MemorySpace, SemaphoreKind, SemaphoreRef,
    SemaphoreSlot,
};
use tessel_dtype::DType;

use crate::error::{DeviceSnafu, Result, ScratchKindSnafu};

/// Shape of one scratch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScratchShape {
    Buffer { space: MemorySpace, dtype: DType, shape: SmallVec<[usize; 4]> },
    Semaphore { kind: SemaphoreKind, shape: SmallVec<[usize; 2]> },
}

impl ScratchShape {
    pub fn buffer(space: MemorySpace, dtype: DType, shape: &[usize]) -> Self {
        Self::Buffer { space, dtype, shape: SmallVec::from_slice(shape) }
    }

    pub fn vmem(dtype: DType, shape: &[usize]) -> Self {
        Self::buffer(MemorySpace::Vmem, dtype, shape)
    }

    pub fn smem(dtype: DType, shape: &[usize]) -> Self {
        Self::buffer(MemorySpace::Smem, dtype, shape)
    }

    pub fn semaphores(kind: SemaphoreKind, shape: &[usize]) -> Self {
        Self::Semaphore { kind, shape: SmallVec::from_slice(shape) }
    }

    pub fn regular() -> Self {
        Self::semaphores(SemaphoreKind::Regular, &[])
    }

    pub fn dma() -> Self {
        Self::semaphores(SemaphoreKind::Dma, &[])
    }
}

/// Result of one scratch request.
#[derive(Debug, Clone)]
pub enum Allocation {
    Buffer(MemRef),
    Semaphore(SemaphoreRef),
}

impl Allocation {
    pub fn memref(&self) -> Option<&MemRef> {
        match self {
            Self::Buffer(view) => Some(view),
            Self::Semaphore(_) => None,
        }
    }

    pub fn semaphore(&self) -> Option<&SemaphoreRef> {
        match self {
            Self::Semaphore(sem) => Some(sem),
            Self::Buffer(_) => None,
        }
    }
}

/// Convenience accessors over a slice of allocations.
pub trait Allocations {
    fn memref(&self, index: usize) -> Result<&MemRef>;
    fn semaphore(&self, index: usize) -> Result<&SemaphoreRef>;
}

impl Allocations for [Allocation] {
    fn memref(&self, index: usize) -> Result<&MemRef> {
        self.get(index).and_then(Allocation::memref).context(ScratchKindSnafu { index, expected: "buffer" })
    }

    fn semaphore(&self, index: usize) -> Result<&SemaphoreRef> {
        self.get(index).and_then(Allocation::semaphore).context(ScratchKindSnafu { index, expected: "semaphore" })
    }
}

/// Allocators of one launch: device pools, with VMEM optionally narrowed by a launch budget.
#[derive(Debug, Clone)]
pub(crate) struct LaunchPools {
    hbm: Arc<dyn Allocator>,
    vmem: Arc<dyn Allocator>,
    smem: Arc<dyn Allocator>,
}

impl LaunchPools {
    pub fn new(device: &Device, vmem_limit: Option<usize>) -> Self {
        let vmem = Arc::clone(device.allocator(MemorySpace::Vmem));
        Self {
            hbm: Arc::clone(device.allocator(MemorySpace::Hbm)),
            vmem: match vmem_limit {
                Some(limit) => Arc::new(BudgetedAllocator::new(vmem, Some(limit))),
                None => vmem,
            },
            smem: Arc::clone(device.allocator(MemorySpace::Smem)),
        }
    }

    pub fn get(&self, space: MemorySpace) -> &Arc<dyn Allocator> {
        match space {
            MemorySpace::Hbm | MemorySpace::Unassigned => &self.hbm,
            MemorySpace::Vmem => &self.vmem,
            MemorySpace::Smem => &self.smem,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub(crate) enum FrameKind {
    Kernel,
    Step,
    Scoped,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    buffers: Vec<(Buffer, Option<BufferSlot>)>,
    semaphores: Vec<(SemaphoreRef, Option<SemaphoreSlot>)>,
}

/// Allocation stack of one execution unit.
#[derive(Debug)]
pub(crate) struct ScopeStack {
    device: Arc<Device>,
    pools: LaunchPools,
    unit: usize,
    next_seq: u64,
    frames: Vec<Frame>,
}

impl ScopeStack {
    pub fn new(device: Arc<Device>, pools: LaunchPools, unit: usize) -> Self {
        Self { device, pools, unit, next_seq: 0, frames: Vec::new() }
    }

    pub fn push(&mut self, kind: FrameKind) {
        self.frames.push(Frame { kind, buffers: Vec::new(), semaphores: Vec::new() });
    }

    fn top(&mut self) -> &mut Frame {
        if self.frames.is_empty() {
            self.push(FrameKind::Scoped);
        }
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Allocate an anonymous buffer in the innermost frame.
    pub fn buffer(&mut self, space: MemorySpace, dtype: DType, shape: &[usize]) -> Result<Buffer> {
        let buffer = Buffer::allocate(self.pools.get(space), dtype, shape).context(DeviceSnafu)?;
        self.top().buffers.push((buffer.clone(), None));
        Ok(buffer)
    }

    /// Push a frame holding one allocation per request.
    ///
    /// Kernel frames name their allocations by request position, scoped frames
    /// by a per-unit sequence number, so SPMD peers agree on slots.
    pub fn push_requests(&mut self, kind: FrameKind, requests: &[ScratchShape]) -> Result<Vec<Allocation>> {
        self.push(kind);
        let mut allocations = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            match self.allocate(kind, index, request) {
                Ok(allocation) => allocations.push(allocation),
                Err(err) => {
                    if let Err(cleanup) = self.pop() {
                        tracing::warn!(error = %cleanup, "releasing partially allocated scope");
                    }
                    return Err(err);
                }
            }
        }
        Ok(allocations)
    }

    fn allocate(&mut self, kind: FrameKind, index: usize, request: &ScratchShape) -> Result<Allocation> {
        let unit = self.unit;
        let seq = self.next_seq;
        self.next_seq += 1;
        match request {
            ScratchShape::Buffer { space, dtype, shape } => {
                let buffer = Buffer::allocate(self.pools.get(*space), *dtype, shape).context(DeviceSnafu)?;
                let slot = match kind {
                    FrameKind::Kernel => BufferSlot::Scratch { unit, index },
                    FrameKind::Step | FrameKind::Scoped => BufferSlot::Scoped { unit, seq },
                };
                self.device.register_buffer(slot, &buffer);
                self.top().buffers.push((buffer.clone(), Some(slot)));
                Ok(Allocation::Buffer(buffer.view()))
            }
            ScratchShape::Semaphore { kind: sem_kind, shape } => {
                let slot = match kind {
                    FrameKind::Kernel => SemaphoreSlot::Scratch { unit, index },
                    FrameKind::Step | FrameKind::Scoped => SemaphoreSlot::Scoped { unit, seq },
                };
                let sem = self.device.semaphore(slot, *sem_kind, shape).context(DeviceSnafu)?;
                self.top().semaphores.push((sem.clone(), Some(slot)));
                Ok(Allocation::Semaphore(sem))
            }
        }
    }

    /// Release the innermost frame. Every resource is released even when a
    /// semaphore leak is found; the first leak is reported.
    pub fn pop(&mut self) -> Result<()> {
        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };

        let mut leak = None;
        for (sem, slot) in frame.semaphores.iter().rev() {
            let residual = sem.residual();
            if residual != 0 && leak.is_none() {
                leak = Some(tessel_device::Error::SemaphoreLeak {
                    kind: sem.kind(),
                    shape: sem.array_shape().to_vec(),
                    residual,
                });
            }
            sem.release();
            if let Some(slot) = slot {
                self.device.remove_semaphore(*slot);
            }
        }
        for (buffer, slot) in frame.buffers.iter().rev() {
            buffer.release();
            if let Some(slot) = slot {
                self.device.unregister_buffer(*slot);
            }
        }
        tracing::trace!(frame = %frame.kind, unit = self.unit, depth = self.frames.len(), "scope released");

        match leak {
            Some(source) => Err(source).context(DeviceSnafu),
            None => Ok(()),
        }
    }

    /// Pop every frame after a failure, logging secondary errors.
    pub fn unwind(&mut self) {
        while !self.frames.is_empty() {
            if let Err(err) = self.pop() {
                tracing::warn!(error = %err, unit = self.unit, "error while unwinding scopes");
            }
        }
    }
}

/// Pop the frame opened for `result`'s computation and merge the outcomes;
/// the body's own error wins over a cleanup failure.
pub(crate) fn close_frame<R>(scopes: &mut ScopeStack, result: Result<R>) -> Result<R> {
    let popped = scopes.pop();
    match result {
        Ok(value) => popped.map(|()| value),
        Err(err) => {
            if let Err(cleanup) = popped {
                tracing::warn!(error = %cleanup, "error while releasing scope after failure");
            }
            Err(err)
        }
    }
}
