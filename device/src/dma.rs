//! Asynchronous copies between memory tiers.
//!
//! # Design
//!
//! A DMA completion semaphore counts bytes. Starting a copy of `n` bytes
//! arranges for the semaphore to be signaled by `n` when the bytes land;
//! `DmaHandle::wait` waits for `n`. Several copies may therefore share one
//! semaphore, and waiting on all of their handles drains it to zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use snafu::ensure;

use crate::error::{
    AlreadyWaitedSnafu, DTypeMismatchSnafu, NonScalarSemaphoreSnafu, Result, SemaphoreKindMismatchSnafu,
    ShapeMismatchSnafu, SqueezeUnsupportedSnafu, UseAfterReleaseSnafu,
};
use crate::queue::{Completion, DmaQueue, Milestone, PendingOp, TransferStatus};
use crate::sync::{SemaphoreKind, SemaphoreRef};
use crate::view::MemRef;

/// Counters of one engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaStats {
    pub transfers: u64,
    pub bytes: u64,
}

/// Validate a copy endpoint pair and return the byte count moved.
pub(crate) fn validate_transfer(src: &MemRef, dst: &MemRef) -> Result<u64> {
    ensure!(src.is_live() && dst.is_live(), UseAfterReleaseSnafu { what: "DMA endpoint" });
    ensure!(src.dtype() == dst.dtype(), DTypeMismatchSnafu { expected: dst.dtype(), actual: src.dtype() });
    ensure!(src.shape() == dst.shape(), ShapeMismatchSnafu { expected: dst.shape().to_vec(), actual: src.shape().to_vec() });
    for endpoint in [src, dst] {
        ensure!(!endpoint.squeezes_minor(), SqueezeUnsupportedSnafu { rank: endpoint.buffer().shape().len() });
    }
    Ok(src.size_bytes() as u64)
}

pub(crate) fn validate_dma_semaphore(sem: &SemaphoreRef) -> Result<()> {
    ensure!(sem.is_live(), UseAfterReleaseSnafu { what: "semaphore" });
    ensure!(
        sem.kind() == SemaphoreKind::Dma,
        SemaphoreKindMismatchSnafu { expected: SemaphoreKind::Dma, actual: sem.kind() }
    );
    ensure!(sem.is_scalar(), NonScalarSemaphoreSnafu { shape: sem.shape().to_vec() });
    Ok(())
}

#[derive(Debug)]
pub struct DmaEngine {
    queue: DmaQueue,
    stall_timeout: Option<Duration>,
    transfers: AtomicU64,
    bytes: AtomicU64,
}

impl DmaEngine {
    pub fn new(workers: usize, stall_timeout: Option<Duration>) -> Result<Self> {
        Ok(Self { queue: DmaQueue::new(workers)?, stall_timeout, transfers: AtomicU64::new(0), bytes: AtomicU64::new(0) })
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout
    }

    pub fn stats(&self) -> DmaStats {
        DmaStats { transfers: self.transfers.load(Ordering::Relaxed), bytes: self.bytes.load(Ordering::Relaxed) }
    }

    /// Start a local copy; `sem` is signaled by the byte count on completion.
    pub fn start(&self, src: &MemRef, dst: &MemRef, sem: &SemaphoreRef) -> Result<DmaHandle> {
        let bytes = validate_transfer(src, dst)?;
        validate_dma_semaphore(sem)?;
        tracing::trace!(src.space = %src.space(), dst.space = %dst.space(), bytes, "dma start");

        let status = self.enqueue(src.clone(), dst.clone(), None, Completion { sem: sem.clone(), amount: bytes });
        Ok(DmaHandle { sem: sem.clone(), amount: bytes, status, timeout: self.stall_timeout })
    }

    pub(crate) fn enqueue(
        &self,
        src: MemRef,
        dst: MemRef,
        on_read: Option<Completion>,
        on_write: Completion,
    ) -> Arc<TransferStatus> {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(on_write.amount, Ordering::Relaxed);
        let status = Arc::new(TransferStatus::default());
        self.queue.submit(PendingOp::Copy { src, dst, on_read, on_write, status: Arc::clone(&status) });
        status
    }
}

/// In-flight local copy. Must be waited exactly once before the destination is read.
///
/// `wait` takes this copy's bytes from the semaphore and then blocks until this
/// copy, not just any copy on the same semaphore, has landed.
#[must_use = "a DMA must be waited before its destination is read"]
#[derive(Debug)]
pub struct DmaHandle {
    sem: SemaphoreRef,
    amount: u64,
    status: Arc<TransferStatus>,
    timeout: Option<Duration>,
}

impl DmaHandle {
    pub fn bytes(&self) -> u64 {
        self.amount
    }

    pub fn semaphore(&self) -> &SemaphoreRef {
        &self.sem
    }

    pub fn wait(self) -> Result<()> {
        self.sem.wait(self.amount, self.timeout)?;
        self.status.wait(Milestone::Written, self.timeout)
    }
}

/// In-flight copy to a peer device.
///
/// The send side completes once the local source has been read; the receive
/// side waits for the symmetric copy a peer makes into this device.
#[must_use = "both sides of a remote DMA must be waited"]
#[derive(Debug)]
pub struct RemoteDmaHandle {
    send: SemaphoreRef,
    recv: SemaphoreRef,
    amount: u64,
    status: Arc<TransferStatus>,
    timeout: Option<Duration>,
    sent: bool,
    received: bool,
}

impl RemoteDmaHandle {
    pub(crate) fn new(
        send: SemaphoreRef,
        recv: SemaphoreRef,
        amount: u64,
        status: Arc<TransferStatus>,
        timeout: Option<Duration>,
    ) -> Self {
        Self { send, recv, amount, status, timeout, sent: false, received: false }
    }

    pub fn bytes(&self) -> u64 {
        self.amount
    }

    pub fn wait_send(&mut self) -> Result<()> {
        ensure!(!self.sent, AlreadyWaitedSnafu { side: "send" });
        self.sent = true;
        self.send.wait(self.amount, self.timeout)?;
        self.status.wait(Milestone::Read, self.timeout)
    }

    pub fn wait_recv(&mut self) -> Result<()> {
        ensure!(!self.received, AlreadyWaitedSnafu { side: "receive" });
        self.received = true;
        self.recv.wait(self.amount, self.timeout)
    }

    /// Wait whichever sides have not been waited yet.
    pub fn wait(mut self) -> Result<()> {
        if !self.sent {
            self.wait_send()?;
        }
        if !self.received {
            self.wait_recv()?;
        }
        Ok(())
    }
}
