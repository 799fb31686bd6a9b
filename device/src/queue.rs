//! DMA work queue.
//!
//! Copies are executed by a dedicated rayon pool so that a kernel body blocked
//! in `wait` never starves the transfers it is waiting for.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{DmaFailedSnafu, Result, WorkerPoolSnafu};
use crate::sync::SemaphoreRef;
use crate::view::MemRef;

/// Semaphore increment performed when a transfer reaches a milestone.
#[derive(Debug, Clone)]
pub(crate) struct Completion {
    pub sem: SemaphoreRef,
    pub amount: u64,
}

impl Completion {
    fn fire(&self, status: &TransferStatus) {
        if let Err(err) = self.sem.signal(self.amount) {
            status.fail(err.to_string());
        }
    }
}

/// Point a transfer has reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Milestone {
    #[default]
    Queued,
    Read,
    Written,
}

#[derive(Debug, Default)]
struct TransferState {
    reached: Milestone,
    failure: Option<String>,
}

/// Progress and outcome of one transfer as observed by its worker.
///
/// A shared semaphore only counts bytes; this is what ties a handle to its own copy.
#[derive(Debug, Default)]
pub(crate) struct TransferStatus {
    state: Mutex<TransferState>,
    changed: Condvar,
}

impl TransferStatus {
    fn fail(&self, reason: String) {
        self.state.lock().failure.get_or_insert(reason);
    }

    fn reach(&self, milestone: Milestone) {
        let mut state = self.state.lock();
        state.reached = state.reached.max(milestone);
        self.changed.notify_all();
    }

    /// Block until the transfer reaches `milestone`, then report its failure, if any.
    pub fn wait(&self, milestone: Milestone, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        while state.reached < milestone {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() && state.reached < milestone {
                        return DmaFailedSnafu { reason: format!("transfer not {milestone:?} before timeout") }
                            .fail();
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        match state.failure.clone() {
            Some(reason) => DmaFailedSnafu { reason }.fail(),
            None => Ok(()),
        }
    }
}

/// Operation waiting for a DMA worker.
#[derive(Debug)]
pub(crate) enum PendingOp {
    Copy {
        src: MemRef,
        dst: MemRef,
        /// Fired once the source has been read (send side of remote copies).
        on_read: Option<Completion>,
        /// Fired once the destination has been written.
        on_write: Completion,
        status: Arc<TransferStatus>,
    },
}

pub struct DmaQueue {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl std::fmt::Debug for DmaQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaQueue").field("workers", &self.workers).finish()
    }
}

impl DmaQueue {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("tessel-dma-{index}"))
            .build()
            .map_err(|err| WorkerPoolSnafu { reason: err.to_string() }.build())?;
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub(crate) fn submit(&self, op: PendingOp) {
        self.pool.spawn(move || Self::execute_op(op));
    }

    fn execute_op(op: PendingOp) {
        match op {
            PendingOp::Copy { src, dst, on_read, on_write, status } => {
                match src.read_bytes() {
                    Ok(bytes) => {
                        status.reach(Milestone::Read);
                        if let Some(completion) = &on_read {
                            completion.fire(&status);
                        }
                        if let Err(err) = dst.write_bytes(&bytes) {
                            status.fail(err.to_string());
                        }
                    }
                    Err(err) => {
                        status.fail(err.to_string());
                        status.reach(Milestone::Read);
                        if let Some(completion) = &on_read {
                            completion.fire(&status);
                        }
                    }
                }
                status.reach(Milestone::Written);
                // Always fire so a failed transfer surfaces at `wait` instead of stalling it.
                on_write.fire(&status);
            }
        }
    }
}
