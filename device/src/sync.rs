//! Counting semaphores.
//!
//! Kernels coordinate DMA completion, cross-core and cross-device progress
//! through counting semaphores. A semaphore count never goes negative: `wait`
//! blocks until the count covers the requested amount, then subtracts it.
//!
//! # Design
//!
//! Each element is a `parking_lot` mutex-guarded counter plus a condvar.
//! Arrays share one allocation; a [`SemaphoreRef`] is an array plus the
//! leading indices already applied, so `sem.at(&[i])` is cheap and can be
//! computed at run time. Only references that resolve to a single element may
//! be signaled or waited on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use snafu::ensure;

use crate::error::{IndexOutOfBoundsSnafu, NonScalarSemaphoreSnafu, Result, StallSnafu, UseAfterReleaseSnafu};
use crate::slot::SemaphoreSlot;

/// Purpose a semaphore was allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum SemaphoreKind {
    /// General signal/wait between program steps, cores or devices.
    #[strum(to_string = "regular")]
    Regular,
    /// DMA completion; counts bytes moved.
    #[strum(to_string = "DMA")]
    Dma,
    /// Cross-device barrier reserved for a collective launch.
    #[strum(to_string = "barrier")]
    Barrier,
}

/// Single counting semaphore.
#[derive(Debug, Default)]
pub struct CountingSemaphore {
    count: Mutex<u64>,
    condvar: Condvar,
}

impl CountingSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u64 {
        *self.count.lock()
    }

    pub fn signal(&self, amount: u64) {
        *self.count.lock() += amount;
        self.condvar.notify_all();
    }

    /// Block until the count reaches `amount`, then subtract it.
    ///
    /// Without a timeout an unmatched wait blocks forever, exactly like the
    /// hardware it models.
    pub fn wait(&self, amount: u64, timeout: Option<Duration>) -> Result<()> {
        let mut count = self.count.lock();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        while *count < amount {
            match deadline {
                None => self.condvar.wait(&mut count),
                Some(deadline) => {
                    if self.condvar.wait_until(&mut count, deadline).timed_out() && *count < amount {
                        return StallSnafu {
                            kind: SemaphoreKind::Regular,
                            amount,
                            count: *count,
                            timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
                        }
                        .fail();
                    }
                }
            }
        }
        *count -= amount;
        Ok(())
    }
}

/// Shared storage of a semaphore array.
#[derive(Debug)]
struct SemaphoreArray {
    kind: SemaphoreKind,
    shape: SmallVec<[usize; 2]>,
    cells: Box<[CountingSemaphore]>,
    slot: Option<SemaphoreSlot>,
    released: AtomicBool,
}

/// Handle to a semaphore or a sub-array of one.
#[derive(Debug, Clone)]
pub struct SemaphoreRef {
    array: Arc<SemaphoreArray>,
    index: SmallVec<[usize; 2]>,
}

impl SemaphoreRef {
    /// Allocate a semaphore array; an empty shape is a scalar semaphore.
    pub fn new(kind: SemaphoreKind, shape: &[usize]) -> Self {
        Self::with_slot(kind, shape, None)
    }

    pub(crate) fn with_slot(kind: SemaphoreKind, shape: &[usize], slot: Option<SemaphoreSlot>) -> Self {
        let cells = (0..shape.iter().product::<usize>()).map(|_| CountingSemaphore::new()).collect();
        let array = SemaphoreArray {
            kind,
            shape: SmallVec::from_slice(shape),
            cells,
            slot,
            released: AtomicBool::new(false),
        };
        Self { array: Arc::new(array), index: SmallVec::new() }
    }

    pub fn kind(&self) -> SemaphoreKind {
        self.array.kind
    }

    /// Shape remaining after the applied indices.
    pub fn shape(&self) -> &[usize] {
        &self.array.shape[self.index.len()..]
    }

    /// Shape of the whole allocation.
    pub fn array_shape(&self) -> &[usize] {
        &self.array.shape
    }

    pub fn index(&self) -> &[usize] {
        &self.index
    }

    pub fn slot(&self) -> Option<SemaphoreSlot> {
        self.array.slot
    }

    pub fn is_scalar(&self) -> bool {
        self.shape().is_empty()
    }

    pub fn is_live(&self) -> bool {
        !self.array.released.load(Ordering::Acquire)
    }

    pub fn same_array(&self, other: &SemaphoreRef) -> bool {
        Arc::ptr_eq(&self.array, &other.array)
    }

    /// Select elements along the leading remaining axes.
    pub fn at(&self, index: &[usize]) -> Result<Self> {
        let shape = self.shape();
        ensure!(
            index.len() <= shape.len() && index.iter().zip(shape).all(|(i, d)| i < d),
            IndexOutOfBoundsSnafu { index: index.iter().map(|&i| i as i64).collect::<Vec<_>>(), shape: shape.to_vec() }
        );
        let mut selected = self.index.clone();
        selected.extend_from_slice(index);
        Ok(Self { array: Arc::clone(&self.array), index: selected })
    }

    /// Same position inside another array of identical kind and shape.
    pub fn rebind(&self, other: &SemaphoreRef) -> Result<Self> {
        other.at(&self.index)
    }

    fn cell(&self) -> Result<&CountingSemaphore> {
        ensure!(self.is_live(), UseAfterReleaseSnafu { what: "semaphore" });
        ensure!(self.is_scalar(), NonScalarSemaphoreSnafu { shape: self.shape().to_vec() });
        let linear = self.index.iter().zip(self.array.shape.iter()).fold(0, |acc, (i, d)| acc * d + i);
        Ok(&self.array.cells[linear])
    }

    pub fn signal(&self, amount: u64) -> Result<()> {
        self.cell()?.signal(amount);
        Ok(())
    }

    pub fn wait(&self, amount: u64, timeout: Option<Duration>) -> Result<()> {
        self.cell()?.wait(amount, timeout).map_err(|err| match err {
            crate::Error::Stall { amount, count, timeout_ms, .. } => {
                crate::Error::Stall { kind: self.kind(), amount, count, timeout_ms }
            }
            other => other,
        })
    }

    pub fn read(&self) -> Result<u64> {
        Ok(self.cell()?.value())
    }

    /// Sum of counts across the whole allocation.
    pub fn residual(&self) -> u64 {
        self.array.cells.iter().map(CountingSemaphore::value).sum()
    }

    /// Mark the allocation released. Returns `false` if already released.
    pub fn release(&self) -> bool {
        !self.array.released.swap(true, Ordering::AcqRel)
    }
}
