//! Kernel bodies and the per-step context they run in.

use std::sync::Arc;

use snafu::{OptionExt, ResultExt};
use tessel_device::{
    Device, DeviceAddress, DeviceRegistry, DmaHandle, MemRef, RemoteDmaHandle, SemaphoreRef,
};

use crate::cost::LaunchCounters;
use crate::error::{DeviceSnafu, Error, MissingBarrierSnafu, NoMeshSnafu, OperandIndexSnafu, Result};
use crate::grid::GridPoint;
use crate::prefetch::PrefetchedScalars;
use crate::scope::{Allocation, Allocations, FrameKind, ScopeStack, ScratchShape, close_frame};

/// A kernel body, run once per grid step.
///
/// Any `Fn(&mut KernelContext) -> Result<()>` closure is a kernel.
pub trait Kernel: Send + Sync {
    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<()>;
}

impl<F> Kernel for F
where
    F: Fn(&mut KernelContext<'_>) -> Result<()> + Send + Sync,
{
    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        self(ctx)
    }
}

/// Wrap a closure as a shareable kernel.
pub fn kernel_fn<F>(f: F) -> Arc<dyn Kernel>
where
    F: Fn(&mut KernelContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// State shared by every execution unit of one launch.
#[derive(Debug)]
pub(crate) struct LaunchEnv {
    pub name: String,
    pub device: Arc<Device>,
    pub mesh: Option<Arc<DeviceRegistry>>,
    pub barrier: Option<SemaphoreRef>,
    pub counters: LaunchCounters,
}

/// Everything a kernel body can see and do during one grid step.
///
/// Views are handed out by value; they are cheap handles onto shared storage.
pub struct KernelContext<'a> {
    point: GridPoint,
    scalars: &'a PrefetchedScalars,
    inputs: Vec<MemRef>,
    outputs: Vec<MemRef>,
    scratch: &'a [Allocation],
    scopes: &'a mut ScopeStack,
    env: &'a LaunchEnv,
}

impl std::fmt::Debug for KernelContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelContext")
            .field("kernel", &self.env.name)
            .field("point", &self.point)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("scratch", &self.scratch.len())
            .finish()
    }
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        point: GridPoint,
        scalars: &'a PrefetchedScalars,
        inputs: Vec<MemRef>,
        outputs: Vec<MemRef>,
        scratch: &'a [Allocation],
        scopes: &'a mut ScopeStack,
        env: &'a LaunchEnv,
    ) -> Self {
        Self { point, scalars, inputs, outputs, scratch, scopes, env }
    }

    pub fn point(&self) -> &GridPoint {
        &self.point
    }

    pub fn program_id(&self, axis: usize) -> i64 {
        self.point.program_id(axis)
    }

    pub fn num_programs(&self, axis: usize) -> i64 {
        self.point.num_programs(axis)
    }

    pub fn is_first(&self, axis: usize) -> bool {
        self.point.is_first(axis)
    }

    pub fn is_last(&self, axis: usize) -> bool {
        self.point.is_last(axis)
    }

    /// SMEM copy of scalar-prefetch operand `i`.
    pub fn scalar(&self, i: usize) -> Result<MemRef> {
        let count = self.scalars.len();
        self.scalars.refs().get(i).cloned().context(OperandIndexSnafu { what: "scalar prefetch operand", index: i, count })
    }

    pub fn scalars(&self) -> &PrefetchedScalars {
        self.scalars
    }

    pub fn input(&self, i: usize) -> Result<MemRef> {
        let count = self.inputs.len();
        self.inputs.get(i).cloned().context(OperandIndexSnafu { what: "input", index: i, count })
    }

    pub fn output(&self, i: usize) -> Result<MemRef> {
        let count = self.outputs.len();
        self.outputs.get(i).cloned().context(OperandIndexSnafu { what: "output", index: i, count })
    }

    /// Kernel-scope scratch buffer `i`; persists across steps of this unit.
    pub fn scratch(&self, i: usize) -> Result<MemRef> {
        self.scratch.memref(i).cloned()
    }

    pub fn scratch_semaphore(&self, i: usize) -> Result<SemaphoreRef> {
        self.scratch.semaphore(i).cloned()
    }

    /// Allocate `shapes` for the duration of `body`.
    ///
    /// The allocations are released when `body` returns, whether it succeeds
    /// or not. A semaphore left with a non-zero count is a leak.
    pub fn run_scoped<R>(
        &mut self,
        shapes: &[ScratchShape],
        body: impl FnOnce(&mut KernelContext<'_>, &[Allocation]) -> Result<R>,
    ) -> Result<R> {
        let allocations = self.scopes.push_requests(FrameKind::Scoped, shapes)?;
        let result = body(self, &allocations);
        close_frame(self.scopes, result)
    }

    /// Start a local copy; `sem` is signaled by the bytes moved.
    pub fn async_copy(&self, src: &MemRef, dst: &MemRef, sem: &SemaphoreRef) -> Result<DmaHandle> {
        let handle = self.env.device.async_copy(src, dst, sem).context(DeviceSnafu)?;
        self.env.counters.dma(handle.bytes());
        Ok(handle)
    }

    /// Copy `src` into the peer's buffer occupying `dst`'s slot.
    pub fn async_remote_copy(
        &self,
        src: &MemRef,
        dst: &MemRef,
        send_sem: &SemaphoreRef,
        recv_sem: &SemaphoreRef,
        target: impl Into<DeviceAddress>,
    ) -> Result<RemoteDmaHandle> {
        let mesh = self.mesh("remote copy")?;
        let handle = mesh
            .remote_copy(&self.env.device, src, dst, send_sem, recv_sem, &target.into())
            .context(DeviceSnafu)?;
        self.env.counters.dma(handle.bytes());
        Ok(handle)
    }

    pub fn semaphore_signal(&self, sem: &SemaphoreRef, amount: u64) -> Result<()> {
        sem.signal(amount).context(DeviceSnafu)
    }

    pub fn semaphore_signal_remote(
        &self,
        sem: &SemaphoreRef,
        amount: u64,
        target: impl Into<DeviceAddress>,
    ) -> Result<()> {
        self.mesh("remote signal")?.signal_remote(sem, amount, &target.into()).context(DeviceSnafu)
    }

    /// Block until `sem` holds at least `amount`, then take it.
    pub fn semaphore_wait(&self, sem: &SemaphoreRef, amount: u64) -> Result<()> {
        sem.wait(amount, self.env.device.stall_timeout()).context(DeviceSnafu)
    }

    pub fn semaphore_read(&self, sem: &SemaphoreRef) -> Result<u64> {
        sem.read().context(DeviceSnafu)
    }

    /// Barrier semaphore reserved for a collective launch.
    pub fn barrier_semaphore(&self) -> Result<SemaphoreRef> {
        self.env.barrier.clone().context(MissingBarrierSnafu)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.env.device
    }

    pub fn device_id(&self) -> usize {
        self.env.device.id()
    }

    pub fn num_devices(&self) -> usize {
        self.env.mesh.as_ref().map_or(1, |mesh| mesh.len())
    }

    /// Coordinate of this device along a named mesh axis.
    pub fn axis_index(&self, name: &str) -> Result<usize> {
        let mesh = self.mesh("axis_index")?;
        mesh.topology().axis_index(self.device_id(), name).context(DeviceSnafu)
    }

    pub fn axis_size(&self, name: &str) -> Result<usize> {
        self.mesh("axis_size")?.topology().axis_size(name).context(DeviceSnafu)
    }

    /// Error attributed to this kernel.
    pub fn fail(&self, message: impl Into<String>) -> Error {
        Error::Kernel { kernel: self.env.name.clone(), message: message.into() }
    }

    fn mesh(&self, what: &'static str) -> Result<&Arc<DeviceRegistry>> {
        self.env.mesh.as_ref().context(NoMeshSnafu { what })
    }
}
