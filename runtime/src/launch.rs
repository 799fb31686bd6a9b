//! Launching a kernel over its grid.
//!
//! A launch runs in phases on one device:
//!
//! 1. Validate operand counts, aliases and compiler hints.
//! 2. Prefetch the scalar operands into SMEM and resolve the grid.
//! 3. Allocate outputs in HBM; aliased outputs take over their input's storage.
//! 4. Run the grid. Each execution unit allocates the kernel scratch, then for
//!    every step stages the operand windows, runs the body and writes staged
//!    output windows back.
//! 5. Release everything the launch reserved and check for semaphore leaks.
//!
//! Any error aborts the launch: scopes are unwound and no outputs are returned.

use std::collections::HashSet;
use std::sync::Arc;

use bon::bon;
use rayon::prelude::*;
use smallvec::SmallVec;
use snafu::{ResultExt, ensure};
use tessel_device::{
    Buffer, BufferSlot, Device, DeviceRegistry, MemRef, MemorySpace, SemaphoreKind, SemaphoreSlot,
};
use tessel_dtype::{DType, HasDType};

use crate::block_spec::{BlockMapping, BlockSpec, Placement};
use crate::config::CompilerParams;
use crate::cost::{CostEstimate, LaunchCounters, LaunchStats};
use crate::error::{
    DeviceSnafu, FusionHintLengthSnafu, InvalidAliasSnafu, InvalidBoundArgumentSnafu, OperandCountSnafu,
    PaddingWithAliasingSnafu, Result, ThreadPoolSnafu,
};
use crate::grid::{GridPartition, GridPoint, GridSpec};
use crate::kernel::{Kernel, KernelContext, LaunchEnv};
use crate::prefetch::PrefetchedScalars;
use crate::scope::{Allocation, FrameKind, LaunchPools, ScopeStack, ScratchShape, close_frame};

/// Dtype and shape of one launch result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputShape {
    pub dtype: DType,
    pub shape: SmallVec<[usize; 4]>,
}

impl OutputShape {
    pub fn new(dtype: DType, shape: &[usize]) -> Self {
        Self { dtype, shape: SmallVec::from_slice(shape) }
    }

    pub fn of<T: HasDType>(shape: &[usize]) -> Self {
        Self::new(T::DTYPE, shape)
    }

    pub fn bytes(&self) -> usize {
        self.dtype.bytes() * self.shape.iter().product::<usize>()
    }
}

/// Runtime arguments of one launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchArgs {
    /// Scalar-prefetch operands first, then the windowed inputs.
    pub operands: Vec<Buffer>,
    /// Single-element integer buffers read by dynamic grid bounds.
    pub bounds: Vec<Buffer>,
}

impl LaunchArgs {
    pub fn new(operands: Vec<Buffer>) -> Self {
        Self { operands, bounds: Vec::new() }
    }

    pub fn with_bounds(mut self, bounds: Vec<Buffer>) -> Self {
        self.bounds = bounds;
        self
    }
}

/// Where a launch runs.
#[derive(Debug, Clone)]
pub struct Target {
    pub device: Arc<Device>,
    /// Mesh the device belongs to; required for remote copies and signals.
    pub mesh: Option<Arc<DeviceRegistry>>,
}

impl Target {
    pub fn device(device: Arc<Device>) -> Self {
        Self { device, mesh: None }
    }

    /// Device `id` of `mesh`.
    pub fn in_mesh(mesh: &Arc<DeviceRegistry>, id: usize) -> Result<Self> {
        let device = Arc::clone(mesh.device(id).context(DeviceSnafu)?);
        Ok(Self { device, mesh: Some(Arc::clone(mesh)) })
    }
}

#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub outputs: Vec<Buffer>,
    pub stats: LaunchStats,
}

/// Something that can be launched on a target: a single call or a batched one.
pub trait Launch: Send + Sync {
    fn launch(&self, target: &Target, args: &LaunchArgs) -> Result<LaunchReport>;

    fn name(&self) -> &str;

    fn num_outputs(&self) -> usize;

    /// Operand positions whose storage an output takes over.
    fn aliased_inputs(&self) -> Vec<usize>;

    /// Collective launches reserve a barrier semaphore on every device.
    fn collective_id(&self) -> Option<u32> {
        None
    }
}

/// A kernel together with its grid, operand windows and scratch.
#[derive(Clone)]
pub struct TileCall {
    kernel: Arc<dyn Kernel>,
    name: String,
    out_shapes: Vec<OutputShape>,
    grid: GridSpec,
    num_scalar_prefetch: usize,
    in_specs: Option<Vec<BlockSpec>>,
    out_specs: Option<Vec<BlockSpec>>,
    scratch_shapes: Vec<ScratchShape>,
    aliases: Vec<(usize, usize)>,
    params: CompilerParams,
}

impl std::fmt::Debug for TileCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCall")
            .field("name", &self.name)
            .field("out_shapes", &self.out_shapes)
            .field("grid", &self.grid)
            .field("num_scalar_prefetch", &self.num_scalar_prefetch)
            .field("scratch_shapes", &self.scratch_shapes)
            .field("aliases", &self.aliases)
            .finish_non_exhaustive()
    }
}

#[bon]
impl TileCall {
    /// Create a call with builder pattern.
    ///
    /// `input_output_aliases` pairs count operand positions including the
    /// scalar-prefetch operands.
    #[builder(finish_fn = build)]
    #[allow(clippy::too_many_arguments)]
    pub fn builder(
        kernel: Arc<dyn Kernel>,
        out_shapes: Vec<OutputShape>,
        #[builder(default)] grid: GridSpec,
        #[builder(default)] num_scalar_prefetch: usize,
        in_specs: Option<Vec<BlockSpec>>,
        out_specs: Option<Vec<BlockSpec>>,
        #[builder(default)] scratch_shapes: Vec<ScratchShape>,
        #[builder(default)] input_output_aliases: Vec<(usize, usize)>,
        #[builder(default)] compiler_params: CompilerParams,
        #[builder(into)] name: Option<String>,
    ) -> Self {
        Self {
            kernel,
            name: name.unwrap_or_else(|| "kernel".to_string()),
            out_shapes,
            grid,
            num_scalar_prefetch,
            in_specs,
            out_specs,
            scratch_shapes,
            aliases: input_output_aliases,
            params: compiler_params,
        }
    }
}

/// Launch state shared by all execution units.
struct Prepared<'a> {
    env: LaunchEnv,
    pools: LaunchPools,
    scalars: &'a PrefetchedScalars,
    inputs: &'a [Buffer],
    outputs: Vec<Buffer>,
    in_maps: Vec<BlockMapping>,
    out_maps: Vec<BlockMapping>,
}

/// Where a staged window is written back after the body.
struct Writeback {
    local: MemRef,
    window: MemRef,
}

impl TileCall {
    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn compiler_params(&self) -> &CompilerParams {
        &self.params
    }

    /// Launch on a single device and return the outputs.
    pub fn call(&self, device: &Arc<Device>, operands: &[Buffer]) -> Result<Vec<Buffer>> {
        let report = self.launch(&Target::device(Arc::clone(device)), &LaunchArgs::new(operands.to_vec()))?;
        Ok(report.outputs)
    }

    /// Cost hint for a scheduler: the caller's estimate, or the bytes the
    /// launch reads and writes.
    pub fn cost_estimate(&self, operands: &[Buffer]) -> CostEstimate {
        self.params.cost_estimate.unwrap_or_else(|| {
            let read: usize = operands.iter().map(Buffer::size).sum();
            let written: usize = self.out_shapes.iter().map(OutputShape::bytes).sum();
            CostEstimate::new(0, 0, (read + written) as u64)
        })
    }

    fn num_inputs(&self, operands: usize) -> usize {
        operands.saturating_sub(self.num_scalar_prefetch)
    }

    fn in_spec(&self, input: usize) -> BlockSpec {
        self.in_specs.as_ref().and_then(|specs| specs.get(input).cloned()).unwrap_or_default()
    }

    fn out_spec(&self, output: usize) -> BlockSpec {
        self.out_specs.as_ref().and_then(|specs| specs.get(output).cloned()).unwrap_or_default()
    }

    fn validate(&self, operands: &[Buffer]) -> Result<()> {
        ensure!(
            operands.len() >= self.num_scalar_prefetch,
            OperandCountSnafu { what: "operands", expected: self.num_scalar_prefetch, actual: operands.len() }
        );
        let num_inputs = self.num_inputs(operands.len());
        if let Some(specs) = &self.in_specs {
            ensure!(
                specs.len() == num_inputs,
                OperandCountSnafu { what: "input block specs", expected: num_inputs, actual: specs.len() }
            );
        }
        if let Some(specs) = &self.out_specs {
            ensure!(
                specs.len() == self.out_shapes.len(),
                OperandCountSnafu { what: "output block specs", expected: self.out_shapes.len(), actual: specs.len() }
            );
        }

        let mut seen_inputs = HashSet::new();
        let mut seen_outputs = HashSet::new();
        for &(input, output) in &self.aliases {
            let invalid = |reason: &str| InvalidAliasSnafu { input, output, reason: reason.to_string() };
            ensure!(input < operands.len(), invalid("no such operand"));
            ensure!(output < self.out_shapes.len(), invalid("no such output"));
            ensure!(seen_inputs.insert(input), invalid("input aliased twice"));
            ensure!(seen_outputs.insert(output), invalid("output aliased twice"));

            let buffer = &operands[input];
            let out = &self.out_shapes[output];
            ensure!(buffer.dtype() == out.dtype, invalid("dtype differs"));
            ensure!(buffer.shape() == out.shape.as_slice(), invalid("shape differs"));
            if let Some(windowed) = input.checked_sub(self.num_scalar_prefetch) {
                let padded = self.in_spec(windowed).indexing_mode.has_padding();
                ensure!(!padded, PaddingWithAliasingSnafu { input });
            }
        }

        if let Some(hints) = &self.params.allow_input_fusion {
            ensure!(
                hints.len() == operands.len(),
                FusionHintLengthSnafu { expected: operands.len(), actual: hints.len() }
            );
            tracing::debug!(kernel = %self.name, ?hints, "input fusion hints accepted");
        }
        Ok(())
    }

    fn read_bounds(bounds: &[Buffer]) -> Result<Vec<i64>> {
        bounds
            .iter()
            .enumerate()
            .map(|(i, buffer)| {
                let invalid = |reason: String| InvalidBoundArgumentSnafu { source_desc: format!("argument {i}"), reason };
                ensure!(buffer.numel() == 1, invalid(format!("expected one element, got shape {:?}", buffer.shape())));
                let mut bytes = vec![0u8; buffer.size()];
                buffer.copyout(&mut bytes).context(DeviceSnafu)?;
                let dtype = buffer.dtype();
                dtype.read_index(&bytes).ok_or_else(|| invalid(format!("dtype {dtype} is not an integer")).build())
            })
            .collect()
    }

    fn run(&self, target: &Target, args: &LaunchArgs, scalars: &PrefetchedScalars) -> Result<LaunchReport> {
        let device = &target.device;
        let inputs = &args.operands[self.num_scalar_prefetch..];

        let bounds = Self::read_bounds(&args.bounds)?;
        let grid = self.grid.resolve(&bounds, scalars)?;
        tracing::debug!(kernel = %self.name, extents = ?grid.extents(), steps = grid.total_steps(), "grid resolved");

        let in_maps = inputs
            .iter()
            .enumerate()
            .map(|(i, buffer)| {
                BlockMapping::resolve(&self.in_spec(i), format!("input {i}"), buffer.shape(), buffer.dtype())
            })
            .collect::<Result<Vec<_>>>()?;
        let out_maps = self
            .out_shapes
            .iter()
            .enumerate()
            .map(|(j, out)| BlockMapping::resolve(&self.out_spec(j), format!("output {j}"), &out.shape, out.dtype))
            .collect::<Result<Vec<_>>>()?;

        let mut outputs = Vec::with_capacity(self.out_shapes.len());
        for (j, out) in self.out_shapes.iter().enumerate() {
            let buffer = match self.aliases.iter().find(|(_, output)| *output == j) {
                Some(&(input, _)) => args.operands[input].clone(),
                None => device.allocate(MemorySpace::Hbm, out.dtype, &out.shape).context(DeviceSnafu)?,
            };
            device.register_buffer(BufferSlot::Output(j), &buffer);
            outputs.push(buffer);
        }
        for (i, buffer) in inputs.iter().enumerate() {
            device.register_buffer(BufferSlot::Input(i), buffer);
        }

        let barrier = match self.params.collective_id {
            Some(_) => {
                Some(device.semaphore(SemaphoreSlot::Barrier, SemaphoreKind::Barrier, &[]).context(DeviceSnafu)?)
            }
            None => None,
        };
        let prepared = Prepared {
            env: LaunchEnv {
                name: self.name.clone(),
                device: Arc::clone(device),
                mesh: target.mesh.clone(),
                barrier,
                counters: LaunchCounters::default(),
            },
            pools: LaunchPools::new(device, self.params.vmem_limit_bytes),
            scalars,
            inputs,
            outputs,
            in_maps,
            out_maps,
        };

        let partitions = grid.partition(self.grid.core_split());
        if partitions.len() > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(partitions.len())
                .thread_name(|index| format!("tessel-core-{index}"))
                .build()
                .map_err(|err| ThreadPoolSnafu { reason: err.to_string() }.build())?;
            pool.install(|| partitions.par_iter().try_for_each(|partition| self.run_unit(partition, &prepared)))?;
        } else {
            partitions.iter().try_for_each(|partition| self.run_unit(partition, &prepared))?;
        }

        let stats = prepared.env.counters.snapshot(partitions.len());
        Ok(LaunchReport { outputs: prepared.outputs, stats })
    }

    fn run_unit(&self, partition: &GridPartition, prepared: &Prepared<'_>) -> Result<()> {
        let env = &prepared.env;
        let mut scopes = ScopeStack::new(Arc::clone(&env.device), prepared.pools.clone(), partition.unit);
        let scratch = scopes.push_requests(FrameKind::Kernel, &self.scratch_shapes)?;
        tracing::trace!(kernel = %env.name, unit = partition.unit, steps = partition.steps(), "unit start");

        let mut result = Ok(());
        for point in partition.points() {
            scopes.push(FrameKind::Step);
            let step = self.run_step(point, &scratch, &mut scopes, prepared);
            result = close_frame(&mut scopes, step);
            if result.is_err() {
                break;
            }
        }

        match result {
            Ok(()) => scopes.pop(),
            Err(err) => {
                scopes.unwind();
                Err(err)
            }
        }
    }

    fn run_step(
        &self,
        point: GridPoint,
        scratch: &[Allocation],
        scopes: &mut ScopeStack,
        prepared: &Prepared<'_>,
    ) -> Result<()> {
        let env = &prepared.env;
        tracing::trace!(kernel = %env.name, step = point.step(), indices = ?point.indices(), "grid step");

        let mut in_views = Vec::with_capacity(prepared.inputs.len());
        for (mapping, buffer) in prepared.in_maps.iter().zip(prepared.inputs) {
            let (view, _) = Self::stage(mapping, buffer, &point, prepared, scopes)?;
            in_views.push(view);
        }
        let mut out_views = Vec::with_capacity(prepared.outputs.len());
        let mut writebacks = Vec::new();
        for (mapping, buffer) in prepared.out_maps.iter().zip(&prepared.outputs) {
            let (view, writeback) = Self::stage(mapping, buffer, &point, prepared, scopes)?;
            out_views.push(view);
            writebacks.extend(writeback);
        }

        let mut ctx = KernelContext::new(point, prepared.scalars, in_views, out_views, scratch, scopes, env);
        self.kernel.run(&mut ctx)?;

        for Writeback { local, window } in writebacks {
            window.copy_from(&local).context(DeviceSnafu)?;
            env.counters.written_back(local.size_bytes());
        }
        env.counters.step();
        Ok(())
    }

    /// View of `buffer` the body sees at `point`, plus the writeback owed for staged windows.
    fn stage(
        mapping: &BlockMapping,
        buffer: &Buffer,
        point: &GridPoint,
        prepared: &Prepared<'_>,
        scopes: &mut ScopeStack,
    ) -> Result<(MemRef, Option<Writeback>)> {
        match mapping.placement() {
            Placement::Whole => Ok((buffer.view(), None)),
            Placement::Direct => {
                let axes = mapping.window(point, prepared.scalars)?;
                Ok((MemRef::with_axes(buffer.clone(), &axes).context(DeviceSnafu)?, None))
            }
            Placement::Staged => {
                let axes = mapping.window(point, prepared.scalars)?;
                let window = MemRef::with_axes(buffer.clone(), &axes).context(DeviceSnafu)?;
                let local = scopes.buffer(mapping.space(), mapping.dtype(), &mapping.window_shape())?.view();
                local.copy_from(&window).context(DeviceSnafu)?;
                prepared.env.counters.staged(mapping.window_bytes());
                Ok((local.clone(), Some(Writeback { local, window })))
            }
        }
    }
}

impl Launch for TileCall {
    #[tracing::instrument(skip_all, fields(kernel = %self.name, device = target.device.id()))]
    fn launch(&self, target: &Target, args: &LaunchArgs) -> Result<LaunchReport> {
        let device = &target.device;
        let _guard = device.lock_launch();
        self.validate(&args.operands)?;
        tracing::debug!(
            operands = args.operands.len(),
            outputs = self.out_shapes.len(),
            scratch = self.scratch_shapes.len(),
            "launch begin"
        );

        let scalars = PrefetchedScalars::prefetch(device, &args.operands[..self.num_scalar_prefetch])?;
        let result = self.run(target, args, &scalars);
        scalars.release();

        let mut leak = None;
        for (slot, sem) in device.clear_slots() {
            let residual = sem.residual();
            sem.release();
            if residual != 0 && leak.is_none() {
                tracing::debug!(?slot, residual, "semaphore left signaled at launch end");
                leak = Some(tessel_device::Error::SemaphoreLeak {
                    kind: sem.kind(),
                    shape: sem.array_shape().to_vec(),
                    residual,
                });
            }
        }

        let report = result?;
        if let Some(source) = leak {
            return Err(source).context(DeviceSnafu);
        }
        tracing::debug!(
            steps = report.stats.steps,
            units = report.stats.units,
            dma_bytes = report.stats.dma_bytes,
            "launch end"
        );
        Ok(report)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn num_outputs(&self) -> usize {
        self.out_shapes.len()
    }

    fn aliased_inputs(&self) -> Vec<usize> {
        self.aliases.iter().map(|&(input, _)| input).collect()
    }

    fn collective_id(&self) -> Option<u32> {
        self.params.collective_id
    }
}
