//! Batched launches.
//!
//! [`Vmap`] runs its inner launch once per batch element, each with that
//! element's slice of the mapped operands, and stacks the results along a new
//! leading axis. Every element is an independent launch: its own grid, its own
//! prefetched scalars, its own scratch.

use snafu::{OptionExt, ResultExt, ensure};
use tessel_device::{Buffer, Device, Indexer, MemorySpace};

use crate::cost::LaunchStats;
use crate::error::{DeviceSnafu, InvalidBatchSnafu, Result};
use crate::launch::{Launch, LaunchArgs, LaunchReport, Target};

/// How one argument is batched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchAxis {
    /// Axis of the argument that carries the batch.
    Mapped(usize),
    /// Shared by every batch element.
    #[default]
    NotMapped,
}

#[derive(Debug, Clone)]
pub struct Vmap<L> {
    inner: L,
    in_axes: Vec<BatchAxis>,
    bound_axes: Vec<BatchAxis>,
    axis_size: Option<usize>,
}

impl<L: Launch> Vmap<L> {
    /// Batch `inner` over the operands; one axis entry per operand.
    pub fn new(inner: L, in_axes: &[BatchAxis]) -> Self {
        Self { inner, in_axes: in_axes.to_vec(), bound_axes: Vec::new(), axis_size: None }
    }

    /// Batch the dynamic grid bounds as well; unlisted bounds are shared.
    pub fn bound_axes(mut self, axes: &[BatchAxis]) -> Self {
        self.bound_axes = axes.to_vec();
        self
    }

    /// Batch size for launches where no argument is mapped.
    pub fn axis_size(mut self, size: usize) -> Self {
        self.axis_size = Some(size);
        self
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    fn batch_size(&self, args: &LaunchArgs) -> Result<usize> {
        ensure!(
            self.in_axes.len() == args.operands.len(),
            InvalidBatchSnafu {
                reason: format!("{} in_axes for {} operands", self.in_axes.len(), args.operands.len())
            }
        );
        ensure!(
            self.bound_axes.len() <= args.bounds.len(),
            InvalidBatchSnafu {
                reason: format!("{} bound axes for {} bounds", self.bound_axes.len(), args.bounds.len())
            }
        );

        let mapped = self.in_axes.iter().zip(&args.operands).chain(self.bound_axes.iter().zip(&args.bounds));
        let mut size = self.axis_size;
        for (axis, buffer) in mapped {
            let BatchAxis::Mapped(axis) = *axis else { continue };
            let extent = *buffer.shape().get(axis).context(InvalidBatchSnafu {
                reason: format!("batch axis {axis} out of range for shape {:?}", buffer.shape()),
            })?;
            match size {
                None => size = Some(extent),
                Some(size) => ensure!(
                    size == extent,
                    InvalidBatchSnafu { reason: format!("batch sizes differ: {size} and {extent}") }
                ),
            }
        }
        size.context(InvalidBatchSnafu { reason: "no mapped argument and no axis_size" })
    }

    /// Arguments of batch element `index`.
    fn element_args(&self, device: &Device, args: &LaunchArgs, index: usize, size: usize) -> Result<LaunchArgs> {
        let aliased = self.inner.aliased_inputs();
        let mut operands = Vec::with_capacity(args.operands.len());
        for (position, (axis, buffer)) in self.in_axes.iter().zip(&args.operands).enumerate() {
            // Aliased inputs are updated in place; they never share the caller's storage.
            let in_place = aliased.contains(&position);
            let operand = match *axis {
                BatchAxis::Mapped(axis) if size == 1 && !in_place => squeeze(buffer, axis)?,
                BatchAxis::Mapped(axis) => take(device, buffer, axis, index)?,
                BatchAxis::NotMapped if in_place => copy(device, buffer)?,
                BatchAxis::NotMapped => buffer.clone(),
            };
            operands.push(operand);
        }

        let mut bounds = Vec::with_capacity(args.bounds.len());
        for (position, buffer) in args.bounds.iter().enumerate() {
            let bound = match self.bound_axes.get(position).copied().unwrap_or_default() {
                BatchAxis::Mapped(axis) => take(device, buffer, axis, index)?,
                BatchAxis::NotMapped => buffer.clone(),
            };
            bounds.push(bound);
        }
        Ok(LaunchArgs { operands, bounds })
    }
}

/// Element `index` of `buffer` along `axis`, copied into HBM.
fn take(device: &Device, buffer: &Buffer, axis: usize, index: usize) -> Result<Buffer> {
    let mut indexers = vec![Indexer::Full; buffer.shape().len()];
    indexers[axis] = Indexer::Index(index as i64);
    let element = buffer.view().at(&indexers).context(DeviceSnafu)?;

    let out = device.allocate(MemorySpace::Hbm, buffer.dtype(), &element.shape()).context(DeviceSnafu)?;
    out.view().copy_from(&element).context(DeviceSnafu)?;
    Ok(out)
}

/// Drop an extent-one axis without copying.
fn squeeze(buffer: &Buffer, axis: usize) -> Result<Buffer> {
    let mut shape = buffer.shape().to_vec();
    shape.remove(axis);
    buffer.reshape(&shape).context(DeviceSnafu)
}

fn copy(device: &Device, buffer: &Buffer) -> Result<Buffer> {
    let out = device.allocate(MemorySpace::Hbm, buffer.dtype(), buffer.shape()).context(DeviceSnafu)?;
    out.view().copy_from(&buffer.view()).context(DeviceSnafu)?;
    Ok(out)
}

/// Stack per-element results along a new leading axis.
fn stack(device: &Device, elements: &[Buffer]) -> Result<Buffer> {
    let first = elements.first().context(InvalidBatchSnafu { reason: "nothing to stack" })?;
    let mut shape = vec![elements.len()];
    shape.extend_from_slice(first.shape());
    let out = device.allocate(MemorySpace::Hbm, first.dtype(), &shape).context(DeviceSnafu)?;
    for (index, element) in elements.iter().enumerate() {
        let row = out.view().at(&[Indexer::Index(index as i64)]).context(DeviceSnafu)?;
        row.copy_from(&element.view()).context(DeviceSnafu)?;
    }
    Ok(out)
}

impl<L: Launch> Launch for Vmap<L> {
    fn launch(&self, target: &Target, args: &LaunchArgs) -> Result<LaunchReport> {
        let size = self.batch_size(args)?;
        ensure!(size > 0, InvalidBatchSnafu { reason: "batch of size zero" });
        let device = &target.device;
        tracing::debug!(kernel = %self.inner.name(), batch = size, "batched launch");

        let mut stats = LaunchStats::default();
        let mut per_output: Vec<Vec<Buffer>> = vec![Vec::with_capacity(size); self.inner.num_outputs()];
        for index in 0..size {
            let element = self.element_args(device, args, index, size)?;
            let report = self.inner.launch(target, &element)?;
            stats.merge(&report.stats);
            for (column, output) in per_output.iter_mut().zip(report.outputs) {
                column.push(output);
            }
        }

        let outputs = per_output
            .iter()
            .map(|column| match column.as_slice() {
                [single] => {
                    let mut shape = vec![1];
                    shape.extend_from_slice(single.shape());
                    single.reshape(&shape).context(DeviceSnafu)
                }
                elements => stack(device, elements),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(LaunchReport { outputs, stats })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn num_outputs(&self) -> usize {
        self.inner.num_outputs()
    }

    fn aliased_inputs(&self) -> Vec<usize> {
        self.inner.aliased_inputs()
    }

    fn collective_id(&self) -> Option<u32> {
        self.inner.collective_id()
    }
}
