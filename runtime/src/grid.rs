//! Iteration grids.
//!
//! A grid is an ordered list of axes whose extents are fixed at definition or
//! read at launch. Steps run in row-major order: the last axis varies fastest.
//!
//! # Design
//!
//! Step counts are accumulated in `u128` and bounded by [`MAX_GRID_STEPS`],
//! so a grid can never wrap the step counter regardless of how many dynamic
//! axes it has. A core-parallel grid is split into contiguous chunks of one
//! axis; each chunk is traversed row-major by its own execution unit.

use smallvec::SmallVec;
use snafu::{OptionExt, ensure};

use crate::error::{
    GridTooLargeSnafu, InvalidBoundArgumentSnafu, InvalidCoreSplitSnafu, MissingBoundArgumentSnafu,
    NegativeGridBoundSnafu, Result,
};
use crate::prefetch::PrefetchedScalars;

/// Stand-in extent for a dynamic axis when bounding a grid before launch.
pub const DYNAMIC_DIM_PLACEHOLDER: u64 = i32::MAX as u64;

/// Largest number of steps a resolved grid may have.
pub const MAX_GRID_STEPS: u128 = i64::MAX as u128;

/// Where a dynamic extent is read from at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundSource {
    /// The i-th bound argument of the launch.
    Argument(usize),
    /// An element of a scalar-prefetch operand.
    Prefetched { operand: usize, index: usize },
}

/// Extent computed at launch as `value * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicBound {
    pub source: BoundSource,
    pub scale: i64,
    pub offset: i64,
}

impl DynamicBound {
    pub fn argument(index: usize) -> Self {
        Self { source: BoundSource::Argument(index), scale: 1, offset: 0 }
    }

    pub fn prefetched(operand: usize, index: usize) -> Self {
        Self { source: BoundSource::Prefetched { operand, index }, scale: 1, offset: 0 }
    }

    pub fn times(mut self, factor: i64) -> Self {
        self.scale *= factor;
        self.offset *= factor;
        self
    }

    pub fn plus(mut self, offset: i64) -> Self {
        self.offset += offset;
        self
    }

    fn resolve(&self, bounds: &[i64], scalars: &PrefetchedScalars) -> Result<i64> {
        let value = match self.source {
            BoundSource::Argument(index) => {
                *bounds.get(index).context(MissingBoundArgumentSnafu { index, available: bounds.len() })?
            }
            BoundSource::Prefetched { operand, index } => {
                scalars.get(operand, index).context(InvalidBoundArgumentSnafu {
                    source_desc: format!("prefetched[{operand}][{index}]"),
                    reason: format!("{} scalar operands prefetched", scalars.len()),
                })?
            }
        };
        value
            .checked_mul(self.scale)
            .and_then(|v| v.checked_add(self.offset))
            .context(GridTooLargeSnafu { steps: u128::MAX })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridDim {
    Static(usize),
    Dynamic(DynamicBound),
}

impl From<usize> for GridDim {
    fn from(extent: usize) -> Self {
        Self::Static(extent)
    }
}

impl From<DynamicBound> for GridDim {
    fn from(bound: DynamicBound) -> Self {
        Self::Dynamic(bound)
    }
}

/// Split of one grid axis across parallel execution units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreParallel {
    pub dim: usize,
    pub cores: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridSpec {
    dims: SmallVec<[GridDim; 4]>,
    core_parallel: Option<CoreParallel>,
}

impl GridSpec {
    pub fn new(dims: impl IntoIterator<Item = GridDim>) -> Self {
        Self { dims: dims.into_iter().collect(), core_parallel: None }
    }

    pub fn fixed(extents: &[usize]) -> Self {
        Self::new(extents.iter().map(|&extent| GridDim::Static(extent)))
    }

    /// Run chunks of axis `dim` on `cores` parallel units.
    pub fn core_parallel(mut self, dim: usize, cores: usize) -> Self {
        self.core_parallel = Some(CoreParallel { dim, cores });
        self
    }

    pub fn dims(&self) -> &[GridDim] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn core_split(&self) -> Option<CoreParallel> {
        self.core_parallel
    }

    pub fn is_dynamic(&self) -> bool {
        self.dims.iter().any(|dim| matches!(dim, GridDim::Dynamic(_)))
    }

    /// Upper bound on steps known before launch, with dynamic axes at the placeholder extent.
    pub fn static_step_bound(&self) -> u128 {
        self.dims.iter().fold(1u128, |acc, dim| {
            let extent = match dim {
                GridDim::Static(extent) => *extent as u128,
                GridDim::Dynamic(_) => DYNAMIC_DIM_PLACEHOLDER as u128,
            };
            acc.saturating_mul(extent)
        })
    }

    /// Fix every extent, reading dynamic ones from `bounds` and `scalars`.
    pub fn resolve(&self, bounds: &[i64], scalars: &PrefetchedScalars) -> Result<ResolvedGrid> {
        let mut extents = SmallVec::with_capacity(self.dims.len());
        let mut total = 1u128;
        for (axis, dim) in self.dims.iter().enumerate() {
            let value = match dim {
                GridDim::Static(extent) => *extent as i64,
                GridDim::Dynamic(bound) => bound.resolve(bounds, scalars)?,
            };
            ensure!(value >= 0, NegativeGridBoundSnafu { axis, value });
            total = total.checked_mul(value as u128).context(GridTooLargeSnafu { steps: u128::MAX })?;
            extents.push(value as usize);
        }
        ensure!(total <= MAX_GRID_STEPS, GridTooLargeSnafu { steps: total });

        if let Some(CoreParallel { dim, cores }) = self.core_parallel {
            ensure!(dim < self.dims.len() && cores > 0, InvalidCoreSplitSnafu { dim, cores, rank: self.dims.len() });
        }
        Ok(ResolvedGrid { extents, total: total as u64 })
    }
}

/// Grid with every extent fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGrid {
    extents: SmallVec<[usize; 4]>,
    total: u64,
}

impl ResolvedGrid {
    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    pub fn total_steps(&self) -> u64 {
        self.total
    }

    /// Every step in row-major order.
    pub fn points(&self) -> GridPoints {
        self.whole().points()
    }

    fn whole(&self) -> GridPartition {
        GridPartition {
            unit: 0,
            lower: SmallVec::from_elem(0, self.extents.len()),
            upper: self.extents.clone(),
            extents: self.extents.clone(),
        }
    }

    /// Contiguous chunks of the core-parallel axis, one per execution unit.
    pub fn split(&self, split: CoreParallel) -> Vec<GridPartition> {
        self.partition(Some(split))
    }

    /// Partition the grid across execution units; one partition without a split.
    ///
    /// Units that would receive no steps are omitted.
    pub fn partition(&self, split: Option<CoreParallel>) -> Vec<GridPartition> {
        let Some(CoreParallel { dim, cores }) = split else {
            return vec![self.whole()];
        };
        let extent = self.extents[dim];
        let chunk = extent.div_ceil(cores.max(1)).max(1);
        (0..cores)
            .map(|unit| {
                let mut partition = self.whole();
                partition.unit = unit;
                partition.lower[dim] = (unit * chunk).min(extent);
                partition.upper[dim] = ((unit + 1) * chunk).min(extent);
                partition
            })
            .filter(|partition| partition.steps() > 0)
            .collect()
    }
}

/// Box of grid indices `lower..upper` traversed by one execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridPartition {
    pub unit: usize,
    lower: SmallVec<[usize; 4]>,
    upper: SmallVec<[usize; 4]>,
    extents: SmallVec<[usize; 4]>,
}

impl GridPartition {
    pub fn steps(&self) -> u64 {
        self.lower.iter().zip(&self.upper).map(|(lo, hi)| hi.saturating_sub(*lo) as u64).product()
    }

    pub fn points(&self) -> GridPoints {
        let next = (self.steps() > 0).then(|| self.lower.clone());
        GridPoints { partition: self.clone(), next }
    }
}

/// Row-major iterator over a partition.
#[derive(Debug, Clone)]
pub struct GridPoints {
    partition: GridPartition,
    next: Option<SmallVec<[usize; 4]>>,
}

impl Iterator for GridPoints {
    type Item = GridPoint;

    fn next(&mut self) -> Option<GridPoint> {
        let current = self.next.take()?;

        let mut following = current.clone();
        let mut carry = true;
        for axis in (0..following.len()).rev() {
            following[axis] += 1;
            if following[axis] < self.partition.upper[axis] {
                carry = false;
                break;
            }
            following[axis] = self.partition.lower[axis];
        }
        if !carry {
            self.next = Some(following);
        }

        Some(GridPoint {
            indices: current.iter().map(|&i| i as i64).collect(),
            extents: self.partition.extents.clone(),
        })
    }
}

/// Position of one step within its grid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GridPoint {
    indices: SmallVec<[i64; 4]>,
    extents: SmallVec<[usize; 4]>,
}

impl GridPoint {
    pub fn new(indices: &[i64], extents: &[usize]) -> Self {
        Self { indices: SmallVec::from_slice(indices), extents: SmallVec::from_slice(extents) }
    }

    pub fn rank(&self) -> usize {
        self.indices.len()
    }

    pub fn indices(&self) -> &[i64] {
        &self.indices
    }

    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    pub fn program_id(&self, axis: usize) -> i64 {
        self.indices[axis]
    }

    pub fn num_programs(&self, axis: usize) -> i64 {
        self.extents[axis] as i64
    }

    pub fn is_first(&self, axis: usize) -> bool {
        self.indices[axis] == 0
    }

    pub fn is_last(&self, axis: usize) -> bool {
        self.indices[axis] + 1 == self.extents[axis] as i64
    }

    /// Row-major position of this step in the whole grid.
    pub fn step(&self) -> u64 {
        self.indices.iter().zip(&self.extents).fold(0u64, |acc, (&i, &d)| acc * d as u64 + i as u64)
    }
}
