//! Block specifications and their resolution into per-step windows.
//!
//! A block spec describes, for one operand, which window of it a grid step
//! sees. Its index map turns a grid position (and the prefetched scalars) into
//! a block index; the indexing mode decides whether that index counts blocks
//! or elements.
//!
//! # Design
//!
//! - **Blocked**: window start on each axis is `block_index * block_size`.
//! - **Unblocked**: the index map returns element offsets into the operand
//!   padded by `(low, high)` per axis, so the start is `index - low`.
//!
//! A `None` block axis is squeezed: it has extent one and disappears from the
//! shape the body sees. Windows are free to extend past the operand; those
//! elements read as zero, which is the padding value, and writes to them are
//! dropped.

use std::sync::Arc;

use bon::bon;
use smallvec::SmallVec;
use snafu::ensure;
use tessel_device::{AxisView, MemorySpace};
use tessel_dtype::DType;

use crate::error::{BlockRankMismatchSnafu, IndexMapRankSnafu, InvalidBlockSpecSnafu, Result};
use crate::grid::GridPoint;
use crate::prefetch::PrefetchedScalars;

/// Block (or element, when unblocked) index per operand axis.
pub type BlockIndex = SmallVec<[i64; 4]>;

type IndexFn = dyn Fn(&GridPoint, &PrefetchedScalars) -> BlockIndex + Send + Sync;

/// Map from a grid position to a block index.
#[derive(Clone)]
pub struct IndexMap(Arc<IndexFn>);

impl std::fmt::Debug for IndexMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IndexMap(..)")
    }
}

impl IndexMap {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&GridPoint, &PrefetchedScalars) -> BlockIndex + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Always the first block.
    pub fn zeros(rank: usize) -> Self {
        Self::new(move |_, _| SmallVec::from_elem(0, rank))
    }

    /// Block index equal to the grid position.
    pub fn grid() -> Self {
        Self::new(|point, _| SmallVec::from_slice(point.indices()))
    }

    pub fn eval(&self, point: &GridPoint, scalars: &PrefetchedScalars) -> BlockIndex {
        (self.0)(point, scalars)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IndexingMode {
    #[default]
    Blocked,
    /// Element offsets into the operand padded by `(low, high)` per axis.
    Unblocked { padding: Option<SmallVec<[(usize, usize); 4]>> },
}

impl IndexingMode {
    pub fn unblocked() -> Self {
        Self::Unblocked { padding: None }
    }

    pub fn padded(padding: &[(usize, usize)]) -> Self {
        Self::Unblocked { padding: Some(SmallVec::from_slice(padding)) }
    }

    pub fn has_padding(&self) -> bool {
        matches!(self, Self::Unblocked { padding: Some(padding) } if padding.iter().any(|&(lo, hi)| lo + hi > 0))
    }
}

/// How an operand is presented to each grid step.
#[derive(Debug, Clone, Default)]
pub struct BlockSpec {
    pub index_map: Option<IndexMap>,
    /// Block extent per axis; `None` squeezes the axis. Whole operand when absent.
    pub block_shape: Option<SmallVec<[Option<usize>; 4]>>,
    /// Tier the window is placed in; VMEM when absent.
    pub memory_space: Option<MemorySpace>,
    pub indexing_mode: IndexingMode,
}

#[bon]
impl BlockSpec {
    /// Create a block spec with builder pattern.
    #[builder(finish_fn = build)]
    pub fn builder(
        index_map: Option<IndexMap>,
        block_shape: Option<Vec<Option<usize>>>,
        memory_space: Option<MemorySpace>,
        #[builder(default)] indexing_mode: IndexingMode,
    ) -> Self {
        Self { index_map, block_shape: block_shape.map(SmallVec::from_vec), memory_space, indexing_mode }
    }
}

impl BlockSpec {
    pub fn new(block_shape: &[Option<usize>], index_map: IndexMap) -> Self {
        Self { index_map: Some(index_map), block_shape: Some(SmallVec::from_slice(block_shape)), ..Self::default() }
    }

    /// Block spec without squeezed axes.
    pub fn tiled(block_shape: &[usize], index_map: IndexMap) -> Self {
        let shape: SmallVec<[Option<usize>; 4]> = block_shape.iter().map(|&d| Some(d)).collect();
        Self::new(&shape, index_map)
    }

    /// Whole operand in `space`; `Unassigned` leaves it un-windowed in bulk memory.
    pub fn memory(space: MemorySpace) -> Self {
        Self { memory_space: Some(space), ..Self::default() }
    }

    pub fn in_space(mut self, space: MemorySpace) -> Self {
        self.memory_space = Some(space);
        self
    }

    pub fn with_indexing_mode(mut self, mode: IndexingMode) -> Self {
        self.indexing_mode = mode;
        self
    }
}

/// How a resolved operand reaches the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// The whole operand, untouched.
    Whole,
    /// A view straight into the operand.
    Direct,
    /// A step-owned copy in VMEM or SMEM.
    Staged,
}

/// Block spec checked against a concrete operand.
#[derive(Debug, Clone)]
pub(crate) struct BlockMapping {
    operand: String,
    index_map: IndexMap,
    block: SmallVec<[usize; 4]>,
    squeezed: SmallVec<[bool; 4]>,
    pad_low: SmallVec<[usize; 4]>,
    blocked: bool,
    space: MemorySpace,
    dtype: DType,
}

impl BlockMapping {
    pub fn resolve(spec: &BlockSpec, operand: String, shape: &[usize], dtype: DType) -> Result<Self> {
        let rank = shape.len();
        let space = spec.memory_space.unwrap_or(MemorySpace::Vmem);
        ensure!(
            space != MemorySpace::Unassigned || (spec.block_shape.is_none() && spec.index_map.is_none()),
            InvalidBlockSpecSnafu { operand: operand.clone(), reason: "unassigned operands are not windowed" }
        );

        let block_shape: SmallVec<[Option<usize>; 4]> = match &spec.block_shape {
            Some(block_shape) => block_shape.clone(),
            None => shape.iter().map(|&d| Some(d)).collect(),
        };
        ensure!(
            block_shape.len() == rank,
            BlockRankMismatchSnafu { operand: operand.clone(), expected: rank, actual: block_shape.len() }
        );

        let pad_low = match &spec.indexing_mode {
            IndexingMode::Unblocked { padding: Some(padding) } => {
                ensure!(
                    padding.len() == rank,
                    InvalidBlockSpecSnafu {
                        operand: operand.clone(),
                        reason: format!("padding has rank {}, operand has rank {rank}", padding.len()),
                    }
                );
                padding.iter().map(|&(lo, _)| lo).collect()
            }
            _ => SmallVec::from_elem(0, rank),
        };

        Ok(Self {
            index_map: spec.index_map.clone().unwrap_or_else(|| IndexMap::zeros(rank)),
            block: block_shape.iter().map(|d| d.unwrap_or(1)).collect(),
            squeezed: block_shape.iter().map(Option::is_none).collect(),
            pad_low,
            blocked: matches!(spec.indexing_mode, IndexingMode::Blocked),
            space,
            dtype,
            operand,
        })
    }

    pub fn placement(&self) -> Placement {
        match self.space {
            MemorySpace::Unassigned => Placement::Whole,
            MemorySpace::Hbm => Placement::Direct,
            MemorySpace::Vmem | MemorySpace::Smem => Placement::Staged,
        }
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Shape the body sees: block extents of non-squeezed axes.
    pub fn window_shape(&self) -> SmallVec<[usize; 4]> {
        self.block.iter().zip(&self.squeezed).filter(|(_, squeezed)| !**squeezed).map(|(d, _)| *d).collect()
    }

    pub fn window_bytes(&self) -> usize {
        self.window_shape().iter().product::<usize>() * self.dtype.bytes()
    }

    /// Placement of the step's window on each operand axis.
    pub fn window(&self, point: &GridPoint, scalars: &PrefetchedScalars) -> Result<SmallVec<[AxisView; 4]>> {
        let index = self.index_map.eval(point, scalars);
        ensure!(
            index.len() == self.block.len(),
            IndexMapRankSnafu { operand: self.operand.clone(), expected: self.block.len(), actual: index.len() }
        );

        let axes = index
            .iter()
            .zip(&self.block)
            .zip(&self.squeezed)
            .zip(&self.pad_low)
            .map(|(((&index, &block), &squeezed), &pad_low)| {
                let start = if self.blocked { index * block as i64 } else { index - pad_low as i64 };
                if squeezed { AxisView::Index(start) } else { AxisView::Range { start, len: block } }
            })
            .collect();
        Ok(axes)
    }
}
