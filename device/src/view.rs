//! Views over buffers.
//!
//! A [`MemRef`] selects, per buffer axis, either one index (the axis is
//! squeezed out of the visible shape) or a range. Ranges may extend past the
//! buffer on either side: block windows at array edges and padded windows are
//! expressed this way. Out-of-bounds elements read as zero and writes to them
//! are dropped.

use smallvec::SmallVec;
use snafu::ensure;
use tessel_dtype::{DType, Element};

use crate::buffer::Buffer;
use crate::error::{
    DTypeMismatchSnafu, IndexOutOfBoundsSnafu, InvalidViewSnafu, Result, ShapeMismatchSnafu, SizeMismatchSnafu,
    TooManyIndexersSnafu,
};
use crate::memory::MemorySpace;

/// One step of narrowing applied to a visible axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indexer {
    /// Select one element and squeeze the axis.
    Index(i64),
    /// Keep `len` elements starting at `start`.
    Slice { start: i64, len: usize },
    /// Keep the axis unchanged.
    Full,
}

/// Dynamic slice of `len` elements starting at `start`.
pub const fn ds(start: i64, len: usize) -> Indexer {
    Indexer::Slice { start, len }
}

impl From<i64> for Indexer {
    fn from(index: i64) -> Self {
        Self::Index(index)
    }
}

impl From<std::ops::RangeFull> for Indexer {
    fn from(_: std::ops::RangeFull) -> Self {
        Self::Full
    }
}

/// Placement of a view on one buffer axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisView {
    Index(i64),
    Range { start: i64, len: usize },
}

#[derive(Debug, Clone)]
pub struct MemRef {
    buffer: Buffer,
    axes: SmallVec<[AxisView; 4]>,
}

impl MemRef {
    pub fn new(buffer: Buffer) -> Self {
        let axes = buffer.shape().iter().map(|&len| AxisView::Range { start: 0, len }).collect();
        Self { buffer, axes }
    }

    /// View with explicit per-axis placement; placements may leave the buffer bounds.
    pub fn with_axes(buffer: Buffer, axes: &[AxisView]) -> Result<Self> {
        ensure!(
            axes.len() == buffer.shape().len(),
            ShapeMismatchSnafu { expected: buffer.shape().to_vec(), actual: vec![axes.len()] }
        );
        Ok(Self { buffer, axes: SmallVec::from_slice(axes) })
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn axes(&self) -> &[AxisView] {
        &self.axes
    }

    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    pub fn space(&self) -> MemorySpace {
        self.buffer.space()
    }

    pub fn is_live(&self) -> bool {
        self.buffer.is_live()
    }

    /// Visible shape: range lengths in buffer-axis order.
    pub fn shape(&self) -> SmallVec<[usize; 4]> {
        self.axes
            .iter()
            .filter_map(|axis| match axis {
                AxisView::Range { len, .. } => Some(*len),
                AxisView::Index(_) => None,
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype().bytes()
    }

    /// Narrow the view. Indexers apply to visible axes left to right; missing
    /// trailing indexers keep their axes whole.
    pub fn at(&self, indexers: &[Indexer]) -> Result<Self> {
        let rank = self.rank();
        ensure!(indexers.len() <= rank, TooManyIndexersSnafu { count: indexers.len(), rank });

        let mut pending = indexers.iter();
        let mut visible = 0usize;
        let mut axes = SmallVec::with_capacity(self.axes.len());
        for axis in &self.axes {
            let AxisView::Range { start, len } = *axis else {
                axes.push(*axis);
                continue;
            };
            let narrowed = match pending.next().copied().unwrap_or(Indexer::Full) {
                Indexer::Full => *axis,
                Indexer::Index(index) => {
                    ensure!(
                        (0..len as i64).contains(&index),
                        IndexOutOfBoundsSnafu { index: vec![index], shape: self.shape().to_vec() }
                    );
                    AxisView::Index(start + index)
                }
                Indexer::Slice { start: offset, len: count } => {
                    ensure!(
                        offset >= 0 && offset as usize + count <= len,
                        InvalidViewSnafu { axis: visible, start: offset, len: count, extent: len }
                    );
                    AxisView::Range { start: start + offset, len: count }
                }
            };
            axes.push(narrowed);
            visible += 1;
        }
        Ok(Self { buffer: self.buffer.clone(), axes })
    }

    /// Whether the minor-most buffer axis of a multi-axis buffer is squeezed.
    pub fn squeezes_minor(&self) -> bool {
        self.axes.len() >= 2 && matches!(self.axes.last(), Some(AxisView::Index(_)))
    }

    /// Same placement over another buffer of identical shape and dtype.
    pub fn rebind(&self, buffer: Buffer) -> Result<Self> {
        ensure!(
            buffer.shape() == self.buffer.shape(),
            ShapeMismatchSnafu { expected: self.buffer.shape().to_vec(), actual: buffer.shape().to_vec() }
        );
        ensure!(buffer.dtype() == self.dtype(), DTypeMismatchSnafu { expected: self.dtype(), actual: buffer.dtype() });
        Ok(Self { buffer, axes: self.axes.clone() })
    }

    /// Element offsets into the buffer, in visible row-major order; `None` marks
    /// positions outside the buffer.
    fn element_offsets(&self) -> Vec<Option<usize>> {
        let dims = self.buffer.shape();
        let mut strides = vec![1usize; dims.len()];
        for axis in (0..dims.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * dims[axis + 1];
        }

        let mut offsets: Vec<Option<usize>> = vec![Some(0)];
        for ((axis, &dim), &stride) in self.axes.iter().zip(dims).zip(&strides) {
            let place = |base: Option<usize>, coord: i64| {
                base.filter(|_| (0..dim as i64).contains(&coord)).map(|base| base + coord as usize * stride)
            };
            offsets = match *axis {
                AxisView::Index(coord) => offsets.into_iter().map(|base| place(base, coord)).collect(),
                AxisView::Range { start, len } => offsets
                    .into_iter()
                    .flat_map(|base| (0..len as i64).map(move |k| place(base, start + k)))
                    .collect(),
            };
        }
        offsets
    }

    /// Packed little-endian bytes of the visible region.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        self.buffer.ensure_live()?;
        let width = self.dtype().bytes();
        let offsets = self.element_offsets();
        let mut out = vec![0u8; offsets.len() * width];
        let data = self.buffer.raw().read();
        for (slot, offset) in out.chunks_exact_mut(width).zip(offsets) {
            if let Some(offset) = offset {
                slot.copy_from_slice(&data[offset * width..(offset + 1) * width]);
            }
        }
        Ok(out)
    }

    /// Scatter packed bytes into the visible region.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.buffer.ensure_live()?;
        let width = self.dtype().bytes();
        let offsets = self.element_offsets();
        ensure!(
            bytes.len() == offsets.len() * width,
            SizeMismatchSnafu { expected: offsets.len() * width, actual: bytes.len() }
        );
        let mut data = self.buffer.raw().write();
        for (chunk, offset) in bytes.chunks_exact(width).zip(offsets) {
            if let Some(offset) = offset {
                data[offset * width..(offset + 1) * width].copy_from_slice(chunk);
            }
        }
        Ok(())
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        ensure!(T::DTYPE == self.dtype(), DTypeMismatchSnafu { expected: self.dtype(), actual: T::DTYPE });
        Ok(())
    }

    pub fn load<T: Element>(&self) -> Result<Vec<T>> {
        self.check_dtype::<T>()?;
        Ok(self.read_bytes()?.chunks_exact(T::DTYPE.bytes()).map(T::read_le).collect())
    }

    pub fn store<T: Element>(&self, values: &[T]) -> Result<()> {
        self.check_dtype::<T>()?;
        let width = T::DTYPE.bytes();
        let mut bytes = vec![0u8; values.len() * width];
        for (value, chunk) in values.iter().zip(bytes.chunks_exact_mut(width)) {
            value.write_le(chunk);
        }
        self.write_bytes(&bytes)
    }

    fn element(&self, index: &[usize]) -> Result<Self> {
        let shape = self.shape();
        ensure!(
            index.len() == shape.len() && index.iter().zip(&shape).all(|(i, d)| i < d),
            IndexOutOfBoundsSnafu { index: index.iter().map(|&i| i as i64).collect::<Vec<_>>(), shape: shape.to_vec() }
        );
        let indexers: SmallVec<[Indexer; 4]> = index.iter().map(|&i| Indexer::Index(i as i64)).collect();
        self.at(&indexers)
    }

    pub fn get<T: Element>(&self, index: &[usize]) -> Result<T> {
        let values = self.element(index)?.load::<T>()?;
        Ok(values[0])
    }

    pub fn set<T: Element>(&self, index: &[usize], value: T) -> Result<()> {
        self.element(index)?.store(&[value])
    }

    pub fn fill<T: Element>(&self, value: T) -> Result<()> {
        self.store(&vec![value; self.numel()])
    }

    /// Read-modify-write every visible element.
    pub fn update<T: Element>(&self, f: impl FnMut(T) -> T) -> Result<()> {
        let values: Vec<T> = self.load::<T>()?.into_iter().map(f).collect();
        self.store(&values)
    }

    /// Synchronous copy between views of equal shape and dtype.
    pub fn copy_from(&self, src: &MemRef) -> Result<()> {
        ensure!(src.dtype() == self.dtype(), DTypeMismatchSnafu { expected: self.dtype(), actual: src.dtype() });
        ensure!(
            src.shape() == self.shape(),
            ShapeMismatchSnafu { expected: self.shape().to_vec(), actual: src.shape().to_vec() }
        );
        self.write_bytes(&src.read_bytes()?)
    }
}
