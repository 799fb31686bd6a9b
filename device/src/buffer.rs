use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use smallvec::SmallVec;
use snafu::ensure;
use tessel_dtype::{DType, Element};

use crate::allocator::{Allocator, RawBuffer};
use crate::error::{DTypeMismatchSnafu, Result, SizeMismatchSnafu, UseAfterReleaseSnafu};
use crate::memory::MemorySpace;
use crate::view::MemRef;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a storage allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

/// Shared storage referenced by every clone and reshape of a buffer.
#[derive(Debug)]
struct BufferData {
    id: BufferId,
    raw: RawBuffer,
    allocator: Arc<dyn Allocator>,
    /// Total size of the allocation in bytes.
    size: usize,
    released: AtomicBool,
}

impl BufferData {
    fn release(&self) -> bool {
        let first = !self.released.swap(true, Ordering::AcqRel);
        if first {
            self.allocator.free(self.size);
        }
        first
    }
}

impl Drop for BufferData {
    fn drop(&mut self) {
        self.release();
    }
}

/// A typed, shaped region of one memory tier.
///
/// Clones share storage. Releasing a buffer (scope exit) returns its bytes to
/// the pool immediately; every later access through any clone or view fails
/// with `UseAfterRelease`.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Arc<BufferData>,
    dtype: DType,
    shape: SmallVec<[usize; 4]>,
    space: MemorySpace,
}

impl Buffer {
    /// Allocate zero-filled storage from `allocator`.
    pub fn allocate(allocator: &Arc<dyn Allocator>, dtype: DType, shape: &[usize]) -> Result<Self> {
        let size = dtype.bytes() * shape.iter().product::<usize>();
        let raw = allocator.alloc(size)?;
        let id = BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed));
        Ok(Self {
            data: Arc::new(BufferData {
                id,
                raw,
                allocator: Arc::clone(allocator),
                size,
                released: AtomicBool::new(false),
            }),
            dtype,
            shape: SmallVec::from_slice(shape),
            space: allocator.space(),
        })
    }

    pub fn from_slice<T: Element>(allocator: &Arc<dyn Allocator>, values: &[T], shape: &[usize]) -> Result<Self> {
        let expected = shape.iter().product::<usize>();
        ensure!(values.len() == expected, SizeMismatchSnafu { expected, actual: values.len() });

        let buffer = Self::allocate(allocator, T::DTYPE, shape)?;
        buffer.write_slice(values)?;
        Ok(buffer)
    }

    pub fn id(&self) -> BufferId {
        self.data.id
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the visible shape in bytes.
    pub fn size(&self) -> usize {
        self.numel() * self.dtype.bytes()
    }

    pub fn is_live(&self) -> bool {
        !self.data.released.load(Ordering::Acquire)
    }

    /// Return the storage to its pool. Returns `false` if already released.
    pub fn release(&self) -> bool {
        self.data.release()
    }

    pub fn shares_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Same storage under a new shape with the same element count.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        let expected = self.numel();
        let actual = shape.iter().product::<usize>();
        ensure!(expected == actual, SizeMismatchSnafu { expected, actual });
        Ok(Self { shape: SmallVec::from_slice(shape), ..self.clone() })
    }

    /// Full view of the buffer.
    pub fn view(&self) -> MemRef {
        MemRef::new(self.clone())
    }

    /// Copy data from host memory into this buffer.
    pub fn copyin(&self, src: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let expected = self.size();
        ensure!(expected == src.len(), SizeMismatchSnafu { expected, actual: src.len() });
        self.data.raw.write()[..expected].copy_from_slice(src);
        Ok(())
    }

    /// Copy data from this buffer to host memory.
    pub fn copyout(&self, dst: &mut [u8]) -> Result<()> {
        self.ensure_live()?;
        let expected = self.size();
        ensure!(expected == dst.len(), SizeMismatchSnafu { expected, actual: dst.len() });
        dst.copy_from_slice(&self.data.raw.read()[..expected]);
        Ok(())
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        ensure!(T::DTYPE == self.dtype, DTypeMismatchSnafu { expected: self.dtype, actual: T::DTYPE });
        let mut bytes = vec![0u8; self.size()];
        self.copyout(&mut bytes)?;
        Ok(bytes.chunks_exact(self.dtype.bytes()).map(T::read_le).collect())
    }

    pub fn write_slice<T: Element>(&self, values: &[T]) -> Result<()> {
        ensure!(T::DTYPE == self.dtype, DTypeMismatchSnafu { expected: self.dtype, actual: T::DTYPE });
        let width = self.dtype.bytes();
        let mut bytes = vec![0u8; values.len() * width];
        for (value, chunk) in values.iter().zip(bytes.chunks_exact_mut(width)) {
            value.write_le(chunk);
        }
        self.copyin(&bytes)
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        ensure!(self.is_live(), UseAfterReleaseSnafu { what: "buffer" });
        Ok(())
    }

    pub(crate) fn raw(&self) -> &RawBuffer {
        &self.data.raw
    }
}
