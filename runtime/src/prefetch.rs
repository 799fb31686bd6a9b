//! Scalar prefetch.
//!
//! The leading operands of a launch can be designated scalar-prefetch
//! operands: they are copied into SMEM once, before the first step, and their
//! values are handed to every index map and dynamic grid bound. Kernel bodies
//! see them read-only.

use snafu::{ResultExt, ensure};
use tessel_device::{Buffer, Device, MemRef, MemorySpace};

use crate::error::{DeviceSnafu, PrefetchNotIntegerSnafu, Result};

#[derive(Debug, Clone, Default)]
pub struct PrefetchedScalars {
    refs: Vec<MemRef>,
    values: Vec<Vec<i64>>,
}

impl PrefetchedScalars {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Copy `operands` into SMEM on `device` and decode their values.
    pub fn prefetch(device: &Device, operands: &[Buffer]) -> Result<Self> {
        let mut scalars = Self::default();
        for (operand, buffer) in operands.iter().enumerate() {
            if let Err(err) = scalars.push(device, operand, buffer) {
                scalars.release();
                return Err(err);
            }
        }
        tracing::trace!(operands = scalars.len(), "scalars prefetched");
        Ok(scalars)
    }

    fn push(&mut self, device: &Device, operand: usize, buffer: &Buffer) -> Result<()> {
        let dtype = buffer.dtype();
        ensure!(dtype.is_index_like(), PrefetchNotIntegerSnafu { operand, dtype });

        let smem = device.allocate(MemorySpace::Smem, dtype, buffer.shape()).context(DeviceSnafu)?;
        self.refs.push(smem.view());
        smem.view().copy_from(&buffer.view()).context(DeviceSnafu)?;
        let bytes = smem.view().read_bytes().context(DeviceSnafu)?;
        self.values.push(bytes.chunks_exact(dtype.bytes()).filter_map(|chunk| dtype.read_index(chunk)).collect());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Element `index` (row-major) of prefetched operand `operand`.
    pub fn get(&self, operand: usize, index: usize) -> Option<i64> {
        self.values.get(operand)?.get(index).copied()
    }

    /// Flattened values of one operand.
    pub fn values(&self, operand: usize) -> Option<&[i64]> {
        self.values.get(operand).map(Vec::as_slice)
    }

    /// SMEM views of the prefetched operands.
    pub fn refs(&self) -> &[MemRef] {
        &self.refs
    }

    pub(crate) fn release(&self) {
        for view in &self.refs {
            view.buffer().release();
        }
    }
}

impl std::ops::Index<(usize, usize)> for PrefetchedScalars {
    type Output = i64;

    /// Panics when the operand or element does not exist, like slice indexing.
    fn index(&self, (operand, index): (usize, usize)) -> &i64 {
        &self.values[operand][index]
    }
}
