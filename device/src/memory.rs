//! Memory tiers of a device.

/// Memory tier a buffer or block window lives in.
///
/// `Unassigned` keeps an operand in bulk memory without windowing; the kernel
/// body sees the whole buffer and moves data itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumIter, strum::EnumCount)]
pub enum MemorySpace {
    /// Bulk device memory, high capacity.
    #[strum(to_string = "HBM")]
    Hbm,
    /// Fast vector scratchpad, limited capacity.
    #[default]
    #[strum(to_string = "VMEM")]
    Vmem,
    /// Scalar scratchpad.
    #[strum(to_string = "SMEM")]
    Smem,
    /// Unassigned; resolved to bulk memory.
    #[strum(to_string = "ANY")]
    Unassigned,
}

impl MemorySpace {
    /// The tier storage is physically drawn from.
    pub const fn backing(&self) -> Self {
        match self {
            Self::Unassigned => Self::Hbm,
            other => *other,
        }
    }

    /// Whether block windows in this tier are staged into a step-owned buffer.
    pub const fn is_staged(&self) -> bool {
        matches!(self, Self::Vmem | Self::Smem)
    }

    pub(crate) const fn pool_index(&self) -> usize {
        match self.backing() {
            Self::Hbm | Self::Unassigned => 0,
            Self::Vmem => 1,
            Self::Smem => 2,
        }
    }
}
