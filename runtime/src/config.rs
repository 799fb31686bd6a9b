//! Per-launch compiler parameters.

use bon::bon;

use crate::cost::CostEstimate;

/// Tuning knobs attached to a launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilerParams {
    /// Caller-provided cost; derived from operand sizes when absent.
    pub cost_estimate: Option<CostEstimate>,
    /// VMEM budget for this launch's windows and scratch, on top of the device limit.
    pub vmem_limit_bytes: Option<usize>,
    /// Per-input hint that the producer of the input may be fused into the launch.
    pub allow_input_fusion: Option<Vec<bool>>,
    /// Reserve a barrier semaphore shared by every device of a collective launch.
    pub collective_id: Option<u32>,
}

#[bon]
impl CompilerParams {
    /// Create compiler parameters with builder pattern.
    #[builder(finish_fn = build)]
    pub fn builder(
        cost_estimate: Option<CostEstimate>,
        vmem_limit_bytes: Option<usize>,
        allow_input_fusion: Option<Vec<bool>>,
        collective_id: Option<u32>,
    ) -> Self {
        Self { cost_estimate, vmem_limit_bytes, allow_input_fusion, collective_id }
    }
}
