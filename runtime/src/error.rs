//! Error types for kernel launches.

use snafu::Snafu;
use tessel_dtype::DType;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while configuring or executing a launch.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Memory, semaphore or DMA failure reported by the device.
    #[snafu(display("Device error: {source}"))]
    Device { source: tessel_device::Error },

    #[snafu(display("{operand}: block shape has rank {actual}, operand has rank {expected}"))]
    BlockRankMismatch { operand: String, expected: usize, actual: usize },

    #[snafu(display("{operand}: index map returned {actual} block indices, expected {expected}"))]
    IndexMapRank { operand: String, expected: usize, actual: usize },

    #[snafu(display("{operand}: {reason}"))]
    InvalidBlockSpec { operand: String, reason: String },

    #[snafu(display("grid axis {axis} resolved to negative bound {value}"))]
    NegativeGridBound { axis: usize, value: i64 },

    #[snafu(display("grid of {steps} steps exceeds the step counter"))]
    GridTooLarge { steps: u128 },

    #[snafu(display("grid bound argument {index} missing: {available} provided"))]
    MissingBoundArgument { index: usize, available: usize },

    #[snafu(display("invalid grid bound source {source_desc}: {reason}"))]
    InvalidBoundArgument { source_desc: String, reason: String },

    #[snafu(display("core-parallel split over axis {dim} into {cores} units is invalid for a rank-{rank} grid"))]
    InvalidCoreSplit { dim: usize, cores: usize, rank: usize },

    #[snafu(display("expected {expected} {what}, got {actual}"))]
    OperandCount { what: &'static str, expected: usize, actual: usize },

    #[snafu(display("{what} {index} out of range: {count} available"))]
    OperandIndex { what: &'static str, index: usize, count: usize },

    #[snafu(display("invalid alias of input {input} to output {output}: {reason}"))]
    InvalidAlias { input: usize, output: usize, reason: String },

    #[snafu(display("Padding with aliasing not supported (input {input})"))]
    PaddingWithAliasing { input: usize },

    #[snafu(display("scalar prefetch operand {operand} has non-integer dtype {dtype}"))]
    PrefetchNotInteger { operand: usize, dtype: DType },

    #[snafu(display("allow_input_fusion has {actual} entries for {expected} inputs"))]
    FusionHintLength { expected: usize, actual: usize },

    #[snafu(display("scratch {index} is not a {expected}"))]
    ScratchKind { index: usize, expected: &'static str },

    #[snafu(display("launch reserved no barrier semaphore; set collective_id"))]
    MissingBarrier,

    #[snafu(display("{what} requires a launch over a device mesh"))]
    NoMesh { what: &'static str },

    #[snafu(display("invalid batching: {reason}"))]
    InvalidBatch { reason: String },

    #[snafu(display("failed to start device threads: {reason}"))]
    ThreadPool { reason: String },

    /// Failure raised by a kernel body.
    #[snafu(display("kernel '{kernel}' failed: {message}"))]
    Kernel { kernel: String, message: String },
}

impl From<tessel_device::Error> for Error {
    fn from(source: tessel_device::Error) -> Self {
        Self::Device { source }
    }
}
