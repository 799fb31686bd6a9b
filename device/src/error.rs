use snafu::Snafu;
use tessel_dtype::DType;

use crate::memory::MemorySpace;
use crate::sync::SemaphoreKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Shape of a view does not match the shape it is combined with.
    #[snafu(display("shape mismatch: expected {expected:?}, got {actual:?}"))]
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    #[snafu(display("dtype mismatch: expected {expected}, got {actual}"))]
    DTypeMismatch { expected: DType, actual: DType },

    /// Invalid view parameters on a visible axis.
    #[snafu(display("invalid view on axis {axis}: start {start} + len {len} exceeds extent {extent}"))]
    InvalidView { axis: usize, start: i64, len: usize, extent: usize },

    #[snafu(display("index {index:?} out of bounds for shape {shape:?}"))]
    IndexOutOfBounds { index: Vec<i64>, shape: Vec<usize> },

    #[snafu(display("too many indexers: {count} for a view of rank {rank}"))]
    TooManyIndexers { count: usize, rank: usize },

    /// Squeezing the minor-most axis would collapse two tiled axes onto one.
    #[snafu(display("cannot squeeze the minor axis of a {rank}-d buffer in a DMA endpoint"))]
    SqueezeUnsupported { rank: usize },

    #[snafu(display("cannot signal or wait on a non-scalar semaphore reference of shape {shape:?}"))]
    NonScalarSemaphore { shape: Vec<usize> },

    #[snafu(display("semaphore kind mismatch: expected {expected}, got {actual}"))]
    SemaphoreKindMismatch { expected: SemaphoreKind, actual: SemaphoreKind },

    /// A semaphore was released while its count was non-zero.
    #[snafu(display("{kind} semaphore of shape {shape:?} released with residual count {residual}"))]
    SemaphoreLeak { kind: SemaphoreKind, shape: Vec<usize>, residual: u64 },

    #[snafu(display("{what} used after its scope was released"))]
    UseAfterRelease { what: &'static str },

    #[snafu(display("{space} limit exceeded: requested {requested} bytes with {live} live of {limit}"))]
    MemoryLimitExceeded { space: MemorySpace, requested: usize, live: usize, limit: usize },

    /// Wait exceeded the configured stall timeout.
    #[snafu(display("stalled waiting for {amount} on a {kind} semaphore (count {count}) for {timeout_ms}ms"))]
    Stall { kind: SemaphoreKind, amount: u64, count: u64, timeout_ms: u64 },

    #[snafu(display("DMA transfer failed: {reason}"))]
    DmaFailed { reason: String },

    #[snafu(display("DMA handle already waited on its {side} side"))]
    AlreadyWaited { side: &'static str },

    #[snafu(display("invalid device address {address}: {reason}"))]
    InvalidDevice { address: String, reason: String },

    #[snafu(display("invalid mesh: {reason}"))]
    InvalidMesh { reason: String },

    /// A remote operation needs a slot-registered endpoint.
    #[snafu(display("{what} is not addressable on peer devices"))]
    NotAddressable { what: &'static str },

    #[snafu(display("peer device {device} never registered {slot} within {timeout_ms}ms"))]
    PeerUnavailable { device: usize, slot: String, timeout_ms: u64 },

    #[snafu(display("failed to start DMA workers: {reason}"))]
    WorkerPool { reason: String },
}
