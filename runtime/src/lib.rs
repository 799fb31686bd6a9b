//! Grid execution for tessel kernels.
//!
//! A [`TileCall`] pairs a kernel body with an iteration grid, a block spec per
//! operand and a list of scratch requests. Launching it walks the grid, hands
//! each step the windows its index maps select, and lets the body move data
//! between memory tiers with DMAs synchronized by semaphores.
//!
//! # Batching and meshes
//!
//! [`Vmap`] re-launches a call once per batch element and stacks the results.
//! [`launch_spmd`] runs one program per device of a mesh; programs exchange
//! data with remote copies and coordinate through the barrier semaphore.

pub mod batching;
pub mod block_spec;
pub mod collective;
pub mod config;
pub mod cost;
pub mod error;
pub mod grid;
pub mod kernel;
pub mod launch;
pub mod prefetch;
pub mod scope;


pub use batching::{BatchAxis, Vmap};
pub use block_spec::{BlockIndex, BlockSpec, IndexMap, IndexingMode};
pub use collective::launch_spmd;
pub use config::CompilerParams;
pub use cost::{CostEstimate, LaunchStats};
pub use error::*;
pub use grid::{
    BoundSource, CoreParallel, DYNAMIC_DIM_PLACEHOLDER, DynamicBound, GridDim, GridPartition, GridPoint, GridSpec,
    MAX_GRID_STEPS, ResolvedGrid,
};
pub use kernel::{Kernel, KernelContext, kernel_fn};
pub use launch::{Launch, LaunchArgs, LaunchReport, OutputShape, Target, TileCall};
pub use prefetch::PrefetchedScalars;
pub use scope::{Allocation, Allocations, ScratchShape};
