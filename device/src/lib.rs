//! Emulated tile accelerator: memory tiers, buffers and views, counting
//! semaphores, the DMA engine and device meshes.

pub mod allocator;
pub mod buffer;
pub mod config;
pub mod device;
pub mod dma;
pub mod error;
pub mod memory;
pub mod mesh;
pub mod queue;
pub mod registry;
pub mod slot;
pub mod sync;
pub mod view;


pub use allocator::{AllocationStats, Allocator, BudgetedAllocator, HostAllocator, RawBuffer};
pub use buffer::{Buffer, BufferId};
pub use config::DeviceConfig;
pub use device::Device;
pub use dma::{DmaEngine, DmaHandle, DmaStats, RemoteDmaHandle};
pub use error::{Error, Result};
pub use memory::MemorySpace;
pub use mesh::{DeviceAddress, MeshTopology};
pub use registry::DeviceRegistry;
pub use slot::{BufferSlot, SemaphoreSlot};
pub use sync::{CountingSemaphore, SemaphoreKind, SemaphoreRef};
pub use view::{AxisView, Indexer, MemRef, ds};
