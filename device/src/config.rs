//! Device configuration.
//!
//! Provides typed configuration with bon builders and environment variable
//! fallbacks.

use std::time::Duration;

use bon::bon;

/// Default VMEM capacity of an emulated device.
pub const DEFAULT_VMEM_LIMIT: usize = 32 << 20;

/// Default SMEM capacity of an emulated device.
pub const DEFAULT_SMEM_LIMIT: usize = 1 << 20;

pub const DEFAULT_DMA_WORKERS: usize = 2;

/// Capacities and instrumentation of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// HBM capacity; unbounded when `None`.
    pub hbm_limit_bytes: Option<usize>,
    pub vmem_limit_bytes: usize,
    pub smem_limit_bytes: usize,
    /// Threads executing DMA transfers.
    pub dma_workers: usize,
    /// Turn waits that never complete into `Stall` errors after this long.
    pub stall_timeout: Option<Duration>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            hbm_limit_bytes: None,
            vmem_limit_bytes: DEFAULT_VMEM_LIMIT,
            smem_limit_bytes: DEFAULT_SMEM_LIMIT,
            dma_workers: DEFAULT_DMA_WORKERS,
            stall_timeout: None,
        }
    }
}

#[bon]
impl DeviceConfig {
    /// Create a device configuration with builder pattern.
    #[builder(finish_fn = build)]
    pub fn builder(
        hbm_limit_bytes: Option<usize>,
        #[builder(default = DEFAULT_VMEM_LIMIT)] vmem_limit_bytes: usize,
        #[builder(default = DEFAULT_SMEM_LIMIT)] smem_limit_bytes: usize,
        #[builder(default = DEFAULT_DMA_WORKERS)] dma_workers: usize,
        stall_timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            hbm_limit_bytes,
            vmem_limit_bytes,
            smem_limit_bytes,
            dma_workers,
            stall_timeout: stall_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `TESSEL_HBM_LIMIT` - HBM capacity in bytes (default: unbounded)
    /// * `TESSEL_VMEM_LIMIT` - VMEM capacity in bytes (default: 32 MiB)
    /// * `TESSEL_SMEM_LIMIT` - SMEM capacity in bytes (default: 1 MiB)
    /// * `TESSEL_DMA_WORKERS` - DMA worker threads (default: 2)
    /// * `TESSEL_STALL_TIMEOUT_MS` - Report stalled waits after this many milliseconds
    pub fn from_env() -> Self {
        let hbm_limit_bytes = std::env::var("TESSEL_HBM_LIMIT").ok().and_then(|s| s.parse().ok());
        let vmem_limit_bytes =
            std::env::var("TESSEL_VMEM_LIMIT").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_VMEM_LIMIT);
        let smem_limit_bytes =
            std::env::var("TESSEL_SMEM_LIMIT").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_SMEM_LIMIT);
        let dma_workers =
            std::env::var("TESSEL_DMA_WORKERS").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_DMA_WORKERS);
        let stall_timeout =
            std::env::var("TESSEL_STALL_TIMEOUT_MS").ok().and_then(|s| s.parse().ok()).map(Duration::from_millis);

        Self { hbm_limit_bytes, vmem_limit_bytes, smem_limit_bytes, dma_workers, stall_timeout }
    }
}
