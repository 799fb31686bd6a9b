use std::sync::Arc;

use tessel_device::{Device, DeviceConfig};

pub mod collective;
pub mod grid;

/// Device whose waits fail instead of hanging a broken test.
pub(crate) fn device() -> Arc<Device> {
    Device::new(0, DeviceConfig::builder().stall_timeout_ms(5_000).build()).unwrap()
}
