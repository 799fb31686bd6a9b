//! Device mesh registry.
//!
//! Owns every device of a mesh and routes remote semaphore signals and remote
//! copies to the addressed peer.

use std::sync::Arc;

use snafu::OptionExt;

use crate::config::DeviceConfig;
use crate::device::Device;
use crate::dma::{RemoteDmaHandle, validate_dma_semaphore, validate_transfer};
use crate::error::{InvalidDeviceSnafu, NotAddressableSnafu, Result};
use crate::mesh::{DeviceAddress, MeshTopology};
use crate::queue::Completion;
use crate::sync::SemaphoreRef;
use crate::view::MemRef;

#[derive(Debug)]
pub struct DeviceRegistry {
    topology: MeshTopology,
    devices: Vec<Arc<Device>>,
}

impl DeviceRegistry {
    /// Create one device per mesh position, all sharing `config`.
    pub fn new(topology: MeshTopology, config: &DeviceConfig) -> Result<Arc<Self>> {
        let devices = (0..topology.num_devices()).map(|id| Device::new(id, config.clone())).collect::<Result<_>>()?;
        Ok(Arc::new(Self { topology, devices }))
    }

    pub fn topology(&self) -> &MeshTopology {
        &self.topology
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn device(&self, id: usize) -> Result<&Arc<Device>> {
        self.devices.get(id).context(InvalidDeviceSnafu {
            address: DeviceAddress::Logical(id).to_string(),
            reason: format!("mesh has {} devices", self.devices.len()),
        })
    }

    pub fn resolve(&self, address: &DeviceAddress) -> Result<&Arc<Device>> {
        self.device(self.topology.resolve(address)?)
    }

    /// Counterpart of a local semaphore on the addressed peer.
    fn peer_semaphore(&self, sem: &SemaphoreRef, target: &DeviceAddress) -> Result<SemaphoreRef> {
        let slot = sem.slot().context(NotAddressableSnafu { what: "semaphore" })?;
        let peer = self.resolve(target)?;
        sem.rebind(&peer.semaphore(slot, sem.kind(), sem.array_shape())?)
    }

    /// Signal the semaphore occupying `sem`'s slot on the addressed peer.
    pub fn signal_remote(&self, sem: &SemaphoreRef, amount: u64, target: &DeviceAddress) -> Result<()> {
        tracing::trace!(%target, amount, "remote signal");
        self.peer_semaphore(sem, target)?.signal(amount)
    }

    /// Copy `src` on `from` into the peer buffer occupying `dst`'s slot.
    ///
    /// `send_sem` (local) is signaled once the source is read; the peer's
    /// counterpart of `recv_sem` once the bytes land there.
    pub fn remote_copy(
        &self,
        from: &Device,
        src: &MemRef,
        dst: &MemRef,
        send_sem: &SemaphoreRef,
        recv_sem: &SemaphoreRef,
        target: &DeviceAddress,
    ) -> Result<RemoteDmaHandle> {
        let bytes = validate_transfer(src, dst)?;
        validate_dma_semaphore(send_sem)?;
        validate_dma_semaphore(recv_sem)?;

        let slot = from.slot_of(dst.buffer()).context(NotAddressableSnafu { what: "destination buffer" })?;
        let peer = self.resolve(target)?;
        let peer_dst = dst.rebind(peer.resolve_buffer(slot, from.stall_timeout())?)?;
        let peer_recv = self.peer_semaphore(recv_sem, target)?;
        tracing::trace!(from = from.id(), to = peer.id(), bytes, "remote dma start");

        let status = from.dma().enqueue(
            src.clone(),
            peer_dst,
            Some(Completion { sem: send_sem.clone(), amount: bytes }),
            Completion { sem: peer_recv, amount: bytes },
        );
        Ok(RemoteDmaHandle::new(send_sem.clone(), recv_sem.clone(), bytes, status, from.stall_timeout()))
    }
}
