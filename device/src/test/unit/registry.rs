use std::sync::Arc;
use std::thread;

use tessel_dtype::DType;

use crate::{
    BufferSlot, DeviceAddress, DeviceConfig, DeviceRegistry, Error, MemorySpace, MeshTopology, SemaphoreKind,
    SemaphoreRef, SemaphoreSlot,
};

fn mesh(devices: usize) -> Arc<DeviceRegistry> {
    let config = DeviceConfig::builder().stall_timeout_ms(5_000).build();
    DeviceRegistry::new(MeshTopology::linear(devices).unwrap(), &config).unwrap()
}

#[test]
fn test_remote_signal_reaches_peer_slot() {
    let registry = mesh(2);
    let slot = SemaphoreSlot::Scoped { unit: 0, seq: 0 };
    let local = registry.device(0).unwrap().semaphore(slot, SemaphoreKind::Regular, &[]).unwrap();

    // The peer has not allocated its semaphore yet; the count must survive.
    registry.signal_remote(&local, 3, &DeviceAddress::Logical(1)).unwrap();
    let peer = registry.device(1).unwrap().semaphore(slot, SemaphoreKind::Regular, &[]).unwrap();
    assert_eq!(peer.read().unwrap(), 3);
    assert_eq!(local.read().unwrap(), 0);
}

#[test]
fn test_remote_signal_requires_slot() {
    let registry = mesh(2);
    let unregistered = SemaphoreRef::new(SemaphoreKind::Regular, &[]);
    let err = registry.signal_remote(&unregistered, 1, &DeviceAddress::Logical(1)).unwrap_err();
    assert!(matches!(err, Error::NotAddressable { .. }));
}

#[test]
fn test_peer_slot_kind_must_match() {
    let registry = mesh(1);
    let device = registry.device(0).unwrap();
    let slot = SemaphoreSlot::Scratch { unit: 0, index: 0 };
    device.semaphore(slot, SemaphoreKind::Dma, &[2]).unwrap();
    assert!(device.semaphore(slot, SemaphoreKind::Regular, &[2]).is_err());
    assert!(device.semaphore(slot, SemaphoreKind::Dma, &[3]).is_err());
}

#[test]
fn test_remote_copy_ring() {
    let registry = mesh(2);
    let outputs: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..2usize)
            .map(|id| {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    let device = registry.device(id).unwrap();
                    let src = device.buffer_from_slice(MemorySpace::Hbm, &[id as i32; 16], &[2, 8]).unwrap();
                    let dst = device.allocate(MemorySpace::Vmem, DType::Int32, &[2, 8]).unwrap();
                    device.register_buffer(BufferSlot::Output(0), &dst);

                    let send = device.semaphore(SemaphoreSlot::Scratch { unit: 0, index: 0 }, SemaphoreKind::Dma, &[]).unwrap();
                    let recv = device.semaphore(SemaphoreSlot::Scratch { unit: 0, index: 1 }, SemaphoreKind::Dma, &[]).unwrap();

                    let peer = DeviceAddress::Logical((id + 1) % 2);
                    let handle = registry.remote_copy(device, &src.view(), &dst.view(), &send, &recv, &peer).unwrap();
                    handle.wait().unwrap();
                    assert_eq!(send.residual() + recv.residual(), 0);
                    dst.to_vec::<i32>().unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(outputs[0], vec![1; 16]);
    assert_eq!(outputs[1], vec![0; 16]);
}

#[test]
fn test_remote_copy_waits_are_single_use() {
    let registry = mesh(1);
    let device = registry.device(0).unwrap();
    let src = device.allocate(MemorySpace::Hbm, DType::Float32, &[4]).unwrap();
    let dst = device.allocate(MemorySpace::Hbm, DType::Float32, &[4]).unwrap();
    device.register_buffer(BufferSlot::Input(0), &dst);
    let send = device.semaphore(SemaphoreSlot::Scoped { unit: 0, seq: 0 }, SemaphoreKind::Dma, &[]).unwrap();
    let recv = device.semaphore(SemaphoreSlot::Scoped { unit: 0, seq: 1 }, SemaphoreKind::Dma, &[]).unwrap();

    let mut handle = registry.remote_copy(device, &src.view(), &dst.view(), &send, &recv, &0usize.into()).unwrap();
    handle.wait_send().unwrap();
    assert!(matches!(handle.wait_send(), Err(Error::AlreadyWaited { side: "send" })));
    handle.wait_recv().unwrap();
    assert!(matches!(handle.wait_recv(), Err(Error::AlreadyWaited { .. })));
}

#[test]
fn test_unregistered_destination_times_out() {
    let config = DeviceConfig::builder().stall_timeout_ms(20).build();
    let registry = DeviceRegistry::new(MeshTopology::linear(2).unwrap(), &config).unwrap();
    let device = registry.device(0).unwrap();
    let src = device.allocate(MemorySpace::Hbm, DType::Float32, &[4]).unwrap();
    let dst = device.allocate(MemorySpace::Hbm, DType::Float32, &[4]).unwrap();
    device.register_buffer(BufferSlot::Output(0), &dst);
    let send = device.semaphore(SemaphoreSlot::Barrier, SemaphoreKind::Dma, &[]).unwrap();

    let err = registry.remote_copy(device, &src.view(), &dst.view(), &send, &send, &1usize.into()).unwrap_err();
    assert!(matches!(err, Error::PeerUnavailable { device: 1, .. }));
}
