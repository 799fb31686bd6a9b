use std::sync::Arc;

use tessel_dtype::DType;
use test_case::test_case;

use crate::{Device, DeviceConfig, Error, Indexer, MemorySpace, SemaphoreKind, SemaphoreRef, ds};

fn device() -> Arc<Device> {
    Device::new(0, DeviceConfig::default()).unwrap()
}

#[test_case(MemorySpace::Hbm, MemorySpace::Vmem)]
#[test_case(MemorySpace::Vmem, MemorySpace::Hbm)]
#[test_case(MemorySpace::Hbm, MemorySpace::Hbm)]
#[test_case(MemorySpace::Vmem, MemorySpace::Vmem)]
#[test_case(MemorySpace::Hbm, MemorySpace::Smem)]
#[test_case(MemorySpace::Smem, MemorySpace::Vmem)]
fn test_copy_reproduces_source(from: MemorySpace, to: MemorySpace) {
    let device = device();
    let values: Vec<f32> = (0..8 * 128).map(|i| i as f32 * 0.5).collect();
    let src = device.buffer_from_slice(from, &values, &[8, 128]).unwrap();
    let dst = device.allocate(to, DType::Float32, &[8, 128]).unwrap();
    let sem = SemaphoreRef::new(SemaphoreKind::Dma, &[]);

    let handle = device.async_copy(&src.view(), &dst.view(), &sem).unwrap();
    assert_eq!(handle.bytes(), 8 * 128 * 4);
    handle.wait().unwrap();

    assert_eq!(dst.to_vec::<f32>().unwrap(), values);
    assert_eq!(sem.read().unwrap(), 0);
    assert_eq!(device.dma().stats().transfers, 1);
}

#[test]
fn test_shared_semaphore_counts_transfers() {
    let device = device();
    let src = device.buffer_from_slice(MemorySpace::Hbm, &[1i32, 2, 3, 4, 5, 6, 7, 8], &[2, 4]).unwrap();
    let dst = device.allocate(MemorySpace::Vmem, DType::Int32, &[2, 4]).unwrap();
    let sem = SemaphoreRef::new(SemaphoreKind::Dma, &[]);

    let rows: Vec<_> = (0..2)
        .map(|row| {
            let src = src.view().at(&[ds(row, 1)]).unwrap();
            let dst = dst.view().at(&[ds(row, 1)]).unwrap();
            device.async_copy(&src, &dst, &sem).unwrap()
        })
        .collect();
    for handle in rows {
        handle.wait().unwrap();
    }

    assert_eq!(dst.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(sem.residual(), 0);
}

#[test]
fn test_wait_covers_own_transfer_on_shared_semaphore() {
    // One worker keeps the transfers in issue order, so the small copy lands last.
    let device = Device::new(0, DeviceConfig::builder().dma_workers(1).stall_timeout_ms(5_000).build()).unwrap();
    let shared = SemaphoreRef::new(SemaphoreKind::Dma, &[]);
    let other = SemaphoreRef::new(SemaphoreKind::Dma, &[]);

    let large_src = device.buffer_from_slice(MemorySpace::Hbm, &vec![1.0f32; 1 << 18], &[1 << 18]).unwrap();
    let large_dst = device.allocate(MemorySpace::Hbm, DType::Float32, &[1 << 18]).unwrap();
    let slow_src = device.buffer_from_slice(MemorySpace::Hbm, &vec![2.0f32; 1 << 20], &[1 << 20]).unwrap();
    let slow_dst = device.allocate(MemorySpace::Hbm, DType::Float32, &[1 << 20]).unwrap();
    let small_src = device.buffer_from_slice(MemorySpace::Hbm, &[7i32, 7], &[2]).unwrap();
    let small_dst = device.allocate(MemorySpace::Hbm, DType::Int32, &[2]).unwrap();

    let large = device.async_copy(&large_src.view(), &large_dst.view(), &shared).unwrap();
    let slow = device.async_copy(&slow_src.view(), &slow_dst.view(), &other).unwrap();
    let small = device.async_copy(&small_src.view(), &small_dst.view(), &shared).unwrap();

    // The large copy's bytes can satisfy the count; the small copy may still be queued.
    small.wait().unwrap();
    assert_eq!(small_dst.to_vec::<i32>().unwrap(), vec![7, 7]);

    large.wait().unwrap();
    slow.wait().unwrap();
    assert_eq!(shared.residual(), 0);
    assert_eq!(other.residual(), 0);
    assert!(large_dst.to_vec::<f32>().unwrap().iter().all(|&v| v == 1.0));
}

#[test]
fn test_non_scalar_semaphore_cannot_signal() {
    let device = device();
    let src = device.allocate(MemorySpace::Hbm, DType::Float32, &[8, 128]).unwrap();
    let dst = device.allocate(MemorySpace::Vmem, DType::Float32, &[8, 128]).unwrap();
    let sems = SemaphoreRef::new(SemaphoreKind::Dma, &[1]);

    let err = device.async_copy(&src.view(), &dst.view(), &sems).unwrap_err();
    assert!(err.to_string().contains("cannot signal"), "{err}");

    let handle = device.async_copy(&src.view(), &dst.view(), &sems.at(&[0]).unwrap()).unwrap();
    handle.wait().unwrap();
}

#[test]
fn test_regular_semaphore_is_not_a_dma_target() {
    let device = device();
    let src = device.allocate(MemorySpace::Hbm, DType::Float32, &[8]).unwrap();
    let dst = device.allocate(MemorySpace::Vmem, DType::Float32, &[8]).unwrap();
    let sem = SemaphoreRef::new(SemaphoreKind::Regular, &[]);

    let err = device.async_copy(&src.view(), &dst.view(), &sem).unwrap_err();
    assert!(matches!(err, Error::SemaphoreKindMismatch { expected: SemaphoreKind::Dma, .. }));
}

#[test]
fn test_lane_squeeze_rejected_leading_index_allowed() {
    let device = device();
    let values: Vec<f32> = (0..2 * 8 * 128).map(|i| i as f32).collect();
    let src = device.buffer_from_slice(MemorySpace::Hbm, &values, &[2, 8, 128]).unwrap();
    let sem = SemaphoreRef::new(SemaphoreKind::Dma, &[]);

    let squeezed = device.allocate(MemorySpace::Vmem, DType::Float32, &[2, 8]).unwrap();
    let lane = src.view().at(&[Indexer::Full, Indexer::Full, Indexer::Index(0)]).unwrap();
    let err = device.async_copy(&lane, &squeezed.view(), &sem).unwrap_err();
    assert!(matches!(err, Error::SqueezeUnsupported { rank: 3 }));

    let tile = device.allocate(MemorySpace::Vmem, DType::Float32, &[128]).unwrap();
    let leading = src.view().at(&[ds(1, 1)]).unwrap().at(&[Indexer::Index(0), Indexer::Index(0)]).unwrap();
    device.async_copy(&leading, &tile.view(), &sem).unwrap().wait().unwrap();
    assert_eq!(tile.to_vec::<f32>().unwrap(), values[8 * 128..8 * 128 + 128]);
}

#[test]
fn test_dynamic_size_copy() {
    let device = device();
    let size = device.scalar(MemorySpace::Smem, 2i32).unwrap();
    let values: Vec<f32> = (0..8 * 128).map(|i| i as f32).collect();
    let src = device.buffer_from_slice(MemorySpace::Hbm, &values, &[8, 128]).unwrap();
    let dst = device.allocate(MemorySpace::Hbm, DType::Float32, &[8, 128]).unwrap();
    let sem = SemaphoreRef::new(SemaphoreKind::Dma, &[]);

    let rows = size.view().load::<i32>().unwrap()[0] as usize;
    let window = [ds(0, rows)];
    device.async_copy(&src.view().at(&window).unwrap(), &dst.view().at(&window).unwrap(), &sem).unwrap().wait().unwrap();

    let copied = dst.to_vec::<f32>().unwrap();
    assert_eq!(&copied[..2 * 128], &values[..2 * 128]);
    assert!(copied[2 * 128..].iter().all(|x| *x == 0.0));
}

#[test]
fn test_mismatched_endpoints() {
    let device = device();
    let src = device.allocate(MemorySpace::Hbm, DType::Float32, &[8, 128]).unwrap();
    let narrow = device.allocate(MemorySpace::Vmem, DType::Float32, &[4, 128]).unwrap();
    let ints = device.allocate(MemorySpace::Vmem, DType::Int32, &[8, 128]).unwrap();
    let sem = SemaphoreRef::new(SemaphoreKind::Dma, &[]);

    assert!(matches!(device.async_copy(&src.view(), &narrow.view(), &sem), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(device.async_copy(&src.view(), &ints.view(), &sem), Err(Error::DTypeMismatch { .. })));
}

#[test]
fn test_copy_into_released_buffer_fails_at_wait() {
    let device = device();
    let src = device.allocate(MemorySpace::Hbm, DType::Float32, &[64]).unwrap();
    let dst = device.allocate(MemorySpace::Vmem, DType::Float32, &[64]).unwrap();
    let sem = SemaphoreRef::new(SemaphoreKind::Dma, &[]);

    dst.release();
    assert!(matches!(device.async_copy(&src.view(), &dst.view(), &sem), Err(Error::UseAfterRelease { .. })));
}

#[test]
fn test_stall_timeout_reports_unmatched_wait() {
    let config = DeviceConfig::builder().stall_timeout_ms(20).build();
    let device = Device::new(0, config).unwrap();
    let sem = SemaphoreRef::new(SemaphoreKind::Regular, &[]);

    let err = sem.wait(1, device.stall_timeout()).unwrap_err();
    assert!(matches!(err, Error::Stall { kind: SemaphoreKind::Regular, .. }));
}
