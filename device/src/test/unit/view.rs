use std::sync::Arc;

use test_case::test_case;

use crate::{AxisView, Buffer, Device, DeviceConfig, Error, Indexer, MemRef, MemorySpace, ds};

fn iota(device: &Arc<Device>, shape: &[usize]) -> Buffer {
    let values: Vec<i32> = (0..shape.iter().product::<usize>() as i32).collect();
    device.buffer_from_slice(MemorySpace::Hbm, &values, shape).unwrap()
}

fn device() -> Arc<Device> {
    Device::new(0, DeviceConfig::default()).unwrap()
}

#[test]
fn test_chained_indexing() {
    let device = device();
    let buffer = iota(&device, &[4, 3, 8]);

    let row = buffer.view().at(&[ds(1, 2)]).unwrap().at(&[Indexer::Index(1), Indexer::Index(2)]).unwrap();
    assert_eq!(row.shape().as_slice(), &[8]);
    assert_eq!(row.load::<i32>().unwrap(), (64..72).collect::<Vec<_>>());
}

#[test]
fn test_slice_on_inner_axis() {
    let device = device();
    let buffer = iota(&device, &[2, 6]);

    let view = buffer.view().at(&[Indexer::Full, ds(2, 3)]).unwrap();
    assert_eq!(view.shape().as_slice(), &[2, 3]);
    assert_eq!(view.load::<i32>().unwrap(), vec![2, 3, 4, 8, 9, 10]);
}

#[test_case(&[ds(3, 2)] ; "slice past extent")]
#[test_case(&[Indexer::Index(4)] ; "index past extent")]
#[test_case(&[Indexer::Full, Indexer::Full, Indexer::Full] ; "too many indexers")]
fn test_invalid_indexing(indexers: &[Indexer]) {
    let device = device();
    let buffer = iota(&device, &[4, 4]);
    assert!(buffer.view().at(indexers).is_err());
}

#[test]
fn test_out_of_bounds_window_reads_zero_and_drops_writes() {
    let device = device();
    let buffer = iota(&device, &[4]);

    let window =
        MemRef::with_axes(buffer.clone(), &[AxisView::Range { start: -2, len: 4 }]).unwrap();
    assert_eq!(window.load::<i32>().unwrap(), vec![0, 0, 0, 1]);

    window.store(&[10, 11, 12, 13]).unwrap();
    assert_eq!(buffer.to_vec::<i32>().unwrap(), vec![12, 13, 2, 3]);
}

#[test]
fn test_get_set_update() {
    let device = device();
    let buffer = iota(&device, &[2, 2]);
    let view = buffer.view();

    assert_eq!(view.get::<i32>(&[1, 0]).unwrap(), 2);
    view.set(&[0, 1], 40i32).unwrap();
    view.update(|x: i32| x + 1).unwrap();
    assert_eq!(buffer.to_vec::<i32>().unwrap(), vec![1, 41, 3, 4]);
    assert!(matches!(view.get::<i32>(&[2, 0]), Err(Error::IndexOutOfBounds { .. })));
}

#[test]
fn test_minor_squeeze_detection() {
    let device = device();
    let buffer = iota(&device, &[2, 4, 8]);

    assert!(buffer.view().at(&[Indexer::Full, Indexer::Full, Indexer::Index(0)]).unwrap().squeezes_minor());
    assert!(!buffer.view().at(&[ds(0, 1)]).unwrap().at(&[Indexer::Index(0), Indexer::Index(0)]).unwrap().squeezes_minor());
}

#[test]
fn test_rebind_requires_same_layout() {
    let device = device();
    let a = iota(&device, &[4, 4]);
    let b = device.allocate(MemorySpace::Hbm, a.dtype(), &[4, 4]).unwrap();
    let c = device.allocate(MemorySpace::Hbm, a.dtype(), &[16]).unwrap();

    let view = a.view().at(&[Indexer::Index(2)]).unwrap();
    let moved = view.rebind(b.clone()).unwrap();
    moved.store(&[7, 7, 7, 7]).unwrap();
    assert_eq!(&b.to_vec::<i32>().unwrap()[8..12], &[7, 7, 7, 7]);
    assert!(view.rebind(c).is_err());
}
