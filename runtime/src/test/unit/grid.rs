use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::smallvec;
use tessel_device::MemorySpace;
use tessel_dtype::DType;

use super::device;
use crate::{
    BlockSpec, DynamicBound, Error, GridDim, GridSpec, IndexMap, Launch, LaunchArgs, OutputShape, PrefetchedScalars,
    Target, TileCall, kernel_fn,
};

/// Call whose body bumps a rank-0 SMEM counter once per step.
fn counting_call(grid: GridSpec, num_scalar_prefetch: usize) -> TileCall {
    TileCall::builder()
        .kernel(kernel_fn(|ctx| {
            ctx.output(0)?.update::<i64>(|count| count + 1)?;
            Ok(())
        }))
        .out_shapes(vec![OutputShape::of::<i64>(&[])])
        .out_specs(vec![BlockSpec::memory(MemorySpace::Smem)])
        .grid(grid)
        .num_scalar_prefetch(num_scalar_prefetch)
        .name("count")
        .build()
}

#[test]
fn test_dynamic_grid_resolves_from_bound_argument() {
    let device = device();
    let steps = DynamicBound::argument(0);
    let grid = GridSpec::new([steps.times(2).into(), steps.plus(1).into(), GridDim::Static(3)]);
    assert!(grid.is_dynamic());

    let bound = device.scalar(MemorySpace::Hbm, 4i32).unwrap();
    let report = counting_call(grid, 0)
        .launch(&Target::device(device.clone()), &LaunchArgs::new(vec![]).with_bounds(vec![bound]))
        .unwrap();

    assert_eq!(report.stats.steps, 120);
    assert_eq!(report.outputs[0].to_vec::<i64>().unwrap(), vec![120]);
}

#[test]
fn test_dynamic_grid_from_prefetched_scalar() {
    let device = device();
    let grid = GridSpec::new([DynamicBound::prefetched(0, 1).into()]);
    let sizes = device.buffer_from_slice(MemorySpace::Hbm, &[9i32, 5], &[2]).unwrap();

    let outputs = counting_call(grid, 1).call(&device, &[sizes]).unwrap();
    assert_eq!(outputs[0].to_vec::<i64>().unwrap(), vec![5]);
}

#[test]
fn test_zero_rank_grid_runs_once() {
    let device = device();
    let outputs = counting_call(GridSpec::fixed(&[]), 0).call(&device, &[]).unwrap();
    assert_eq!(outputs[0].to_vec::<i64>().unwrap(), vec![1]);
}

#[test]
fn test_empty_grid_leaves_outputs_zeroed() {
    let device = device();
    let steps = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&steps);
    let call = TileCall::builder()
        .kernel(kernel_fn(move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }))
        .out_shapes(vec![OutputShape::new(DType::Float32, &[4])])
        .grid(GridSpec::fixed(&[3, 0]))
        .build();

    let outputs = call.call(&device, &[]).unwrap();
    assert_eq!(steps.load(Ordering::Relaxed), 0);
    assert_eq!(outputs[0].to_vec::<f32>().unwrap(), vec![0.0; 4]);
}

#[test]
fn test_negative_bound_is_rejected() {
    let device = device();
    let grid = GridSpec::new([DynamicBound::argument(0).plus(-3).into()]);
    let bound = device.scalar(MemorySpace::Hbm, 2i64).unwrap();
    let err = counting_call(grid, 0)
        .launch(&Target::device(device.clone()), &LaunchArgs::new(vec![]).with_bounds(vec![bound]))
        .unwrap_err();
    assert!(matches!(err, Error::NegativeGridBound { axis: 0, value: -1 }), "{err}");
}

#[test]
fn test_missing_and_non_integer_bounds() {
    let device = device();
    let grid = GridSpec::new([DynamicBound::argument(1).into()]);
    let bound = device.scalar(MemorySpace::Hbm, 2i64).unwrap();
    let err = counting_call(grid.clone(), 0)
        .launch(&Target::device(device.clone()), &LaunchArgs::new(vec![]).with_bounds(vec![bound]))
        .unwrap_err();
    assert!(matches!(err, Error::MissingBoundArgument { index: 1, available: 1 }), "{err}");

    let grid = GridSpec::new([DynamicBound::argument(0).into()]);
    let bound = device.scalar(MemorySpace::Hbm, 2.0f32).unwrap();
    let err = counting_call(grid, 0)
        .launch(&Target::device(device.clone()), &LaunchArgs::new(vec![]).with_bounds(vec![bound]))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBoundArgument { .. }), "{err}");
}

#[test]
fn test_step_count_is_bounded() {
    let dims = [GridDim::Static(1 << 40), GridDim::Static(1 << 40), GridDim::Static(4)];
    let err = GridSpec::new(dims).resolve(&[], &PrefetchedScalars::empty()).unwrap_err();
    assert!(matches!(err, Error::GridTooLarge { .. }), "{err}");

    let placeholder = GridSpec::new([DynamicBound::argument(0).into(), DynamicBound::argument(1).into()]);
    assert_eq!(placeholder.static_step_bound(), (i32::MAX as u128) * (i32::MAX as u128));
}

#[test]
fn test_invalid_core_split() {
    let grid = GridSpec::fixed(&[4]).core_parallel(2, 2);
    let err = grid.resolve(&[], &PrefetchedScalars::empty()).unwrap_err();
    assert!(matches!(err, Error::InvalidCoreSplit { dim: 2, .. }), "{err}");
}

#[test]
fn test_split_drops_empty_units() {
    let grid = GridSpec::fixed(&[3, 2]).core_parallel(0, 4);
    let resolved = grid.resolve(&[], &PrefetchedScalars::empty()).unwrap();
    let units = resolved.split(grid.core_split().unwrap());
    assert_eq!(units.len(), 3);
    assert!(units.iter().all(|unit| unit.steps() == 2));
}

#[test]
fn test_uneven_core_split_writes_every_block_once() {
    let device = device();
    let call = TileCall::builder()
        .kernel(kernel_fn(|ctx| {
            ctx.output(0)?.update::<i32>(|hits| hits + 1)?;
            let id = ctx.program_id(0) * 10 + ctx.program_id(1);
            ctx.output(1)?.set(&[0, 0], id)?;
            Ok(())
        }))
        .out_shapes(vec![OutputShape::of::<i32>(&[3, 2, 4]), OutputShape::of::<i64>(&[3, 2])])
        .out_specs(vec![
            BlockSpec::tiled(&[1, 1, 4], IndexMap::new(|p, _| smallvec![p.program_id(0), p.program_id(1), 0])),
            BlockSpec::tiled(&[1, 1], IndexMap::grid()),
        ])
        .grid(GridSpec::fixed(&[3, 2]).core_parallel(0, 2))
        .name("uneven_split")
        .build();

    let report = call.launch(&Target::device(device.clone()), &LaunchArgs::default()).unwrap();

    assert_eq!(report.stats.units, 2);
    assert_eq!(report.stats.steps, 6);
    assert_eq!(report.outputs[0].to_vec::<i32>().unwrap(), vec![1; 24]);
    assert_eq!(report.outputs[1].to_vec::<i64>().unwrap(), vec![0, 1, 10, 11, 20, 21]);
}
