use std::sync::Arc;

use tessel_device::{DeviceConfig, DeviceRegistry, MemorySpace, MeshTopology};

use crate::{
    BlockSpec, CompilerParams, Error, LaunchArgs, OutputShape, ScratchShape, TileCall, kernel_fn,
    launch_spmd,
};

fn mesh(topology: MeshTopology) -> Arc<DeviceRegistry> {
    DeviceRegistry::new(topology, &DeviceConfig::builder().stall_timeout_ms(5_000).build()).unwrap()
}

/// Every device sends its block to the right neighbour.
fn ring_permute() -> TileCall {
    TileCall::builder()
        .kernel(kernel_fn(|ctx| {
            let (me, n) = (ctx.device_id(), ctx.num_devices());
            let (left, right) = ((me + n - 1) % n, (me + 1) % n);

            // Both neighbours must be inside the kernel before their buffers are addressed.
            let barrier = ctx.barrier_semaphore()?;
            ctx.semaphore_signal_remote(&barrier, 1, left)?;
            ctx.semaphore_signal_remote(&barrier, 1, right)?;
            ctx.semaphore_wait(&barrier, 2)?;

            let (send, recv) = (ctx.scratch_semaphore(0)?, ctx.scratch_semaphore(1)?);
            ctx.async_remote_copy(&ctx.input(0)?, &ctx.output(0)?, &send, &recv, right)?.wait()?;
            Ok(())
        }))
        .out_shapes(vec![OutputShape::of::<i32>(&[4, 8])])
        .in_specs(vec![BlockSpec::memory(MemorySpace::Unassigned)])
        .out_specs(vec![BlockSpec::memory(MemorySpace::Unassigned)])
        .scratch_shapes(vec![ScratchShape::dma(), ScratchShape::dma()])
        .compiler_params(CompilerParams::builder().collective_id(0).build())
        .name("ring_permute")
        .build()
}

#[test]
fn test_ring_permute_over_mesh() {
    let mesh = mesh(MeshTopology::linear(4).unwrap());
    let args: Vec<_> = mesh
        .devices()
        .iter()
        .map(|device| {
            let block = vec![device.id() as i32 * 100; 32];
            LaunchArgs::new(vec![device.buffer_from_slice(MemorySpace::Hbm, &block, &[4, 8]).unwrap()])
        })
        .collect();

    let reports = launch_spmd(&ring_permute(), &mesh, &args).unwrap();

    for (id, report) in reports.iter().enumerate() {
        let left = (id + 3) % 4;
        assert_eq!(report.outputs[0].to_vec::<i32>().unwrap(), vec![left as i32 * 100; 32], "device {id}");
        assert_eq!(report.stats.dma_bytes, 128);
    }
    for device in mesh.devices() {
        assert!(device.clear_slots().is_empty());
    }
}

#[test]
fn test_mesh_axes_are_visible_to_kernels() {
    let mesh = mesh(MeshTopology::new(&[("x", 2), ("y", 2)]).unwrap());
    let call = TileCall::builder()
        .kernel(kernel_fn(|ctx| {
            let out = ctx.output(0)?;
            out.set(&[0], ctx.axis_index("x")? as i64)?;
            out.set(&[1], ctx.axis_index("y")? as i64)?;
            out.set(&[2], (ctx.axis_size("x")? * ctx.axis_size("y")?) as i64)?;
            Ok(())
        }))
        .out_shapes(vec![OutputShape::of::<i64>(&[3])])
        .build();

    let reports = launch_spmd(&call, &mesh, &vec![LaunchArgs::default(); 4]).unwrap();
    let coords: Vec<_> = reports.iter().map(|report| report.outputs[0].to_vec::<i64>().unwrap()).collect();
    assert_eq!(coords, vec![vec![0, 0, 4], vec![0, 1, 4], vec![1, 0, 4], vec![1, 1, 4]]);
}

#[test]
fn test_unknown_axis_fails() {
    let mesh = mesh(MeshTopology::linear(2).unwrap());
    let call = TileCall::builder()
        .kernel(kernel_fn(|ctx| ctx.axis_index("model").map(|_| ())))
        .out_shapes(vec![])
        .build();
    let err = launch_spmd(&call, &mesh, &vec![LaunchArgs::default(); 2]).unwrap_err();
    assert!(matches!(err, Error::Device { .. }), "{err}");
}

#[test]
fn test_argument_sets_must_match_mesh() {
    let mesh = mesh(MeshTopology::linear(2).unwrap());
    let err = launch_spmd(&ring_permute(), &mesh, &[LaunchArgs::default()]).unwrap_err();
    assert!(matches!(err, Error::OperandCount { expected: 2, actual: 1, .. }), "{err}");
}

#[test]
fn test_launch_without_collective_id_has_no_barrier() {
    let mesh = mesh(MeshTopology::linear(2).unwrap());
    let call = TileCall::builder()
        .kernel(kernel_fn(|ctx| {
            assert!(matches!(ctx.barrier_semaphore(), Err(Error::MissingBarrier)));
            Ok(())
        }))
        .out_shapes(vec![])
        .build();
    assert_eq!(launch_spmd(&call, &mesh, &vec![LaunchArgs::default(); 2]).unwrap().len(), 2);
}
