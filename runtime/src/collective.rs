//! SPMD launches over a device mesh.

use std::sync::Arc;

use rayon::prelude::*;
use snafu::{ResultExt, ensure};
use tessel_device::{DeviceRegistry, SemaphoreKind, SemaphoreSlot};

use crate::error::{DeviceSnafu, OperandCountSnafu, Result, ThreadPoolSnafu};
use crate::launch::{Launch, LaunchArgs, LaunchReport, Target};

/// Run `call` once on every device of `mesh`, concurrently, each with its own arguments.
///
/// A call with a `collective_id` gets a barrier semaphore reserved on every
/// device before any program starts, so early signals from fast peers are
/// never lost. Slots left on any device afterwards are checked for leaks.
#[tracing::instrument(skip_all, fields(kernel = %call.name(), devices = mesh.len()))]
pub fn launch_spmd<L: Launch>(
    call: &L,
    mesh: &Arc<DeviceRegistry>,
    per_device_args: &[LaunchArgs],
) -> Result<Vec<LaunchReport>> {
    ensure!(
        per_device_args.len() == mesh.len(),
        OperandCountSnafu { what: "per-device argument sets", expected: mesh.len(), actual: per_device_args.len() }
    );

    if call.collective_id().is_some() {
        for device in mesh.devices() {
            device.semaphore(SemaphoreSlot::Barrier, SemaphoreKind::Barrier, &[]).context(DeviceSnafu)?;
        }
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(mesh.len().max(1))
        .thread_name(|index| format!("tessel-device-{index}"))
        .build()
        .map_err(|err| ThreadPoolSnafu { reason: err.to_string() }.build())?;

    let reports = pool.install(|| {
        per_device_args
            .par_iter()
            .enumerate()
            .map(|(id, args)| call.launch(&Target::in_mesh(mesh, id)?, args))
            .collect::<Vec<_>>()
    });

    // Late remote signals may have re-created slots on devices that already finished.
    let mut leak = None;
    for device in mesh.devices() {
        for (slot, sem) in device.clear_slots() {
            let residual = sem.residual();
            sem.release();
            if residual != 0 && leak.is_none() {
                tracing::debug!(device = device.id(), ?slot, residual, "semaphore left signaled after collective");
                leak = Some(tessel_device::Error::SemaphoreLeak {
                    kind: sem.kind(),
                    shape: sem.array_shape().to_vec(),
                    residual,
                });
            }
        }
    }

    let reports = reports.into_iter().collect::<Result<Vec<_>>>()?;
    match leak {
        Some(source) => Err(source).context(DeviceSnafu),
        None => Ok(reports),
    }
}
