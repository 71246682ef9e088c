//! Worker sizing for the parallel sampler.
//!
//! GPU discovery reads the standard visibility variables; there is no
//! driver probing in this crate. `ParallelConfig::gpu_devices` overrides it.

use std::env;
use std::thread;

use crate::config::ParallelConfig;
use crate::constants::WORKERS_PER_GPU;

/// Execution layout chosen once at sampler construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerPlan {
    pub num_workers: usize,
    pub use_gpu: bool,
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Count devices in a `CUDA_VISIBLE_DEVICES`-style list. Unset, empty, or a
/// leading `-1` (the "hide all" convention) count as zero.
pub fn parse_visible_devices(value: Option<&str>) -> usize {
    let Some(value) = value else {
        return 0;
    };
    let mut count = 0;
    for entry in value.split(',').map(str::trim) {
        if entry.is_empty() {
            continue;
        }
        if entry == "-1" {
            break;
        }
        count += 1;
    }
    count
}

/// Resolve worker count and execution mode.
///
/// GPU mode caps workers at `gpu_devices * 2`. Requesting GPU mode with no
/// device falls back to CPU mode.
pub fn plan_workers(config: &ParallelConfig, gpu_devices: usize, cpus: usize) -> WorkerPlan {
    let configured = config.num_workers.unwrap_or(cpus).max(1);

    if !config.use_gpu {
        return WorkerPlan {
            num_workers: configured,
            use_gpu: false,
        };
    }

    if gpu_devices == 0 {
        tracing::warn!("GPU execution requested but no GPU device found - using CPU workers");
        return WorkerPlan {
            num_workers: configured,
            use_gpu: false,
        };
    }

    WorkerPlan {
        num_workers: configured.min(gpu_devices * WORKERS_PER_GPU).max(1),
        use_gpu: true,
    }
}

// ---------------------------------------------------------------------------
// Environment wrappers
// ---------------------------------------------------------------------------

/// Visible GPU devices per `CUDA_VISIBLE_DEVICES`, then `HIP_VISIBLE_DEVICES`.
pub fn detect_gpu_devices() -> usize {
    for var in ["CUDA_VISIBLE_DEVICES", "HIP_VISIBLE_DEVICES"] {
        if let Ok(value) = env::var(var) {
            return parse_visible_devices(Some(&value));
        }
    }
    0
}

pub fn available_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
