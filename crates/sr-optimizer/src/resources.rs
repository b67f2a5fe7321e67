//! Degree-of-parallelism resolution and local GPU discovery.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;

/// Counts GPU-class devices visible to this process.
pub trait DeviceProbe: Send + Sync {
    fn gpu_count(&self) -> usize;
}

/// A probe that always reports the same count.
#[derive(Debug, Clone, Copy)]
pub struct FixedDeviceProbe(pub usize);

impl DeviceProbe for FixedDeviceProbe {
    fn gpu_count(&self) -> usize {
        self.0
    }
}

/// Probes `CUDA_VISIBLE_DEVICES`, then `/dev/nvidia<N>` device nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDeviceProbe;

impl DeviceProbe for SystemDeviceProbe {
    fn gpu_count(&self) -> usize {
        if let Ok(visible) = std::env::var("CUDA_VISIBLE_DEVICES") {
            return parse_visible_devices(&visible);
        }
        count_device_nodes(Path::new("/dev"))
    }
}

/// Number of devices named by a `CUDA_VISIBLE_DEVICES` value. Enumeration
/// stops at the first `-1`, as the CUDA runtime does.
fn parse_visible_devices(value: &str) -> usize {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .take_while(|id| *id != "-1")
        .count()
}

fn count_device_nodes(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("nvidia"))
                .is_some_and(|suffix| {
                    !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit())
                })
        })
        .count()
}

/// Which signal decided the worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParallelismSource {
    Explicit,
    ClusterGpus,
    LocalGpus,
    Fallback,
}

/// Resolved degree of parallelism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parallelism {
    pub workers: usize,
    pub source: ParallelismSource,
    /// GPUs visible to the scheduler (cluster if it reported any, else local).
    /// An explicit worker count only consults the local probe.
    pub visible_gpus: usize,
}

/// Decides how many workers to launch.
///
/// Precedence, first success wins: explicit override, cluster GPU count, local
/// GPU count, then a single worker. Never fails.
pub struct ResourceSizer<'a> {
    cluster: &'a dyn Cluster,
    probe: &'a dyn DeviceProbe,
}

impl<'a> ResourceSizer<'a> {
    pub fn new(cluster: &'a dyn Cluster, probe: &'a dyn DeviceProbe) -> Self {
        Self { cluster, probe }
    }

    pub async fn resolve(&self, explicit: Option<usize>) -> Parallelism {
        // An explicit count never touches the cluster
        if let Some(workers) = explicit.filter(|n| *n > 0) {
            let visible_gpus = self.probe.gpu_count();
            info!(workers, visible_gpus, "Using explicit parallelism");
            return Parallelism {
                workers,
                source: ParallelismSource::Explicit,
                visible_gpus,
            };
        }

        let cluster_gpus = match self.cluster.resources().await {
            Ok(resources) => {
                debug!(
                    cluster = self.cluster.name(),
                    cpus = resources.cpus,
                    gpus = resources.gpus,
                    "Cluster resources"
                );
                Some(resources.gpus.max(0.0).floor() as usize)
            }
            Err(e) => {
                warn!(cluster = self.cluster.name(), "Cluster resource query failed: {e}");
                None
            }
        };
        let local_gpus = self.probe.gpu_count();
        let visible_gpus = cluster_gpus.filter(|g| *g > 0).unwrap_or(local_gpus);

        let (workers, source) = if let Some(gpus) = cluster_gpus.filter(|g| *g > 0) {
            (gpus, ParallelismSource::ClusterGpus)
        } else if local_gpus > 0 {
            (local_gpus, ParallelismSource::LocalGpus)
        } else {
            warn!(
                "No GPUs found and no explicit split count provided; defaulting to a single split"
            );
            (1, ParallelismSource::Fallback)
        };

        info!(workers, ?source, visible_gpus, "Resolved parallelism");
        Parallelism {
            workers,
            source,
            visible_gpus,
        }
    }
}
