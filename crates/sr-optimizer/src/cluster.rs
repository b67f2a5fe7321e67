//! Cluster configuration, bootstrap and per-worker resource allocations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sr_types::{ClusterError, ConfigError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::resources::DeviceProbe;
use crate::trial::RunId;

/// Environment variable naming the cluster head address.
pub const CLUSTER_ADDRESS_ENV: &str = "SPACERAY_CLUSTER_ADDRESS";

/// Configuration for connecting to a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Head node address (e.g. "10.0.0.5:6379"). `None` runs single-process.
    pub address: Option<String>,

    /// Namespace for this run.
    pub namespace: String,

    /// How long to wait for the head node before falling back to local mode.
    pub connect_timeout_ms: u64,

    /// Static node inventory advertised by the cluster.
    pub nodes: Vec<NodeSpec>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            address: None,
            namespace: "spaceray".to_string(),
            connect_timeout_ms: 2_000,
            nodes: Vec::new(),
        }
    }
}

impl ClusterConfig {
    /// Default config with the address taken from `SPACERAY_CLUSTER_ADDRESS`.
    pub fn from_env() -> Self {
        let address = std::env::var(CLUSTER_ADDRESS_ENV)
            .ok()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }
}

/// One machine in a static cluster inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub cpus: f64,
    pub gpus: f64,
}

/// Resource requirements for a single worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResources {
    /// Number of CPUs per worker (fractional ok).
    pub num_cpus: f64,
    /// Number of GPUs per worker (0 = no GPU).
    pub num_gpus: f64,
    /// Custom resource requirements.
    pub custom: HashMap<String, f64>,
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self {
            num_cpus: 8.0,
            num_gpus: 1.0,
            custom: HashMap::new(),
        }
    }
}

impl WorkerResources {
    pub fn new(num_cpus: f64, num_gpus: f64) -> Self {
        Self {
            num_cpus,
            num_gpus,
            custom: HashMap::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let amounts = [("num_cpus", self.num_cpus), ("num_gpus", self.num_gpus)]
            .into_iter()
            .chain(self.custom.iter().map(|(k, v)| (k.as_str(), *v)));
        for (field, amount) in amounts {
            if !amount.is_finite() || amount < 0.0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: format!("resource amount must be a non-negative number, got {amount}"),
                });
            }
        }
        Ok(())
    }
}

/// Resource totals visible to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterResources {
    pub cpus: f64,
    pub gpus: f64,
}

/// Resource query interface of whatever executes the workers.
#[async_trait]
pub trait Cluster: Send + Sync {
    fn name(&self) -> &str;

    /// Current CPU and GPU totals. May fail; callers treat failure as "no cluster".
    async fn resources(&self) -> Result<ClusterResources, ClusterError>;
}

/// Single-process fallback: the local machine is the whole cluster.
#[derive(Debug, Clone)]
pub struct LocalCluster {
    cpus: usize,
    gpus: usize,
}

impl LocalCluster {
    pub fn new(cpus: usize, gpus: usize) -> Self {
        Self { cpus, gpus }
    }

    /// Local CPU count from the OS and GPU count from `probe`.
    pub fn detect(probe: &dyn DeviceProbe) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(cpus, probe.gpu_count())
    }
}

#[async_trait]
impl Cluster for LocalCluster {
    fn name(&self) -> &str {
        "local"
    }

    async fn resources(&self) -> Result<ClusterResources, ClusterError> {
        Ok(ClusterResources {
            cpus: self.cpus as f64,
            gpus: self.gpus as f64,
        })
    }
}

/// A reachable cluster described by a static node inventory.
#[derive(Debug, Clone)]
pub struct StaticCluster {
    namespace: String,
    nodes: Vec<NodeSpec>,
}

impl StaticCluster {
    pub fn new(namespace: impl Into<String>, nodes: Vec<NodeSpec>) -> Self {
        Self {
            namespace: namespace.into(),
            nodes,
        }
    }
}

#[async_trait]
impl Cluster for StaticCluster {
    fn name(&self) -> &str {
        &self.namespace
    }

    async fn resources(&self) -> Result<ClusterResources, ClusterError> {
        if self.nodes.is_empty() {
            return Err(ClusterError::EmptyInventory);
        }
        Ok(self.nodes.iter().fold(
            ClusterResources { cpus: 0.0, gpus: 0.0 },
            |acc, node| ClusterResources {
                cpus: acc.cpus + node.cpus,
                gpus: acc.gpus + node.gpus,
            },
        ))
    }
}

/// Connect to the configured cluster, falling back to single-process mode on
/// any failure. Never fails.
pub async fn connect(config: &ClusterConfig, probe: &dyn DeviceProbe) -> Arc<dyn Cluster> {
    match try_connect(config).await {
        Ok(Some(cluster)) => {
            info!(
                namespace = %config.namespace,
                nodes = config.nodes.len(),
                "Connected to cluster"
            );
            Arc::new(cluster)
        }
        Ok(None) => Arc::new(LocalCluster::detect(probe)),
        Err(e) => {
            warn!(
                "Could not connect to existing cluster ({e}); continuing in single-process mode. \
                 Ignore this warning when running on a single node."
            );
            Arc::new(LocalCluster::detect(probe))
        }
    }
}

/// `Ok(None)` when no address is configured.
pub async fn try_connect(config: &ClusterConfig) -> Result<Option<StaticCluster>, ClusterError> {
    let Some(address) = config.address.as_deref() else {
        return Ok(None);
    };

    let timeout = Duration::from_millis(config.connect_timeout_ms);
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Err(_) => Err(ClusterError::Timeout {
            address: address.to_string(),
            timeout_ms: config.connect_timeout_ms,
        }),
        Ok(Err(e)) => Err(ClusterError::Unreachable {
            address: address.to_string(),
            message: e.to_string(),
        }),
        Ok(Ok(_stream)) => {
            if config.nodes.is_empty() {
                return Err(ClusterError::EmptyInventory);
            }
            Ok(Some(StaticCluster::new(
                config.namespace.clone(),
                config.nodes.clone(),
            )))
        }
    }
}

/// The reservation held by one worker for the lifetime of its chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAllocation {
    pub worker_id: String,
    pub chunk_id: usize,
    pub resources: WorkerResources,
    /// Device ids this worker may use, assigned round-robin over the cluster's GPUs.
    pub gpu_ids: Vec<usize>,
}

impl WorkerAllocation {
    pub fn new(chunk_id: usize, resources: WorkerResources, total_gpus: usize) -> Self {
        let gpu_ids = assign_devices(chunk_id, resources.num_gpus, total_gpus);
        Self {
            worker_id: format!("worker-{chunk_id}"),
            chunk_id,
            resources,
            gpu_ids,
        }
    }

    /// Value for `CUDA_VISIBLE_DEVICES` inside objective code.
    pub fn visible_devices(&self) -> String {
        self.gpu_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn assign_devices(worker: usize, gpus_per_worker: f64, total_gpus: usize) -> Vec<usize> {
    if total_gpus == 0 || gpus_per_worker <= 0.0 {
        return Vec::new();
    }
    // Fractional reservations share a device with their neighbours
    let start = (worker as f64 * gpus_per_worker).floor() as usize;
    let count = (gpus_per_worker.ceil() as usize).min(total_gpus);
    (start..start + count).map(|d| d % total_gpus).collect()
}

/// Describes one chunk task handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkTaskDescriptor {
    /// Unique task id.
    pub task_id: Uuid,

    /// Run this task belongs to.
    pub run_id: RunId,

    /// Region indices in processing order.
    pub region_indices: Vec<usize>,

    pub allocation: WorkerAllocation,
}
