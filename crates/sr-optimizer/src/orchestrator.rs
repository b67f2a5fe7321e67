//! Chunk dispatch and fan-in.
//!
//! One blocking task per chunk, all joined before the run returns. Workers
//! never talk to each other; the only thing shared with a running chunk is
//! its progress tracker, read back after the join.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sr_types::{PartitionError, SrResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cluster::{ChunkTaskDescriptor, Cluster, WorkerAllocation};
use crate::partition::{apply_offset, split_contiguous, Chunk};
use crate::resources::{DeviceProbe, Parallelism, ParallelismSource, ResourceSizer};
use crate::runner::{ChunkProgress, ChunkSummary, SequentialRegionRunner};
use crate::search::IndexedRegion;
use crate::trial::{RegionState, RunId};

/// How a chunk task ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChunkStatus {
    /// Every region reached a terminal state (some may have failed).
    Finished,
    /// The task itself died. Regions it never finished are not retried.
    Failed {
        error: String,
        unprocessed: Vec<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkOutcome {
    pub chunk_id: usize,
    pub worker_id: String,
    pub region_indices: Vec<usize>,
    pub summary: ChunkSummary,
    pub status: ChunkStatus,
}

impl ChunkOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, ChunkStatus::Failed { .. })
    }
}

/// Summary of one orchestrated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub parallelism: Parallelism,
    /// Regions dispatched after the resume offset was applied.
    pub dispatched_regions: usize,
    /// Ordered by chunk id.
    pub chunks: Vec<ChunkOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl RunReport {
    /// No chunk task died. Individual regions may still have failed.
    pub fn all_succeeded(&self) -> bool {
        self.chunks.iter().all(|c| !c.is_failed())
    }

    pub fn failed_chunks(&self) -> Vec<&ChunkOutcome> {
        self.chunks.iter().filter(|c| c.is_failed()).collect()
    }

    pub fn completed_regions(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .flat_map(|c| c.summary.completed.iter().copied())
            .collect()
    }

    pub fn failed_regions(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .flat_map(|c| c.summary.failed.iter().copied())
            .collect()
    }

    /// Regions left behind by crashed chunks.
    pub fn unprocessed_regions(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .flat_map(|c| match &c.status {
                ChunkStatus::Failed { unprocessed, .. } => unprocessed.clone(),
                ChunkStatus::Finished => Vec::new(),
            })
            .collect()
    }
}

/// Chunks and their worker descriptors, ready to launch.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub parallelism: Parallelism,
    pub tasks: Vec<(ChunkTaskDescriptor, Chunk)>,
}

impl DispatchPlan {
    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.tasks.iter().map(|(_, chunk)| chunk.len()).collect()
    }
}

/// Sizes the worker pool, partitions the regions and runs one task per chunk.
pub struct WorkerOrchestrator {
    runner: SequentialRegionRunner,
    cluster: Arc<dyn Cluster>,
    probe: Arc<dyn DeviceProbe>,
}

impl WorkerOrchestrator {
    pub fn new(
        runner: SequentialRegionRunner,
        cluster: Arc<dyn Cluster>,
        probe: Arc<dyn DeviceProbe>,
    ) -> Self {
        Self {
            runner,
            cluster,
            probe,
        }
    }

    /// Apply the resume offset, resolve parallelism and split into chunks.
    pub async fn plan(&self, regions: Vec<IndexedRegion>) -> SrResult<DispatchPlan> {
        let config = self.runner.config();
        let total = regions.len();
        let regions = apply_offset(regions, config.start_region);
        let remaining = regions.len();
        if let Some(offset) = config.start_region {
            info!(offset, total, remaining, "Resuming from region offset");
        }

        let sizer = ResourceSizer::new(self.cluster.as_ref(), self.probe.as_ref());
        let mut parallelism = sizer.resolve(config.num_splits).await;

        if parallelism.workers > remaining {
            if parallelism.source == ParallelismSource::Explicit || remaining == 0 {
                return Err(PartitionError::InvalidPartition {
                    requested: parallelism.workers,
                    len: remaining,
                }
                .into());
            }
            info!(
                discovered = parallelism.workers,
                regions = remaining,
                "More workers than regions; capping worker count"
            );
            parallelism.workers = remaining;
        }

        let chunks = split_contiguous(regions, parallelism.workers)?;
        let tasks = chunks
            .into_iter()
            .enumerate()
            .map(|(chunk_id, chunk)| {
                let allocation = WorkerAllocation::new(
                    chunk_id,
                    config.worker_resources.clone(),
                    parallelism.visible_gpus,
                );
                let descriptor = ChunkTaskDescriptor {
                    task_id: Uuid::new_v4(),
                    run_id: config.id,
                    region_indices: chunk.iter().map(|r| r.index).collect(),
                    allocation,
                };
                (descriptor, chunk)
            })
            .collect();

        Ok(DispatchPlan { parallelism, tasks })
    }

    /// Plan, launch every chunk and wait for all of them.
    pub async fn run(&self, regions: Vec<IndexedRegion>) -> SrResult<RunReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let plan = self.plan(regions).await?;
        let dispatched_regions = plan.tasks.iter().map(|(_, chunk)| chunk.len()).sum();

        info!(
            run_id = %self.runner.config().id,
            workers = plan.parallelism.workers,
            source = ?plan.parallelism.source,
            chunk_sizes = ?plan.chunk_sizes(),
            "Dispatching chunks"
        );

        let mut group = TaskGroup::default();
        for (descriptor, chunk) in plan.tasks {
            group.spawn(self.runner.clone(), descriptor, chunk);
        }
        let chunks = group.join_all().await;

        let report = RunReport {
            run_id: self.runner.config().id,
            parallelism: plan.parallelism,
            dispatched_regions,
            chunks,
            started_at,
            finished_at: Utc::now(),
            elapsed: clock.elapsed(),
        };

        if report.all_succeeded() {
            info!(
                completed = report.completed_regions().len(),
                failed = report.failed_regions().len(),
                "All chunks finished"
            );
        } else {
            warn!(
                failed_chunks = report.failed_chunks().len(),
                unprocessed = ?report.unprocessed_regions(),
                "Some chunks did not finish; their remaining regions were not run"
            );
        }
        Ok(report)
    }
}

struct RunningChunk {
    descriptor: ChunkTaskDescriptor,
    progress: Arc<ChunkProgress>,
    handle: JoinHandle<ChunkSummary>,
}

/// Chunk tasks in launch order.
#[derive(Default)]
struct TaskGroup {
    tasks: Vec<RunningChunk>,
}

impl TaskGroup {
    fn spawn(
        &mut self,
        runner: SequentialRegionRunner,
        descriptor: ChunkTaskDescriptor,
        chunk: Chunk,
    ) {
        let progress = Arc::new(ChunkProgress::new(&descriptor.region_indices));
        let allocation = descriptor.allocation.clone();
        let task_progress = Arc::clone(&progress);
        let handle = tokio::task::spawn_blocking(move || {
            runner.run_chunk(&chunk, &allocation, &task_progress)
        });
        self.tasks.push(RunningChunk {
            descriptor,
            progress,
            handle,
        });
    }

    /// Wait for every task. A task that panicked is reported, never propagated.
    async fn join_all(self) -> Vec<ChunkOutcome> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for RunningChunk {
            descriptor,
            progress,
            handle,
        } in self.tasks
        {
            let (summary, status) = match handle.await {
                Ok(summary) => (summary, ChunkStatus::Finished),
                Err(e) => {
                    let error = join_error_message(e);
                    let unprocessed = progress.unprocessed();
                    error!(
                        chunk = descriptor.allocation.chunk_id,
                        worker = %descriptor.allocation.worker_id,
                        ?unprocessed,
                        "Chunk task failed: {error}"
                    );
                    (
                        summary_from_progress(&progress),
                        ChunkStatus::Failed { error, unprocessed },
                    )
                }
            };
            outcomes.push(ChunkOutcome {
                chunk_id: descriptor.allocation.chunk_id,
                worker_id: descriptor.allocation.worker_id,
                region_indices: descriptor.region_indices,
                summary,
                status,
            });
        }
        outcomes
    }
}

fn summary_from_progress(progress: &ChunkProgress) -> ChunkSummary {
    let mut summary = ChunkSummary::default();
    for (index, state) in progress.snapshot() {
        match state {
            RegionState::Completed => summary.completed.push(index),
            RegionState::Failed => summary.failed.push(index),
            RegionState::Pending | RegionState::Running => {}
        }
    }
    summary
}

fn join_error_message(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("worker panicked: {msg}")
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{LocalCluster, WorkerResources};
    use crate::persist::ResultPersister;
    use crate::resources::FixedDeviceProbe;
    use crate::runner::{Objective, TrialContext};
    use crate::search::{GuidedSearchFactory, SearchSpace, SpaceBuilder};
    use crate::trial::{ObjectiveDirection, RunConfig};
    use sr_types::{Metrics, ParameterSet, SrError};
    use tempfile::TempDir;

    // 8 regions
    fn regions() -> Vec<IndexedRegion> {
        let space = SearchSpace::new()
            .add_float("a", 0.0, 1.0)
            .add_float("b", 0.0, 1.0)
            .add_int("c", 0, 4);
        SpaceBuilder::new().build_indexed(&space).unwrap()
    }

    fn ok_objective(p: &ParameterSet, _ctx: &TrialContext<'_>) -> anyhow::Result<Metrics> {
        let a = p["a"].as_f64().unwrap_or_default();
        Ok(Metrics::from([("score".to_string(), a)]))
    }

    fn orchestrator<O: Objective + 'static>(
        dir: &TempDir,
        config: RunConfig,
        cluster_gpus: usize,
        objective: O,
    ) -> WorkerOrchestrator {
        let config = config
            .with_trials(2)
            .with_initial_points(1)
            .with_resources(WorkerResources::new(1.0, 1.0))
            .with_objective("score", ObjectiveDirection::Maximize);
        let runner = SequentialRegionRunner::new(
            Arc::new(config),
            Arc::new(GuidedSearchFactory::default()),
            Arc::new(objective),
            Arc::new(ResultPersister::new(dir.path())),
        );
        WorkerOrchestrator::new(
            runner,
            Arc::new(LocalCluster::new(4, cluster_gpus)),
            Arc::new(FixedDeviceProbe(0)),
        )
    }

    #[tokio::test]
    async fn plan_uses_cluster_gpus() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, RunConfig::new("t", dir.path()), 3, ok_objective);
        let plan = orch.plan(regions()).await.unwrap();

        assert_eq!(plan.parallelism.workers, 3);
        assert_eq!(plan.parallelism.source, ParallelismSource::ClusterGpus);
        assert_eq!(plan.chunk_sizes(), vec![3, 2, 3]);

        let devices: Vec<Vec<usize>> = plan
            .tasks
            .iter()
            .map(|(d, _)| d.allocation.gpu_ids.clone())
            .collect();
        assert_eq!(devices, vec![vec![0], vec![1], vec![2]]);

        let indices: Vec<usize> = plan
            .tasks
            .iter()
            .flat_map(|(d, _)| d.region_indices.clone())
            .collect();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn discovered_parallelism_is_capped() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, RunConfig::new("t", dir.path()), 32, ok_objective);
        let plan = orch.plan(regions()).await.unwrap();
        assert_eq!(plan.parallelism.workers, 8);
        assert!(plan.chunk_sizes().iter().all(|&s| s == 1));
    }

    #[tokio::test]
    async fn explicit_parallelism_above_region_count_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new("t", dir.path()).with_num_splits(9);
        let orch = orchestrator(&dir, config, 0, ok_objective);
        let err = orch.plan(regions()).await.unwrap_err();
        assert!(matches!(
            err,
            SrError::Partition(PartitionError::InvalidPartition {
                requested: 9,
                len: 8
            })
        ));
    }

    #[tokio::test]
    async fn resume_offset_skips_earlier_regions() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new("t", dir.path())
            .with_start_region(6)
            .with_num_splits(1);
        let orch = orchestrator(&dir, config, 0, ok_objective);
        let report = orch.run(regions()).await.unwrap();

        assert_eq!(report.dispatched_regions, 2);
        assert_eq!(report.completed_regions(), vec![6, 7]);
        assert!(!ResultPersister::new(dir.path()).table_path(0).exists());
    }

    #[tokio::test]
    async fn resume_past_the_end_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new("t", dir.path()).with_start_region(8);
        let orch = orchestrator(&dir, config, 2, ok_objective);
        assert!(matches!(
            orch.plan(regions()).await,
            Err(SrError::Partition(_))
        ));
    }

    #[tokio::test]
    async fn run_completes_every_region() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, RunConfig::new("t", dir.path()), 2, ok_objective);
        let report = orch.run(regions()).await.unwrap();

        assert!(report.all_succeeded());
        assert_eq!(report.chunks.len(), 2);
        assert_eq!(report.chunks[0].worker_id, "worker-0");
        assert_eq!(report.completed_regions(), (0..8).collect::<Vec<_>>());
        assert!(report.failed_regions().is_empty());
        assert_eq!(
            ResultPersister::new(dir.path()).completed_regions().unwrap().len(),
            8
        );
    }

    #[tokio::test]
    async fn panicking_chunk_does_not_stop_siblings() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new("t", dir.path()).with_num_splits(2);
        let orch = orchestrator(
            &dir,
            config,
            0,
            |p: &ParameterSet, ctx: &TrialContext<'_>| -> anyhow::Result<Metrics> {
                if ctx.region_index == 5 {
                    panic!("device lost");
                }
                ok_objective(p, ctx)
            },
        );
        let report = orch.run(regions()).await.unwrap();

        assert!(!report.all_succeeded());
        assert_eq!(report.chunks[0].status, ChunkStatus::Finished);
        assert_eq!(report.chunks[0].summary.completed, vec![0, 1, 2, 3]);

        let crashed = &report.chunks[1];
        assert_eq!(crashed.summary.completed, vec![4]);
        match &crashed.status {
            ChunkStatus::Failed { error, unprocessed } => {
                assert!(error.contains("device lost"), "{error}");
                assert_eq!(unprocessed, &vec![5, 6, 7]);
            }
            other => panic!("expected failed chunk, got {other:?}"),
        }
        assert_eq!(report.unprocessed_regions(), vec![5, 6, 7]);
        assert_eq!(report.failed_chunks().len(), 1);
    }
}
