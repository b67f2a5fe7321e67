//! Per-worker loop: regions of a chunk run one after another, each isolated
//! from the failures of its neighbours.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sr_types::{Metrics, ParameterSet, PersistError};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cluster::WorkerAllocation;
use crate::limiter::ConcurrencyLimiter;
use crate::persist::ResultPersister;
use crate::search::{IndexedRegion, OptimizerError, OptimizerFactory};
use crate::tracking::{ExperimentTracker, TrialEvent};
use crate::trial::{RegionResult, RegionState, RunConfig, RunId, TrialRecord};

/// Everything an objective call can see besides the proposed configuration.
#[derive(Debug, Clone, Copy)]
pub struct TrialContext<'a> {
    pub run_id: RunId,
    pub region_index: usize,
    pub trial_number: usize,
    pub trial_name: &'a str,
    pub allocation: &'a WorkerAllocation,
    /// Side-channel data from the run configuration, passed through untouched.
    pub extra_data: &'a serde_json::Value,
}

/// User-supplied function under optimization.
///
/// Returns named metrics; the run's configured metric must be among them.
pub trait Objective: Send + Sync {
    fn evaluate(&self, params: &ParameterSet, ctx: &TrialContext<'_>) -> anyhow::Result<Metrics>;
}

impl<F> Objective for F
where
    F: Fn(&ParameterSet, &TrialContext<'_>) -> anyhow::Result<Metrics> + Send + Sync,
{
    fn evaluate(&self, params: &ParameterSet, ctx: &TrialContext<'_>) -> anyhow::Result<Metrics> {
        self(params, ctx)
    }
}

/// Names a trial from `(region index, trial number)`.
pub type TrialNamer = Arc<dyn Fn(usize, usize) -> String + Send + Sync>;

pub fn default_trial_name(region_index: usize, trial_number: usize) -> String {
    format!("region{region_index}_trial{trial_number:04}")
}

pub fn default_trial_namer() -> TrialNamer {
    Arc::new(default_trial_name)
}

/// Why a single region was abandoned. Recovered by skipping the region.
#[derive(Debug, thiserror::Error)]
pub enum RegionFailure {
    #[error("optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("objective failed on trial {trial}")]
    Objective {
        trial: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("trial {trial} did not report metric {metric:?}")]
    MissingMetric { trial: String, metric: String },

    #[error("trial {trial} reported non-finite {metric:?}: {value}")]
    NonFiniteMetric {
        trial: String,
        metric: String,
        value: f64,
    },

    #[error("could not persist region results: {0}")]
    Persist(#[from] PersistError),

    #[error("optimizer refused to propose trial {trial} while saturated")]
    LimiterSaturated { trial: String },
}

/// Per-region lifecycle of one chunk, shared between the worker and the
/// orchestrator so a crashed chunk can still report what it never finished.
#[derive(Debug)]
pub struct ChunkProgress {
    states: Mutex<Vec<(usize, RegionState)>>,
}

impl ChunkProgress {
    pub fn new(region_indices: &[usize]) -> Self {
        Self {
            states: Mutex::new(
                region_indices
                    .iter()
                    .map(|&i| (i, RegionState::Pending))
                    .collect(),
            ),
        }
    }

    pub fn set(&self, region_index: usize, state: RegionState) {
        let mut states = self.states.lock();
        if let Some(entry) = states.iter_mut().find(|(i, _)| *i == region_index) {
            entry.1 = state;
        }
    }

    pub fn state(&self, region_index: usize) -> Option<RegionState> {
        self.states
            .lock()
            .iter()
            .find(|(i, _)| *i == region_index)
            .map(|(_, s)| *s)
    }

    pub fn snapshot(&self) -> Vec<(usize, RegionState)> {
        self.states.lock().clone()
    }

    /// Regions still pending or running.
    pub fn unprocessed(&self) -> Vec<usize> {
        self.states
            .lock()
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(i, _)| *i)
            .collect()
    }
}

/// Successful region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionOutcome {
    pub region_index: usize,
    pub trials: usize,
    pub best_value: Option<f64>,
}

/// What one chunk accomplished. Indices keep chunk order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub completed: Vec<usize>,
    pub failed: Vec<usize>,
}

/// Runs every region of a chunk with a fresh, sequentially driven optimizer.
///
/// Cheap to clone; the orchestrator hands one clone to each chunk task.
#[derive(Clone)]
pub struct SequentialRegionRunner {
    config: Arc<RunConfig>,
    factory: Arc<dyn OptimizerFactory>,
    objective: Arc<dyn Objective>,
    persister: Arc<ResultPersister>,
    tracker: Option<Arc<dyn ExperimentTracker>>,
    namer: TrialNamer,
}

impl SequentialRegionRunner {
    pub fn new(
        config: Arc<RunConfig>,
        factory: Arc<dyn OptimizerFactory>,
        objective: Arc<dyn Objective>,
        persister: Arc<ResultPersister>,
    ) -> Self {
        Self {
            config,
            factory,
            objective,
            persister,
            tracker: None,
            namer: default_trial_namer(),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ExperimentTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_trial_namer(mut self, namer: TrialNamer) -> Self {
        self.namer = namer;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Process `chunk` in order. A failing region is logged, marked failed and
    /// skipped; nothing is written for it.
    pub fn run_chunk(
        &self,
        chunk: &[IndexedRegion],
        allocation: &WorkerAllocation,
        progress: &ChunkProgress,
    ) -> ChunkSummary {
        info!(
            worker = %allocation.worker_id,
            chunk = allocation.chunk_id,
            regions = chunk.len(),
            devices = %allocation.visible_devices(),
            "Worker starting chunk"
        );

        let mut summary = ChunkSummary::default();
        for region in chunk {
            progress.set(region.index, RegionState::Running);
            match self.run_region(region, allocation) {
                Ok(outcome) => {
                    progress.set(region.index, RegionState::Completed);
                    info!(
                        region = region.index,
                        worker = %allocation.worker_id,
                        trials = outcome.trials,
                        best = ?outcome.best_value,
                        "Region completed"
                    );
                    summary.completed.push(region.index);
                }
                Err(failure) => {
                    progress.set(region.index, RegionState::Failed);
                    let report = anyhow::Error::new(failure);
                    error!(
                        region = region.index,
                        worker = %allocation.worker_id,
                        "Region failed, skipping: {report:#}"
                    );
                    summary.failed.push(region.index);
                }
            }
        }

        info!(
            worker = %allocation.worker_id,
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            "Worker finished chunk"
        );
        summary
    }

    /// Run the full trial budget for one region and persist its artifacts.
    pub fn run_region(
        &self,
        region: &IndexedRegion,
        allocation: &WorkerAllocation,
    ) -> Result<RegionOutcome, RegionFailure> {
        let config = &self.config;
        let optimizer = self
            .factory
            .create(&region.region, &config.optimizer_settings())?;
        let mut limiter = ConcurrencyLimiter::sequential(optimizer);

        let mut trials = Vec::with_capacity(config.trials_per_region);
        for trial_number in 0..config.trials_per_region {
            let name = (self.namer)(region.index, trial_number);
            let mut record =
                TrialRecord::new(config.id, region.index, trial_number, name, ParameterSet::new());

            record.parameters = limiter
                .suggest(record.id)?
                .ok_or_else(|| RegionFailure::LimiterSaturated {
                    trial: record.name.clone(),
                })?;
            record.mark_running(Some(allocation.worker_id.clone()));

            let ctx = TrialContext {
                run_id: config.id,
                region_index: region.index,
                trial_number,
                trial_name: &record.name,
                allocation,
                extra_data: &config.extra_data,
            };
            let evaluated = self
                .objective
                .evaluate(&record.parameters, &ctx)
                .map_err(|source| RegionFailure::Objective {
                    trial: record.name.clone(),
                    source,
                })
                .and_then(|metrics| {
                    let value = extract_metric(&metrics, &config.metric, &record.name)?;
                    Ok((metrics, value))
                });
            let (metrics, value) = match evaluated {
                Ok(evaluated) => evaluated,
                Err(failure) => {
                    limiter.abandon(record.id);
                    record.mark_failed(failure.to_string());
                    warn!(
                        region = region.index,
                        trial = %record.name,
                        status = ?record.status,
                        parameters = ?record.parameters,
                        completed = trials.len(),
                        "Trial failed"
                    );
                    return Err(failure);
                }
            };

            limiter.complete(record.id, value)?;
            record.mark_completed(metrics, value);
            debug!(
                region = region.index,
                trial = %record.name,
                value,
                "Trial completed"
            );
            self.track(&record, allocation);
            trials.push(record);
        }

        let result = RegionResult {
            region_index: region.index,
            region: region.region.clone(),
            trials,
            optimizer_state: limiter.terminal_state(),
        };
        self.persister.persist(region.index, &result)?;

        Ok(RegionOutcome {
            region_index: region.index,
            trials: result.trials.len(),
            best_value: result
                .best_trial(config.direction)
                .and_then(|t| t.objective),
        })
    }

    fn track(&self, record: &TrialRecord, allocation: &WorkerAllocation) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        let tracking = self.config.tracking.clone().unwrap_or_default();
        tracker.record(&TrialEvent {
            run_id: self.config.id,
            project: tracking.project,
            group: tracking.group,
            region_index: record.region_index,
            trial_number: record.trial_number,
            trial_name: record.name.clone(),
            worker_id: allocation.worker_id.clone(),
            config: record.parameters.clone(),
            metrics: record.metrics.clone(),
        });
    }
}

impl std::fmt::Debug for SequentialRegionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialRegionRunner")
            .field("run_id", &self.config.id)
            .field("output_dir", &self.persister.dir())
            .field("tracking", &self.tracker.is_some())
            .finish_non_exhaustive()
    }
}

fn extract_metric(metrics: &Metrics, metric: &str, trial: &str) -> Result<f64, RegionFailure> {
    let value = *metrics
        .get(metric)
        .ok_or_else(|| RegionFailure::MissingMetric {
            trial: trial.to_string(),
            metric: metric.to_string(),
        })?;
    if !value.is_finite() {
        return Err(RegionFailure::NonFiniteMetric {
            trial: trial.to_string(),
            metric: metric.to_string(),
            value,
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::WorkerResources;
    use crate::search::{GuidedSearchFactory, SearchSpace, SpaceBuilder};
    use crate::tracking::ChannelTracker;
    use crate::trial::ObjectiveDirection;
    use anyhow::anyhow;
    use crossbeam_channel::unbounded;
    use tempfile::TempDir;

    fn regions(count: usize) -> Vec<IndexedRegion> {
        let space = SearchSpace::new()
            .add_float("x", -1.0, 1.0)
            .add_float("y", -1.0, 1.0)
            .add_int("z", 0, 10);
        let mut regions = SpaceBuilder::new().build_indexed(&space).unwrap();
        regions.truncate(count);
        regions
    }

    fn allocation() -> WorkerAllocation {
        WorkerAllocation::new(0, WorkerResources::new(1.0, 0.0), 0)
    }

    type Scored = anyhow::Result<Metrics>;

    fn runner<O: Objective + 'static>(
        dir: &TempDir,
        trials: usize,
        objective: O,
    ) -> SequentialRegionRunner {
        let config = RunConfig::new("test", dir.path())
            .with_trials(trials)
            .with_initial_points(2)
            .with_objective("score", ObjectiveDirection::Maximize)
            .with_extra_data(serde_json::json!({"dataset": "toy"}));
        SequentialRegionRunner::new(
            Arc::new(config),
            Arc::new(GuidedSearchFactory::default()),
            Arc::new(objective),
            Arc::new(ResultPersister::new(dir.path())),
        )
    }

    fn score(params: &ParameterSet) -> f64 {
        let x = params["x"].as_f64().unwrap_or(0.0);
        -(x * x)
    }

    #[test]
    fn default_trial_names() {
        assert_eq!(default_trial_name(3, 7), "region3_trial0007");
        assert_eq!((default_trial_namer())(12, 10000), "region12_trial10000");
    }

    #[test]
    fn region_runs_full_trial_budget() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, 4, |p: &ParameterSet, _ctx: &TrialContext<'_>| -> Scored {
            Ok(Metrics::from([("score".to_string(), score(p))]))
        });
        let region = &regions(1)[0];

        let outcome = runner.run_region(region, &allocation()).unwrap();
        assert_eq!(outcome.region_index, 0);
        assert_eq!(outcome.trials, 4);
        assert!(outcome.best_value.is_some());

        let persister = ResultPersister::new(dir.path());
        assert_eq!(persister.load_table(0).unwrap().len(), 4);
        let checkpoint = persister.load_checkpoint(0).unwrap();
        assert_eq!(checkpoint.state.observations.len(), 4);
        assert_eq!(checkpoint.state.initial_points, 2);
    }

    #[test]
    fn objective_sees_trial_context() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, 2, |_p: &ParameterSet, ctx: &TrialContext<'_>| -> Scored {
            anyhow::ensure!(ctx.extra_data["dataset"] == "toy", "extra data missing");
            anyhow::ensure!(
                ctx.trial_name == default_trial_name(ctx.region_index, ctx.trial_number),
                "unexpected trial name {}",
                ctx.trial_name
            );
            anyhow::ensure!(ctx.allocation.worker_id == "worker-0", "wrong worker");
            Ok(Metrics::from([("score".to_string(), 1.0)]))
        });
        let region = &regions(2)[1];
        runner.run_region(region, &allocation()).unwrap();
    }

    #[test]
    fn failing_region_is_skipped_and_not_persisted() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, 3, |p: &ParameterSet, ctx: &TrialContext<'_>| -> Scored {
            if ctx.region_index == 3 {
                return Err(anyhow!("diverged"));
            }
            Ok(Metrics::from([("score".to_string(), score(p))]))
        });
        let chunk = regions(5);
        let indices: Vec<usize> = chunk.iter().map(|r| r.index).collect();
        let progress = ChunkProgress::new(&indices);

        let summary = runner.run_chunk(&chunk, &allocation(), &progress);
        assert_eq!(summary.completed, vec![0, 1, 2, 4]);
        assert_eq!(summary.failed, vec![3]);
        assert!(progress.unprocessed().is_empty());
        assert_eq!(progress.state(3), Some(RegionState::Failed));
        assert_eq!(progress.state(4), Some(RegionState::Completed));

        let persister = ResultPersister::new(dir.path());
        for index in [0, 1, 2, 4] {
            assert!(persister.table_path(index).exists());
            assert!(persister.checkpoint_path(index).exists());
        }
        assert!(!persister.table_path(3).exists());
        assert!(!persister.checkpoint_path(3).exists());
    }

    #[test]
    fn unwritable_artifacts_fail_only_their_region() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, 2, |p: &ParameterSet, _ctx: &TrialContext<'_>| -> Scored {
            Ok(Metrics::from([("score".to_string(), score(p))]))
        });
        let persister = ResultPersister::new(dir.path());
        let blocked = persister.checkpoint_path(2);
        std::fs::create_dir(&blocked).unwrap();
        std::fs::write(blocked.join("occupied"), b"x").unwrap();

        let chunk = regions(4);
        let err = runner.run_region(&chunk[2], &allocation()).unwrap_err();
        assert!(matches!(err, RegionFailure::Persist(_)));

        let progress = ChunkProgress::new(&[0, 1, 2, 3]);
        let summary = runner.run_chunk(&chunk, &allocation(), &progress);
        assert_eq!(summary.completed, vec![0, 1, 3]);
        assert_eq!(summary.failed, vec![2]);
        assert!(!persister.table_path(2).exists());
        assert!(!persister.checkpoint_path(2).is_file());
        assert!(!dir.path().join("space2.csv.tmp").exists());
        assert!(!persister.completed_regions().unwrap().contains(&2));
    }

    #[test]
    fn missing_metric_fails_region() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, 2, |_p: &ParameterSet, _ctx: &TrialContext<'_>| -> Scored {
            Ok(Metrics::from([("loss".to_string(), 0.1)]))
        });
        let err = runner.run_region(&regions(1)[0], &allocation()).unwrap_err();
        assert!(matches!(
            err,
            RegionFailure::MissingMetric { ref metric, .. } if metric == "score"
        ));
    }

    #[test]
    fn non_finite_metric_fails_region() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, 2, |_p: &ParameterSet, _ctx: &TrialContext<'_>| -> Scored {
            Ok(Metrics::from([("score".to_string(), f64::NAN)]))
        });
        let err = runner.run_region(&regions(1)[0], &allocation()).unwrap_err();
        assert!(matches!(err, RegionFailure::NonFiniteMetric { .. }));
    }

    #[test]
    fn objective_error_keeps_its_source() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, 1, |_p: &ParameterSet, _ctx: &TrialContext<'_>| -> Scored {
            Err(anyhow!("out of memory"))
        });
        let err = runner.run_region(&regions(1)[0], &allocation()).unwrap_err();
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("out of memory"));
    }

    #[test]
    fn completed_trials_reach_the_tracker() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = unbounded();
        let runner = runner(&dir, 3, |p: &ParameterSet, _ctx: &TrialContext<'_>| -> Scored {
            Ok(Metrics::from([("score".to_string(), score(p))]))
        })
        .with_tracker(Arc::new(ChannelTracker::new(tx)))
        .with_trial_namer(Arc::new(|region: usize, trial: usize| format!("r{region}-t{trial}")));

        runner.run_region(&regions(1)[0], &allocation()).unwrap();
        let events: Vec<TrialEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].trial_name, "r0-t2");
        assert_eq!(events[0].project, "default_project");
        assert!(events.iter().all(|e| e.metrics.contains_key("score")));
    }

    #[test]
    fn progress_tracks_unprocessed_regions() {
        let progress = ChunkProgress::new(&[4, 5, 6]);
        progress.set(4, RegionState::Completed);
        progress.set(5, RegionState::Running);
        assert_eq!(progress.unprocessed(), vec![5, 6]);
        progress.set(99, RegionState::Failed);
        assert_eq!(progress.snapshot().len(), 3);
    }
}
