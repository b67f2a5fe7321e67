//! Run configuration, trial tracking and per-region results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sr_types::{ConfigError, Metrics, ParameterSet};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::cluster::WorkerResources;
use crate::search::{OptimizerSettings, OptimizerState, SearchRegion};
use crate::tracking::TrackingConfig;

/// Unique run identifier.
pub type RunId = Uuid;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ObjectiveDirection {
    #[default]
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    /// True when `candidate` is strictly better than `incumbent`.
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }
}

impl FromStr for ObjectiveDirection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "max" | "maximize" => Ok(Self::Maximize),
            "min" | "minimize" => Ok(Self::Minimize),
            other => Err(ConfigError::InvalidValue {
                field: "direction".to_string(),
                message: format!("expected \"max\" or \"min\", got {other:?}"),
            }),
        }
    }
}

/// Resolved configuration for one top-level invocation.
///
/// Passed by value (behind an `Arc`) to every component that needs it; nothing
/// reads parallelism or resource settings from process-wide state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub id: RunId,
    pub name: String,

    /// Metric name to optimize; must be present in every objective report.
    pub metric: String,

    /// Direction of optimization.
    pub direction: ObjectiveDirection,

    /// Trial budget for each region.
    pub trials_per_region: usize,

    /// Resources reserved by each worker for its whole chunk.
    pub worker_resources: WorkerResources,

    /// Directory receiving `space{i}.csv` and `optimizer_result{i}.json`.
    pub output_dir: PathBuf,

    /// Skip regions with an index below this offset.
    pub start_region: Option<usize>,

    /// Explicit number of workers; overrides resource discovery.
    pub num_splits: Option<usize>,

    /// Seed handed to every region's optimizer.
    pub seed: u64,

    /// Exploration-only samples before guided sampling starts.
    pub initial_points: usize,

    pub tracking: Option<TrackingConfig>,

    /// Opaque side-channel data forwarded to every objective call.
    pub extra_data: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

impl RunConfig {
    pub const DEFAULT_METRIC: &'static str = "average_res";
    pub const DEFAULT_INITIAL_POINTS: usize = 10;

    pub fn new(name: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            metric: Self::DEFAULT_METRIC.to_string(),
            direction: ObjectiveDirection::Maximize,
            trials_per_region: 10,
            worker_resources: WorkerResources::default(),
            output_dir: output_dir.into(),
            start_region: None,
            num_splits: None,
            seed: 0,
            initial_points: Self::DEFAULT_INITIAL_POINTS,
            tracking: None,
            extra_data: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_trials(mut self, n: usize) -> Self {
        self.trials_per_region = n;
        self
    }

    pub fn with_objective(mut self, metric: &str, direction: ObjectiveDirection) -> Self {
        self.metric = metric.to_string();
        self.direction = direction;
        self
    }

    pub fn with_resources(mut self, resources: WorkerResources) -> Self {
        self.worker_resources = resources;
        self
    }

    pub fn with_start_region(mut self, offset: usize) -> Self {
        self.start_region = Some(offset);
        self
    }

    pub fn with_num_splits(mut self, n: usize) -> Self {
        self.num_splits = Some(n);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_initial_points(mut self, n: usize) -> Self {
        self.initial_points = n;
        self
    }

    pub fn with_tracking(mut self, tracking: TrackingConfig) -> Self {
        self.tracking = Some(tracking);
        self
    }

    pub fn with_extra_data(mut self, data: serde_json::Value) -> Self {
        self.extra_data = data;
        self
    }

    /// Settings handed to the optimizer factory for every region.
    pub fn optimizer_settings(&self) -> OptimizerSettings {
        OptimizerSettings {
            seed: self.seed,
            initial_points: self.initial_points,
            direction: self.direction,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, message: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.to_string(),
        };
        if self.metric.trim().is_empty() {
            return Err(invalid("metric", "must not be empty"));
        }
        if self.trials_per_region == 0 {
            return Err(invalid("trials_per_region", "must be at least 1"));
        }
        if self.num_splits == Some(0) {
            return Err(invalid("num_splits", "must be at least 1 when set"));
        }
        self.worker_resources.validate()?;
        Ok(())
    }
}

/// Lifecycle state of one region inside a chunk. There is no retry state: a
/// failed region stays failed for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RegionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

// ---------------------------------------------------------------------------
// Individual trial
// ---------------------------------------------------------------------------

/// A single trial (one configuration evaluated by the objective).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: Uuid,
    pub run_id: RunId,
    pub region_index: usize,
    pub trial_number: usize,
    pub name: String,
    pub parameters: ParameterSet,
    pub status: TrialStatus,
    pub metrics: Metrics,
    pub objective: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub error: Option<String>,
}

impl TrialRecord {
    pub fn new(
        run_id: RunId,
        region_index: usize,
        trial_number: usize,
        name: String,
        parameters: ParameterSet,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            region_index,
            trial_number,
            name,
            parameters,
            status: TrialStatus::Pending,
            metrics: Metrics::new(),
            objective: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            worker_id: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self, worker_id: Option<String>) {
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
        self.worker_id = worker_id;
    }

    pub fn mark_completed(&mut self, metrics: Metrics, objective: f64) {
        self.status = TrialStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.metrics = metrics;
        self.objective = Some(objective);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Everything produced by one fully processed region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionResult {
    pub region_index: usize,
    pub region: SearchRegion,
    pub trials: Vec<TrialRecord>,
    pub optimizer_state: OptimizerState,
}

impl RegionResult {
    /// Best completed trial according to `direction`.
    pub fn best_trial(&self, direction: ObjectiveDirection) -> Option<&TrialRecord> {
        let mut best: Option<&TrialRecord> = None;
        for trial in &self.trials {
            let Some(value) = trial.objective else {
                continue;
            };
            let dominated = match best.and_then(|b| b.objective) {
                None => true,
                Some(current_best) => direction.improves(value, current_best),
            };
            if dominated {
                best = Some(trial);
            }
        }
        best
    }
}
