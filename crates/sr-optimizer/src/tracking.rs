//! Experiment-tracking sink for per-trial events.
//!
//! Tracking is fire-and-forget: a tracker can never fail a trial and nothing
//! flows back from it into the search.

use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};
use sr_types::{Metrics, ParameterSet};
use tracing::{debug, info};

use crate::trial::RunId;

/// Placeholder key that leaves tracking disabled.
pub const PLACEHOLDER_KEY: &str = "insert_your_key_here";

/// Where tracking events are grouped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub project: String,
    pub group: String,
    pub api_key: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            project: "default_project".to_string(),
            group: "default_group".to_string(),
            api_key: PLACEHOLDER_KEY.to_string(),
        }
    }
}

impl TrackingConfig {
    pub fn new(
        project: impl Into<String>,
        group: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            group: group.into(),
            api_key: api_key.into(),
        }
    }

    /// Tracking only runs once a real key is configured.
    pub fn is_enabled(&self) -> bool {
        let key = self.api_key.trim();
        !key.is_empty() && key != PLACEHOLDER_KEY
    }
}

/// One completed trial, as seen by a tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialEvent {
    pub run_id: RunId,
    pub project: String,
    pub group: String,
    pub region_index: usize,
    pub trial_number: usize,
    pub trial_name: String,
    pub worker_id: String,
    pub config: ParameterSet,
    pub metrics: Metrics,
}

/// Receives trial events. Implementations must not block the caller for long
/// and must swallow their own failures.
pub trait ExperimentTracker: Send + Sync {
    fn record(&self, event: &TrialEvent);
}

/// Emits each event as a structured log line.
#[derive(Debug, Clone, Default)]
pub struct LogTracker;

impl ExperimentTracker for LogTracker {
    fn record(&self, event: &TrialEvent) {
        info!(
            target: "spaceray::tracking",
            project = %event.project,
            group = %event.group,
            region = event.region_index,
            trial = %event.trial_name,
            config = ?event.config,
            metrics = ?event.metrics,
            "trial completed"
        );
    }
}

/// Forwards events to a channel consumer (e.g. an uploader thread).
#[derive(Debug, Clone)]
pub struct ChannelTracker {
    tx: Sender<TrialEvent>,
}

impl ChannelTracker {
    pub fn new(tx: Sender<TrialEvent>) -> Self {
        Self { tx }
    }
}

impl ExperimentTracker for ChannelTracker {
    fn record(&self, event: &TrialEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(trial = %event.trial_name, "tracking channel full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(trial = %event.trial_name, "tracking receiver gone, dropping event");
            }
        }
    }
}
