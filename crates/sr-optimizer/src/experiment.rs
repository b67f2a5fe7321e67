//! Top-level entry point wiring bounds, regions, cluster and workers together.

use sr_types::SrResult;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::bounds::load_bounds;
use crate::cluster::{self, Cluster, ClusterConfig};
use crate::orchestrator::{RunReport, WorkerOrchestrator};
use crate::persist::ResultPersister;
use crate::resources::{DeviceProbe, SystemDeviceProbe};
use crate::runner::{default_trial_namer, Objective, SequentialRegionRunner, TrialNamer};
use crate::search::{
    GuidedSearchFactory, IndexedRegion, OptimizerFactory, SearchSpace, SpaceBuilder,
};
use crate::tracking::{ExperimentTracker, LogTracker};
use crate::trial::RunConfig;

/// One hyperparameter search over a region-partitioned space.
///
/// ```no_run
/// # async fn demo() -> sr_types::SrResult<()> {
/// use sr_optimizer::{Experiment, Metrics, ParameterSet, RunConfig, TrialContext};
///
/// let config = RunConfig::new("demo", "results").with_trials(20);
/// let report = Experiment::new(config)
///     .run_from_file(
///         "bounds.json",
///         |p: &ParameterSet, _ctx: &TrialContext<'_>| -> anyhow::Result<Metrics> {
///             let x = p["x"].as_f64().unwrap_or_default();
///             Ok(Metrics::from([("average_res".to_string(), -x * x)]))
///         },
///     )
///     .await?;
/// println!("{} regions completed", report.completed_regions().len());
/// # Ok(())
/// # }
/// ```
pub struct Experiment {
    config: RunConfig,
    cluster_config: ClusterConfig,
    cluster: Option<Arc<dyn Cluster>>,
    probe: Arc<dyn DeviceProbe>,
    factory: Arc<dyn OptimizerFactory>,
    tracker: Option<Arc<dyn ExperimentTracker>>,
    space_builder: SpaceBuilder,
    namer: TrialNamer,
}

impl Experiment {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            cluster_config: ClusterConfig::from_env(),
            cluster: None,
            probe: Arc::new(SystemDeviceProbe),
            factory: Arc::new(GuidedSearchFactory::default()),
            tracker: None,
            space_builder: SpaceBuilder::new(),
            namer: default_trial_namer(),
        }
    }

    pub fn with_cluster_config(mut self, config: ClusterConfig) -> Self {
        self.cluster_config = config;
        self
    }

    /// Use an already connected cluster instead of bootstrapping one.
    pub fn with_cluster(mut self, cluster: Arc<dyn Cluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_optimizer(mut self, factory: Arc<dyn OptimizerFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ExperimentTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_space_builder(mut self, builder: SpaceBuilder) -> Self {
        self.space_builder = builder;
        self
    }

    pub fn with_trial_namer(mut self, namer: TrialNamer) -> Self {
        self.namer = namer;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The full, ordered region list for `space`.
    pub fn regions(&self, space: &SearchSpace) -> SrResult<Vec<IndexedRegion>> {
        space.validate()?;
        Ok(self.space_builder.build_indexed(space)?)
    }

    /// First region of `space` without artifacts in the output directory;
    /// pass it to [`RunConfig::with_start_region`] to continue a run.
    pub fn resume_hint(&self, space: &SearchSpace) -> SrResult<usize> {
        let total = self.regions(space)?.len();
        Ok(ResultPersister::new(&self.config.output_dir).resume_offset(total)?)
    }

    pub async fn run_from_file<O>(
        &self,
        bounds: impl AsRef<Path>,
        objective: O,
    ) -> SrResult<RunReport>
    where
        O: Objective + 'static,
    {
        let space = load_bounds(bounds)?;
        self.run(&space, objective).await
    }

    /// Validate, split the space, bring up workers and block until every chunk
    /// has finished.
    pub async fn run<O>(&self, space: &SearchSpace, objective: O) -> SrResult<RunReport>
    where
        O: Objective + 'static,
    {
        let clock = Instant::now();
        self.config.validate()?;
        let regions = self.regions(space)?;
        info!(
            run = %self.config.name,
            run_id = %self.config.id,
            dimensions = space.parameters.len(),
            regions = regions.len(),
            trials_per_region = self.config.trials_per_region,
            metric = %self.config.metric,
            direction = ?self.config.direction,
            "Starting search"
        );

        let cluster = match &self.cluster {
            Some(cluster) => Arc::clone(cluster),
            None => cluster::connect(&self.cluster_config, self.probe.as_ref()).await,
        };

        let persister = ResultPersister::new(&self.config.output_dir);
        persister.prepare()?;

        let mut runner = SequentialRegionRunner::new(
            Arc::new(self.config.clone()),
            Arc::clone(&self.factory),
            Arc::new(objective),
            Arc::new(persister),
        )
        .with_trial_namer(Arc::clone(&self.namer));
        if let Some(tracker) = self.tracker() {
            runner = runner.with_tracker(tracker);
        }

        let orchestrator = WorkerOrchestrator::new(runner, cluster, Arc::clone(&self.probe));
        let report = orchestrator.run(regions).await?;

        info!(
            completed = report.completed_regions().len(),
            failed = report.failed_regions().len(),
            unprocessed = report.unprocessed_regions().len(),
            "Total execution time: {:.2}s",
            clock.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    fn tracker(&self) -> Option<Arc<dyn ExperimentTracker>> {
        if let Some(tracker) = &self.tracker {
            return Some(Arc::clone(tracker));
        }
        match &self.config.tracking {
            Some(tracking) if tracking.is_enabled() => Some(Arc::new(LogTracker)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use crate::resources::FixedDeviceProbe;
    use crate::runner::TrialContext;
    use crate::tracking::{ChannelTracker, TrackingConfig};
    use sr_types::{ConfigError, Metrics, ParameterSet, SrError};
    use tempfile::TempDir;

    fn sphere(p: &ParameterSet, _ctx: &TrialContext<'_>) -> anyhow::Result<Metrics> {
        let x = p["x"].as_f64().unwrap_or_default();
        let y = p["y"].as_f64().unwrap_or_default();
        Ok(Metrics::from([("average_res".to_string(), -(x * x + y * y))]))
    }

    fn space() -> SearchSpace {
        SearchSpace::new()
            .add_float("x", -2.0, 2.0)
            .add_float("y", -2.0, 2.0)
    }

    fn experiment(config: RunConfig) -> Experiment {
        Experiment::new(config.with_trials(3).with_initial_points(2))
            .with_cluster(Arc::new(LocalCluster::new(2, 0)))
            .with_probe(Arc::new(FixedDeviceProbe(0)))
    }

    #[tokio::test]
    async fn runs_every_region_end_to_end() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("results");
        let config = RunConfig::new("e2e", &out).with_num_splits(2);
        let report = experiment(config).run(&space(), sphere).await.unwrap();

        assert!(report.all_succeeded());
        assert_eq!(report.completed_regions(), vec![0, 1, 2, 3]);
        let persister = ResultPersister::new(&out);
        for index in 0..4 {
            assert_eq!(persister.load_table(index).unwrap().len(), 3);
        }
    }

    #[tokio::test]
    async fn single_worker_without_gpus() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new("fallback", dir.path());
        let report = experiment(config).run(&space(), sphere).await.unwrap();
        assert_eq!(report.parallelism.workers, 1);
        assert_eq!(report.chunks.len(), 1);
    }

    #[tokio::test]
    async fn invalid_config_fails_before_dispatch() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("never");
        let config = RunConfig::new("bad", &out).with_objective("", Default::default());
        let err = experiment(config).run(&space(), sphere).await.unwrap_err();
        assert!(matches!(err, SrError::Config(ConfigError::InvalidValue { .. })));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn runs_from_bounds_file() {
        let dir = TempDir::new().unwrap();
        let bounds = dir.path().join("bounds.json");
        std::fs::write(&bounds, r#"{"x": [-1.0, 1.0], "y": [-2, 2]}"#).unwrap();
        let config = RunConfig::new("file", dir.path().join("out"));
        let report = experiment(config)
            .run_from_file(&bounds, sphere)
            .await
            .unwrap();
        assert_eq!(report.dispatched_regions, 4);
    }

    #[tokio::test]
    async fn missing_bounds_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new("nofile", dir.path());
        let err = experiment(config)
            .run_from_file(dir.path().join("missing.json"), sphere)
            .await
            .unwrap_err();
        assert!(matches!(err, SrError::Config(ConfigError::BoundsNotFound { .. })));
    }

    #[tokio::test]
    async fn explicit_tracker_receives_every_trial() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let config = RunConfig::new("tracked", dir.path())
            .with_tracking(TrackingConfig::new("proj", "grp", "key"));
        experiment(config)
            .with_tracker(Arc::new(ChannelTracker::new(tx)))
            .run(&space(), sphere)
            .await
            .unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 4 * 3);
        assert!(events.iter().all(|e| e.project == "proj" && e.group == "grp"));
    }

    #[tokio::test]
    async fn resume_hint_points_at_first_missing_region() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new("resume", dir.path()).with_num_splits(1);
        let experiment = experiment(config);
        assert_eq!(experiment.resume_hint(&space()).unwrap(), 0);

        experiment.run(&space(), sphere).await.unwrap();
        std::fs::remove_file(ResultPersister::new(dir.path()).table_path(2)).unwrap();
        assert_eq!(experiment.resume_hint(&space()).unwrap(), 2);
    }
}
