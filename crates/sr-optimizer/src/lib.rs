//! # sr-optimizer
//!
//! Region-partitioned, distributed hyperparameter search for SpaceRay.
//!
//! A search space is split into overlapping regions, the ordered region list
//! is carved into contiguous chunks (one per worker), and every region runs its
//! own sequential optimizer. A failing region is logged and skipped; each
//! finished region leaves `space{i}.csv` and `optimizer_result{i}.json` behind
//! so an interrupted run can be resumed from a region offset.

mod bounds;
mod cluster;
mod experiment;
mod limiter;
mod orchestrator;
mod partition;
mod persist;
mod resources;
mod runner;
mod search;
mod tracking;
mod trial;

pub use bounds::{load_bounds, parse_bounds};
pub use cluster::{
    connect, try_connect, ChunkTaskDescriptor, Cluster, ClusterConfig, ClusterResources,
    LocalCluster, NodeSpec, StaticCluster, WorkerAllocation, WorkerResources, CLUSTER_ADDRESS_ENV,
};
pub use experiment::Experiment;
pub use limiter::ConcurrencyLimiter;
pub use orchestrator::{ChunkOutcome, ChunkStatus, DispatchPlan, RunReport, WorkerOrchestrator};
pub use partition::{apply_offset, chunk_sizes, split_contiguous, Chunk};
pub use persist::{
    RegionCheckpoint, ResultPersister, TrialTable, CONFIG_COLUMN_PREFIX, TRIAL_COLUMNS,
};
pub use resources::{
    DeviceProbe, FixedDeviceProbe, Parallelism, ParallelismSource, ResourceSizer, SystemDeviceProbe,
};
pub use runner::{
    default_trial_name, default_trial_namer, ChunkProgress, ChunkSummary, Objective, RegionFailure,
    RegionOutcome, SequentialRegionRunner, TrialContext, TrialNamer,
};
pub use search::{
    GuidedSearch, GuidedSearchFactory, IndexedRegion, Observation, OptimizerError,
    OptimizerFactory, OptimizerSettings, OptimizerState, ParameterDef, ParameterKind,
    RegionOptimizer, SearchRegion, SearchSpace, SpaceBuilder,
};
pub use tracking::{
    ChannelTracker, ExperimentTracker, LogTracker, TrackingConfig, TrialEvent, PLACEHOLDER_KEY,
};
pub use trial::{
    ObjectiveDirection, RegionResult, RegionState, RunConfig, RunId, TrialRecord, TrialStatus,
};

pub use sr_types::{Metrics, ParameterSet, ParameterValue};
