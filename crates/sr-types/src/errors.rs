use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the SpaceRay system
#[derive(Error, Debug)]
pub enum SrError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while loading bounds or validating run configuration.
/// Always fatal: nothing is dispatched after one of these.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Bounds file not found: {path}")]
    BoundsNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed bounds file {path}: {message}")]
    MalformedBounds { path: PathBuf, message: String },

    #[error("Invalid bound for {name}: {message}")]
    InvalidBound { name: String, message: String },

    #[error("Duplicate hyperparameter name: {name}")]
    DuplicateName { name: String },

    #[error("Search space has no hyperparameters")]
    EmptySpace,

    #[error("Search space expands to more than {limit} regions")]
    TooManyRegions { limit: usize },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Invalid parallelism request for the chunk partitioner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Cannot split {len} regions into {requested} non-empty contiguous chunks")]
    InvalidPartition { requested: usize, len: usize },
}

/// Cluster bootstrap and resource query failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("Cluster at {address} unreachable: {message}")]
    Unreachable { address: String, message: String },

    #[error("Cluster connection timed out after {timeout_ms} ms: {address}")]
    Timeout { address: String, timeout_ms: u64 },

    #[error("Cluster inventory is empty")]
    EmptyInventory,

    #[error("Cluster resource query failed: {message}")]
    QueryFailed { message: String },
}

/// Failures writing or reading per-region artifacts.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error on {path}: {message}")]
    Csv { path: PathBuf, message: String },

    #[error("Checkpoint error on {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },
}

impl PersistError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for SpaceRay operations
pub type SrResult<T> = Result<T, SrError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SrError::Config($crate::ConfigError::Other(format!($($arg)*)))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SrError::Internal(format!($($arg)*))
    };
}
