//! Durable per-region artifacts: the trial table and the optimizer checkpoint.
//!
//! Region `i` owns `space{i}.csv` and `optimizer_result{i}.json` in the run's
//! output directory. Indices are disjoint across workers, so writers never
//! contend for a file. Both files go to a temporary sibling first and are
//! renamed into place, so a crash never leaves a half-written artifact under
//! the final name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sr_types::PersistError;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::search::{OptimizerState, SearchRegion};
use crate::trial::RegionResult;

const TABLE_PREFIX: &str = "space";
const TABLE_EXT: &str = "csv";
const CHECKPOINT_PREFIX: &str = "optimizer_result";
const CHECKPOINT_EXT: &str = "json";

/// Fixed leading columns of every trial table.
pub const TRIAL_COLUMNS: [&str; 7] = [
    "trial_id",
    "trial_name",
    "trial_number",
    "worker_id",
    "started_at",
    "finished_at",
    "duration_secs",
];

/// Prefix of the per-parameter columns.
pub const CONFIG_COLUMN_PREFIX: &str = "config/";

/// Contents of `optimizer_result{i}.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionCheckpoint {
    pub region_index: usize,
    pub region: SearchRegion,
    pub state: OptimizerState,
    pub written_at: DateTime<Utc>,
}

/// A trial table read back from disk. Cells are kept as text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrialTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TrialTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All cells of the named column, in row order.
    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.headers.iter().position(|h| h == name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).map(String::as_str).unwrap_or(""))
                .collect(),
        )
    }
}

/// Writes and reads region artifacts under one output directory.
#[derive(Debug, Clone)]
pub struct ResultPersister {
    dir: PathBuf,
}

impl ResultPersister {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the output directory. An existing directory is reused and its
    /// artifacts will be overwritten region by region.
    pub fn prepare(&self) -> Result<(), PersistError> {
        if self.dir.is_dir() {
            warn!(
                dir = %self.dir.display(),
                "Output directory already exists; results for re-run regions will be overwritten"
            );
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(|e| PersistError::io(&self.dir, e))?;
        info!(dir = %self.dir.display(), "Created output directory");
        Ok(())
    }

    pub fn table_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{TABLE_PREFIX}{index}.{TABLE_EXT}"))
    }

    pub fn checkpoint_path(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("{CHECKPOINT_PREFIX}{index}.{CHECKPOINT_EXT}"))
    }

    /// Write both artifacts for a finished region.
    ///
    /// Both files are staged before either is renamed into place. On any
    /// failure neither artifact is left under its final name.
    pub fn persist(&self, index: usize, result: &RegionResult) -> Result<(), PersistError> {
        let table = self.table_path(index);
        let checkpoint_path = self.checkpoint_path(index);
        let table_tmp = staging_path(&table);
        let checkpoint_tmp = staging_path(&checkpoint_path);

        let checkpoint = RegionCheckpoint {
            region_index: index,
            region: result.region.clone(),
            state: result.optimizer_state.clone(),
            written_at: Utc::now(),
        };
        let staged = write_table(&table_tmp, result)
            .and_then(|()| write_checkpoint(&checkpoint_tmp, &checkpoint));
        if let Err(e) = staged {
            discard(&[&table_tmp, &checkpoint_tmp]);
            return Err(e);
        }

        if let Err(e) = fs::rename(&table_tmp, &table) {
            discard(&[&table_tmp, &checkpoint_tmp]);
            return Err(PersistError::io(&table, e));
        }
        if let Err(e) = fs::rename(&checkpoint_tmp, &checkpoint_path) {
            discard(&[&table, &checkpoint_tmp]);
            return Err(PersistError::io(&checkpoint_path, e));
        }

        debug!(
            region = index,
            trials = result.trials.len(),
            table = %table.display(),
            "Persisted region artifacts"
        );
        Ok(())
    }

    pub fn load_table(&self, index: usize) -> Result<TrialTable, PersistError> {
        let path = self.table_path(index);
        let csv_error = |e: csv::Error| PersistError::Csv {
            path: path.clone(),
            message: e.to_string(),
        };

        let file = fs::File::open(&path).map_err(|e| PersistError::io(&path, e))?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
        let headers = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(TrialTable { headers, rows })
    }

    pub fn load_checkpoint(&self, index: usize) -> Result<RegionCheckpoint, PersistError> {
        let path = self.checkpoint_path(index);
        let file = fs::File::open(&path).map_err(|e| PersistError::io(&path, e))?;
        serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| {
            PersistError::Checkpoint {
                path: path.clone(),
                message: e.to_string(),
            }
        })
    }

    /// Indices that have both a trial table and a checkpoint on disk.
    pub fn completed_regions(&self) -> Result<BTreeSet<usize>, PersistError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(PersistError::io(&self.dir, e)),
        };

        let mut tables = BTreeSet::new();
        let mut checkpoints = HashSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| PersistError::io(&self.dir, e))?;
            if !entry.file_type().is_ok_and(|t| t.is_file()) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(index) = parse_artifact(name, TABLE_PREFIX, TABLE_EXT) {
                tables.insert(index);
            } else if let Some(index) = parse_artifact(name, CHECKPOINT_PREFIX, CHECKPOINT_EXT) {
                checkpoints.insert(index);
            }
        }
        tables.retain(|index| checkpoints.contains(index));
        Ok(tables)
    }

    /// Smallest index in `[0, total)` without artifacts, or `total` when every
    /// region is done. Feed it back as the run's `start_region` to resume.
    pub fn resume_offset(&self, total: usize) -> Result<usize, PersistError> {
        let done = self.completed_regions()?;
        Ok((0..total).find(|i| !done.contains(i)).unwrap_or(total))
    }
}

/// `space12.csv` -> `Some(12)`.
fn parse_artifact(file_name: &str, prefix: &str, ext: &str) -> Option<usize> {
    let stem = file_name.strip_prefix(prefix)?.strip_suffix(ext)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn discard(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "Could not remove partial artifact: {e}");
            }
        }
    }
}

fn write_checkpoint(path: &Path, checkpoint: &RegionCheckpoint) -> Result<(), PersistError> {
    let file = fs::File::create(path).map_err(|e| PersistError::io(path, e))?;
    serde_json::to_writer_pretty(file, checkpoint).map_err(|e| PersistError::Checkpoint {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn write_table(path: &Path, result: &RegionResult) -> Result<(), PersistError> {
    let csv_error = |e: csv::Error| PersistError::Csv {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let metric_names: BTreeSet<&str> = result
        .trials
        .iter()
        .flat_map(|t| t.metrics.keys().map(String::as_str))
        .collect();
    let param_names = result.region.names();

    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;

    let mut header: Vec<String> = TRIAL_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend(metric_names.iter().map(|m| m.to_string()));
    header.extend(param_names.iter().map(|p| format!("{CONFIG_COLUMN_PREFIX}{p}")));
    writer.write_record(&header).map_err(csv_error)?;

    for trial in &result.trials {
        let mut row = vec![
            trial.id.to_string(),
            trial.name.clone(),
            trial.trial_number.to_string(),
            trial.worker_id.clone().unwrap_or_default(),
            trial.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            trial.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            trial
                .duration_seconds()
                .map(|d| d.to_string())
                .unwrap_or_default(),
        ];
        row.extend(metric_names.iter().map(|m| {
            trial
                .metrics
                .get(*m)
                .map(|v| v.to_string())
                .unwrap_or_default()
        }));
        row.extend(param_names.iter().map(|p| {
            trial
                .parameters
                .get(*p)
                .map(|v| v.to_string())
                .unwrap_or_default()
        }));
        writer.write_record(&row).map_err(csv_error)?;
    }

    writer
        .flush()
        .map_err(|e| PersistError::io(path, e))
}
