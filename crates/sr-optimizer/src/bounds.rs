//! Bounds file loading.
//!
//! The file is a JSON object mapping each hyperparameter name to its range.
//! Key order is kept and becomes the dimension order of every region:
//!
//! ```json
//! {
//!   "learning_rate": [1e-5, 1e-1, "log-uniform"],
//!   "momentum": [0.0, 0.99],
//!   "layers": [1, 8],
//!   "activation": ["relu", "tanh", "gelu"]
//! }
//! ```
//!
//! A pair of integers is an integer range, a numeric pair with any float is a
//! real range, a numeric pair followed by `"log-uniform"` or `"uniform"` sets
//! the prior, and any other list is a set of categorical choices. A name that
//! appears twice is rejected rather than silently overwritten.

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::Value;
use sr_types::ConfigError;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::search::{ParameterDef, ParameterKind, SearchSpace};

const LOG_UNIFORM: &str = "log-uniform";
const UNIFORM: &str = "uniform";

/// Read and validate a bounds file.
pub fn load_bounds(path: impl AsRef<Path>) -> Result<SearchSpace, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::BoundsNotFound {
        path: path.to_path_buf(),
        source,
    })?;
    let space = parse_with_path(&text, path)?;
    info!(
        path = %path.display(),
        dimensions = space.parameters.len(),
        "Loaded search bounds"
    );
    Ok(space)
}

/// Parse and validate bounds from a JSON string.
pub fn parse_bounds(text: &str) -> Result<SearchSpace, ConfigError> {
    parse_with_path(text, Path::new("<inline>"))
}

fn parse_with_path(text: &str, path: &Path) -> Result<SearchSpace, ConfigError> {
    let malformed = |message: String| ConfigError::MalformedBounds {
        path: PathBuf::from(path),
        message,
    };

    let BoundEntries(entries) =
        serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;

    let parameters = entries
        .into_iter()
        .map(|(name, value)| parse_entry(name, value))
        .collect::<Result<Vec<_>, _>>()?;

    let space = SearchSpace { parameters };
    space.validate()?;
    Ok(space)
}

/// Top-level entries in file order, duplicates included.
struct BoundEntries(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for BoundEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = BoundEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of name -> range")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<BoundEntries, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, Value>()? {
                    entries.push(entry);
                }
                Ok(BoundEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

fn parse_entry(name: String, value: Value) -> Result<ParameterDef, ConfigError> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(ConfigError::InvalidBound {
                name,
                message: format!("expected a list, got {other}"),
            })
        }
    };

    let kind = match items.as_slice() {
        [low, high] if low.is_number() && high.is_number() => {
            numeric_range(&name, low, high, None)?
        }
        [low, high, Value::String(prior)] if low.is_number() && high.is_number() => {
            numeric_range(&name, low, high, Some(prior.as_str()))?
        }
        _ => ParameterKind::Choice { values: items },
    };
    Ok(ParameterDef { name, kind })
}

fn numeric_range(
    name: &str,
    low: &Value,
    high: &Value,
    prior: Option<&str>,
) -> Result<ParameterKind, ConfigError> {
    let as_float = |v: &Value| {
        v.as_f64().ok_or_else(|| ConfigError::InvalidBound {
            name: name.to_string(),
            message: format!("{v} is not representable as a float"),
        })
    };

    match prior {
        Some(LOG_UNIFORM) => Ok(ParameterKind::LogUniform {
            low: as_float(low)?,
            high: as_float(high)?,
        }),
        None | Some(UNIFORM) => match (low.as_i64(), high.as_i64()) {
            (Some(low), Some(high)) => Ok(ParameterKind::IntRange { low, high }),
            _ => Ok(ParameterKind::FloatRange {
                low: as_float(low)?,
                high: as_float(high)?,
            }),
        },
        Some(other) => Err(ConfigError::InvalidBound {
            name: name.to_string(),
            message: format!(
                "unknown prior {other:?}, expected \"{LOG_UNIFORM}\" or \"{UNIFORM}\""
            ),
        }),
    }
}
