//! Search space definitions, region construction and the per-region optimizer seam.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sr_types::{ConfigError, ParameterSet, ParameterValue};
use std::collections::HashSet;

use crate::trial::ObjectiveDirection;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Human-readable parameter name (e.g. "learning_rate").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

impl ParameterDef {
    /// Checks the range invariants for this dimension.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidBound {
            name: self.name.clone(),
            message,
        };
        match &self.kind {
            ParameterKind::FloatRange { low, high } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(invalid(format!("non-finite range [{low}, {high}]")));
                }
                if low > high {
                    return Err(invalid(format!("low {low} is above high {high}")));
                }
                if !(high - low).is_finite() {
                    return Err(invalid(format!("width of [{low}, {high}] overflows")));
                }
            }
            ParameterKind::IntRange { low, high } => {
                if low > high {
                    return Err(invalid(format!("low {low} is above high {high}")));
                }
                if high.checked_sub(*low).is_none() {
                    return Err(invalid(format!("width of [{low}, {high}] overflows")));
                }
            }
            ParameterKind::LogUniform { low, high } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(invalid(format!("non-finite range [{low}, {high}]")));
                }
                if *low <= 0.0 {
                    return Err(invalid(format!("log-uniform low must be positive, got {low}")));
                }
                if low > high {
                    return Err(invalid(format!("low {low} is above high {high}")));
                }
            }
            ParameterKind::Choice { values } => {
                if values.is_empty() {
                    return Err(invalid("no categorical choices".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    /// Parameter names in definition order.
    pub fn names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }

    /// Checks every dimension and that names are unique.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parameters.is_empty() {
            return Err(ConfigError::EmptySpace);
        }
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    name: param.name.clone(),
                });
            }
            param.validate()?;
        }
        Ok(())
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Regions
// ---------------------------------------------------------------------------

/// A hyper-rectangular subregion of the full space: one narrowed sub-range per
/// bound, in the same order as the space it was carved from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRegion {
    pub parameters: Vec<ParameterDef>,
}

impl SearchRegion {
    pub fn names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn dimensions(&self) -> usize {
        self.parameters.len()
    }
}

/// A region together with its position in the full region ordering. The index
/// names the region's artifacts and is what a resume offset refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRegion {
    pub index: usize,
    pub region: SearchRegion,
}

/// Expands a [`SearchSpace`] into the ordered list of regions explored
/// independently by workers.
///
/// Every ordered dimension is halved into a lower and an upper sub-range that
/// overlap by `overlap` of the dimension's width. Categorical dimensions are
/// split into two halves of their choice list. Dimensions that cannot be split
/// (a single value or single choice) contribute one sub-range, as do integer
/// ranges too narrow for their halves to differ. Regions are the
/// cartesian product of the per-dimension sub-ranges with the first dimension
/// varying slowest, so a space of `d` splittable dimensions yields `2^d` regions.
#[derive(Debug, Clone)]
pub struct SpaceBuilder {
    overlap: f64,
    max_regions: usize,
}

impl SpaceBuilder {
    pub const DEFAULT_OVERLAP: f64 = 0.25;
    pub const DEFAULT_MAX_REGIONS: usize = 1 << 16;

    pub fn new() -> Self {
        Self {
            overlap: Self::DEFAULT_OVERLAP,
            max_regions: Self::DEFAULT_MAX_REGIONS,
        }
    }

    pub fn with_overlap(mut self, overlap: f64) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_max_regions(mut self, max_regions: usize) -> Self {
        self.max_regions = max_regions;
        self
    }

    /// Builds the full ordered region list.
    pub fn build(&self, space: &SearchSpace) -> Result<Vec<SearchRegion>, ConfigError> {
        space.validate()?;
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(ConfigError::InvalidValue {
                field: "overlap".to_string(),
                message: format!("must be in [0, 1), got {}", self.overlap),
            });
        }

        let axes: Vec<Vec<ParameterDef>> = space
            .parameters
            .iter()
            .map(|param| self.split(param))
            .collect();

        let total = axes
            .iter()
            .try_fold(1usize, |acc, axis| acc.checked_mul(axis.len()))
            .filter(|total| *total <= self.max_regions)
            .ok_or(ConfigError::TooManyRegions {
                limit: self.max_regions,
            })?;

        // Cartesian product, first axis slowest
        let mut regions: Vec<Vec<ParameterDef>> = vec![Vec::with_capacity(axes.len())];
        for axis in &axes {
            let mut next = Vec::with_capacity(regions.len() * axis.len());
            for existing in &regions {
                for piece in axis {
                    let mut combo = existing.clone();
                    combo.push(piece.clone());
                    next.push(combo);
                }
            }
            regions = next;
        }
        debug_assert_eq!(regions.len(), total);

        Ok(regions
            .into_iter()
            .map(|parameters| SearchRegion { parameters })
            .collect())
    }

    /// Builds the region list and assigns each region its durable index.
    pub fn build_indexed(&self, space: &SearchSpace) -> Result<Vec<IndexedRegion>, ConfigError> {
        Ok(self
            .build(space)?
            .into_iter()
            .enumerate()
            .map(|(index, region)| IndexedRegion { index, region })
            .collect())
    }

    fn split(&self, param: &ParameterDef) -> Vec<ParameterDef> {
        let mut pieces: Vec<ParameterKind> = match &param.kind {
            ParameterKind::FloatRange { low, high } if low < high => {
                let [(a, b), (c, d)] = split_interval(*low, *high, self.overlap);
                vec![
                    ParameterKind::FloatRange { low: a, high: b },
                    ParameterKind::FloatRange { low: c, high: d },
                ]
            }
            ParameterKind::LogUniform { low, high } if low < high => {
                // Endpoints are kept exact rather than round-tripped through ln/exp
                let [(_, b), (c, _)] = split_interval(low.ln(), high.ln(), self.overlap);
                vec![
                    ParameterKind::LogUniform {
                        low: *low,
                        high: b.exp().min(*high),
                    },
                    ParameterKind::LogUniform {
                        low: c.exp().max(*low),
                        high: *high,
                    },
                ]
            }
            ParameterKind::IntRange { low, high } if low < high => {
                let [(_, b), (c, _)] = split_interval(*low as f64, *high as f64, self.overlap);
                vec![
                    ParameterKind::IntRange {
                        low: *low,
                        high: (b.ceil() as i64).min(*high),
                    },
                    ParameterKind::IntRange {
                        low: (c.floor() as i64).max(*low),
                        high: *high,
                    },
                ]
            }
            ParameterKind::Choice { values } if values.len() >= 2 => {
                let half = (values.len() + 1) / 2;
                vec![
                    ParameterKind::Choice {
                        values: values[..half].to_vec(),
                    },
                    ParameterKind::Choice {
                        values: values[half..].to_vec(),
                    },
                ]
            }
            other => vec![other.clone()],
        };
        pieces.dedup();

        pieces
            .into_iter()
            .map(|kind| ParameterDef {
                name: param.name.clone(),
                kind,
            })
            .collect()
    }
}

impl Default for SpaceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lower and upper halves of `[low, high]`, each padded past the midpoint by
/// half of `overlap * width`.
fn split_interval(low: f64, high: f64, overlap: f64) -> [(f64, f64); 2] {
    let width = high - low;
    let mid = low + width / 2.0;
    let pad = width * overlap / 2.0;
    [(low, (mid + pad).min(high)), ((mid - pad).max(low), high)]
}

// ---------------------------------------------------------------------------
// Optimizer seam
// ---------------------------------------------------------------------------

/// Errors surfaced by region optimizers.
#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("region has no dimensions")]
    EmptyRegion,
    #[error("invalid dimension {name}: {message}")]
    InvalidDimension { name: String, message: String },
    #[error("trial {trial_id} is not in flight")]
    UnknownTrial { trial_id: uuid::Uuid },
    #[error("cannot resume a {expected} optimizer from a {found} checkpoint")]
    IncompatibleState { expected: String, found: String },
    #[error("optimizer failure: {message}")]
    Internal { message: String },
}

/// Settings shared by every optimizer constructed for a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub seed: u64,
    /// Exploration-only samples drawn before guided sampling starts.
    pub initial_points: usize,
    pub direction: ObjectiveDirection,
}

/// A single observed (configuration, metric) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub parameters: ParameterSet,
    pub value: f64,
}

/// Terminal internal state of an optimizer, written next to a region's trial
/// table so the region can be continued later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub optimizer: String,
    pub seed: u64,
    pub initial_points: usize,
    pub direction: ObjectiveDirection,
    pub asked: usize,
    pub observations: Vec<Observation>,
    pub best: Option<Observation>,
    /// Optimizer-specific state that does not fit the common fields.
    #[serde(default)]
    pub internal: serde_json::Value,
}

/// Stateful black-box optimizer scoped to one region. Not safe for concurrent
/// proposals; callers serialize access through a [`crate::ConcurrencyLimiter`].
pub trait RegionOptimizer: Send {
    /// Propose the next configuration to evaluate.
    fn ask(&mut self) -> Result<ParameterSet, OptimizerError>;

    /// Report the observed metric for a configuration previously proposed.
    fn tell(&mut self, params: &ParameterSet, value: f64) -> Result<(), OptimizerError>;

    /// Snapshot of the optimizer's internal state.
    fn terminal_state(&self) -> OptimizerState;

    /// Human-readable optimizer name.
    fn name(&self) -> &str;
}

/// Builds a fresh optimizer for each region.
pub trait OptimizerFactory: Send + Sync {
    fn create(
        &self,
        region: &SearchRegion,
        settings: &OptimizerSettings,
    ) -> Result<Box<dyn RegionOptimizer>, OptimizerError>;
}

impl<F> OptimizerFactory for F
where
    F: Fn(&SearchRegion, &OptimizerSettings) -> Result<Box<dyn RegionOptimizer>, OptimizerError>
        + Send
        + Sync,
{
    fn create(
        &self,
        region: &SearchRegion,
        settings: &OptimizerSettings,
    ) -> Result<Box<dyn RegionOptimizer>, OptimizerError> {
        self(region, settings)
    }
}

// ---- Guided search ----

/// Default region optimizer.
///
/// The first `initial_points` proposals are uniform samples over the region,
/// drawn from a `ChaCha8Rng` seeded with the run seed so every region starts
/// from a reproducible warm-up. After that, each proposal either perturbs the
/// best observation so far (probability `1 - exploration_weight`) or explores.
#[derive(Debug, Clone)]
pub struct GuidedSearch {
    region: SearchRegion,
    settings: OptimizerSettings,
    exploration_weight: f64,
    rng: ChaCha8Rng,
    observations: Vec<Observation>,
    asked: usize,
}

impl GuidedSearch {
    pub const NAME: &'static str = "guided";
    pub const DEFAULT_EXPLORATION_WEIGHT: f64 = 0.2;

    pub fn new(region: SearchRegion, settings: OptimizerSettings) -> Result<Self, OptimizerError> {
        Self::check_region(&region)?;
        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(settings.seed),
            region,
            settings,
            exploration_weight: Self::DEFAULT_EXPLORATION_WEIGHT,
            observations: Vec::new(),
            asked: 0,
        })
    }

    pub fn with_exploration_weight(mut self, weight: f64) -> Self {
        self.exploration_weight = weight.clamp(0.0, 1.0);
        self
    }

    /// Continue from a checkpoint written by [`RegionOptimizer::terminal_state`].
    pub fn resume(region: SearchRegion, state: OptimizerState) -> Result<Self, OptimizerError> {
        if state.optimizer != Self::NAME {
            return Err(OptimizerError::IncompatibleState {
                expected: Self::NAME.to_string(),
                found: state.optimizer,
            });
        }
        Self::check_region(&region)?;
        let settings = OptimizerSettings {
            seed: state.seed,
            initial_points: state.initial_points,
            direction: state.direction,
        };
        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(state.seed.wrapping_add(state.asked as u64)),
            region,
            settings,
            exploration_weight: Self::DEFAULT_EXPLORATION_WEIGHT,
            observations: state.observations,
            asked: state.asked,
        })
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Best observation so far according to the configured direction.
    pub fn best(&self) -> Option<&Observation> {
        self.observations.iter().reduce(|best, candidate| {
            if self.settings.direction.improves(candidate.value, best.value) {
                candidate
            } else {
                best
            }
        })
    }

    fn check_region(region: &SearchRegion) -> Result<(), OptimizerError> {
        if region.parameters.is_empty() {
            return Err(OptimizerError::EmptyRegion);
        }
        for param in &region.parameters {
            param
                .validate()
                .map_err(|e| OptimizerError::InvalidDimension {
                    name: param.name.clone(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn explore(&mut self) -> ParameterSet {
        let mut params = ParameterSet::new();
        for param in &self.region.parameters {
            params.insert(param.name.clone(), sample_uniform(&mut self.rng, &param.kind));
        }
        params
    }

    /// Exploitation: perturb the best-known point.
    fn exploit(&mut self) -> ParameterSet {
        let base = match self.best().map(|best| best.parameters.clone()) {
            Some(base) => base,
            None => return self.explore(),
        };

        let mut perturbed = ParameterSet::new();
        for param in &self.region.parameters {
            let value = match (&param.kind, base.get(&param.name)) {
                (ParameterKind::FloatRange { low, high }, Some(ParameterValue::Float(v))) => {
                    let noise = self.rng.gen_range(-0.1..=0.1) * (high - low);
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterKind::IntRange { low, high }, Some(ParameterValue::Int(v))) => {
                    let width = high.saturating_sub(*low) as f64;
                    let span = (width * 0.1).ceil().max(1.0) as i64;
                    let delta = self.rng.gen_range(-span..=span);
                    ParameterValue::Int(v.saturating_add(delta).clamp(*low, *high))
                }
                (ParameterKind::LogUniform { low, high }, Some(ParameterValue::Float(v))) => {
                    let log_range = high.ln() - low.ln();
                    let noise = self.rng.gen_range(-0.1..=0.1) * log_range;
                    ParameterValue::Float((v.ln() + noise).exp().clamp(*low, *high))
                }
                // Choices and missing bases fall back to a fresh sample
                (kind, _) => sample_uniform(&mut self.rng, kind),
            };
            perturbed.insert(param.name.clone(), value);
        }
        perturbed
    }
}

impl RegionOptimizer for GuidedSearch {
    fn ask(&mut self) -> Result<ParameterSet, OptimizerError> {
        let warming_up = self.asked < self.settings.initial_points || self.observations.is_empty();
        let params = if warming_up || self.rng.gen::<f64>() < self.exploration_weight {
            self.explore()
        } else {
            self.exploit()
        };
        self.asked += 1;
        Ok(params)
    }

    fn tell(&mut self, params: &ParameterSet, value: f64) -> Result<(), OptimizerError> {
        if !value.is_finite() {
            return Err(OptimizerError::Internal {
                message: format!("non-finite observation {value}"),
            });
        }
        self.observations.push(Observation {
            parameters: params.clone(),
            value,
        });
        Ok(())
    }

    fn terminal_state(&self) -> OptimizerState {
        OptimizerState {
            optimizer: Self::NAME.to_string(),
            seed: self.settings.seed,
            initial_points: self.settings.initial_points,
            direction: self.settings.direction,
            asked: self.asked,
            observations: self.observations.clone(),
            best: self.best().cloned(),
            internal: serde_json::json!({ "exploration_weight": self.exploration_weight }),
        }
    }

    fn name(&self) -> &str {
        Self::NAME
    }
}

/// Factory producing a [`GuidedSearch`] per region.
#[derive(Debug, Clone)]
pub struct GuidedSearchFactory {
    pub exploration_weight: f64,
}

impl Default for GuidedSearchFactory {
    fn default() -> Self {
        Self {
            exploration_weight: GuidedSearch::DEFAULT_EXPLORATION_WEIGHT,
        }
    }
}

impl OptimizerFactory for GuidedSearchFactory {
    fn create(
        &self,
        region: &SearchRegion,
        settings: &OptimizerSettings,
    ) -> Result<Box<dyn RegionOptimizer>, OptimizerError> {
        let search = GuidedSearch::new(region.clone(), *settings)?
            .with_exploration_weight(self.exploration_weight);
        Ok(Box::new(search))
    }
}

fn sample_uniform<R: Rng>(rng: &mut R, kind: &ParameterKind) -> ParameterValue {
    match kind {
        ParameterKind::FloatRange { low, high } => {
            ParameterValue::Float(rng.gen_range(*low..=*high))
        }
        ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
        ParameterKind::LogUniform { low, high } => {
            let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
            ParameterValue::Float(log_val.exp().clamp(*low, *high))
        }
        ParameterKind::Choice { values } => {
            let idx = rng.gen_range(0..values.len());
            ParameterValue::Json(values[idx].clone())
        }
    }
}
