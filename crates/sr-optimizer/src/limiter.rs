//! In-flight trial bookkeeping for a region optimizer.

use sr_types::ParameterSet;
use std::collections::HashMap;
use uuid::Uuid;

use crate::search::{OptimizerError, OptimizerState, RegionOptimizer};

/// Caps the number of in-flight proposals from a stateful optimizer.
///
/// Regions run with `max_concurrent = 1`, so every trial is told back to the
/// optimizer before the next configuration is proposed.
pub struct ConcurrencyLimiter {
    inner: Box<dyn RegionOptimizer>,
    max_concurrent: usize,
    live: HashMap<Uuid, ParameterSet>,
}

impl ConcurrencyLimiter {
    pub fn new(inner: Box<dyn RegionOptimizer>, max_concurrent: usize) -> Self {
        Self {
            inner,
            max_concurrent: max_concurrent.max(1),
            live: HashMap::new(),
        }
    }

    pub fn sequential(inner: Box<dyn RegionOptimizer>) -> Self {
        Self::new(inner, 1)
    }

    pub fn in_flight(&self) -> usize {
        self.live.len()
    }

    /// Next configuration for `trial_id`, or `None` while the limit is reached.
    pub fn suggest(&mut self, trial_id: Uuid) -> Result<Option<ParameterSet>, OptimizerError> {
        if self.live.len() >= self.max_concurrent {
            return Ok(None);
        }
        let params = self.inner.ask()?;
        self.live.insert(trial_id, params.clone());
        Ok(Some(params))
    }

    /// Report the result of an in-flight trial and free its slot.
    pub fn complete(&mut self, trial_id: Uuid, value: f64) -> Result<(), OptimizerError> {
        let params = self
            .live
            .remove(&trial_id)
            .ok_or(OptimizerError::UnknownTrial { trial_id })?;
        self.inner.tell(&params, value)
    }

    /// Free the slot of a trial whose evaluation failed, without telling the optimizer.
    pub fn abandon(&mut self, trial_id: Uuid) -> bool {
        self.live.remove(&trial_id).is_some()
    }

    pub fn terminal_state(&self) -> OptimizerState {
        self.inner.terminal_state()
    }

    pub fn optimizer_name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{GuidedSearch, OptimizerSettings, SearchSpace, SpaceBuilder};
    use crate::trial::ObjectiveDirection;

    fn limiter(max: usize) -> ConcurrencyLimiter {
        let region = SpaceBuilder::new()
            .build(&SearchSpace::new().add_float("x", 0.0, 1.0))
            .unwrap()
            .remove(0);
        let settings = OptimizerSettings {
            seed: 0,
            initial_points: 2,
            direction: ObjectiveDirection::Maximize,
        };
        ConcurrencyLimiter::new(Box::new(GuidedSearch::new(region, settings).unwrap()), max)
    }

    #[test]
    fn sequential_limiter_allows_one_in_flight() {
        let mut limiter = limiter(1);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(limiter.suggest(first).unwrap().is_some());
        assert!(limiter.suggest(second).unwrap().is_none());
        assert_eq!(limiter.in_flight(), 1);

        limiter.complete(first, 0.5).unwrap();
        assert!(limiter.suggest(second).unwrap().is_some());
    }

    #[test]
    fn completed_trials_reach_the_optimizer() {
        let mut limiter = limiter(1);
        for i in 0..3 {
            let id = Uuid::new_v4();
            limiter.suggest(id).unwrap().unwrap();
            limiter.complete(id, i as f64).unwrap();
        }
        let state = limiter.terminal_state();
        assert_eq!(state.observations.len(), 3);
        assert_eq!(state.asked, 3);
        assert_eq!(limiter.optimizer_name(), "guided");
    }

    #[test]
    fn unknown_trial_is_an_error() {
        let mut limiter = limiter(2);
        assert!(matches!(
            limiter.complete(Uuid::new_v4(), 1.0),
            Err(OptimizerError::UnknownTrial { .. })
        ));
    }

    #[test]
    fn abandoned_trials_free_their_slot() {
        let mut limiter = limiter(1);
        let id = Uuid::new_v4();
        limiter.suggest(id).unwrap().unwrap();
        assert!(limiter.abandon(id));
        assert!(!limiter.abandon(id));
        assert_eq!(limiter.in_flight(), 0);
        assert!(limiter.terminal_state().observations.is_empty());
    }
}
