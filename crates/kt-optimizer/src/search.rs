//! Search strategies: the optimizer a tuning worker drives.
//!
//! A strategy proposes raw configurations, is told the measured cost of each,
//! and decides on its own when it has converged. Costs are minimized.

use std::collections::BTreeSet;

use kt_types::{validation_error, KtResult};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::space::{Configuration, Dimension, DimensionKind, ParameterSpace, ParameterValue};

/// Common trait for all search strategies.
pub trait SearchStrategy: Send {
    /// Next configuration to measure.
    fn propose(&mut self) -> Configuration;

    /// Report a measured cost so adaptive strategies can learn.
    fn report(&mut self, _config: &Configuration, _cost: f64) {}

    /// The strategy has nothing more worth trying.
    fn is_converged(&self) -> bool {
        false
    }

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

impl SearchStrategy for Box<dyn SearchStrategy> {
    fn propose(&mut self) -> Configuration {
        (**self).propose()
    }

    fn report(&mut self, config: &Configuration, cost: f64) {
        (**self).report(config, cost)
    }

    fn is_converged(&self) -> bool {
        (**self).is_converged()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

fn sample_dimension(dim: &Dimension, rng: &mut ChaCha8Rng) -> ParameterValue {
    match &dim.kind {
        DimensionKind::Enumerated { choices } => {
            ParameterValue::Choice(choices[rng.gen_range(0..choices.len())].clone())
        }
        DimensionKind::Range {
            min,
            max,
            is_integer: true,
        } => ParameterValue::Int(rng.gen_range(*min as i64..=*max as i64)),
        DimensionKind::Range { min, max, .. } => ParameterValue::Float(rng.gen_range(*min..=*max)),
    }
}

// ---- Random search ----

/// Independent random sampling across the space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: ParameterSpace,
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(space: ParameterSpace, seed: u64) -> Self {
        Self {
            space,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn sample_one(&mut self) -> Configuration {
        let mut config = Configuration::new();
        for dim in &self.space.dimensions {
            config.insert(dim.name.clone(), sample_dimension(dim, &mut self.rng));
        }
        config
    }
}

impl SearchStrategy for RandomSearch {
    fn propose(&mut self) -> Configuration {
        self.sample_one()
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Guided search ----

/// Explore/exploit search around the cheapest configuration seen so far.
///
/// With probability `exploration_weight` (and always before the first report)
/// a fresh random point is proposed; otherwise the best-known point is
/// perturbed: ranges move by a few percent of their width, enumerated choices
/// are re-drawn now and then.
#[derive(Debug, Clone)]
pub struct GuidedSearch {
    space: ParameterSpace,
    rng: ChaCha8Rng,
    observations: Vec<(Configuration, f64)>,
    exploration_weight: f64,
}

impl GuidedSearch {
    pub fn new(space: ParameterSpace, exploration_weight: f64, seed: u64) -> Self {
        Self {
            space,
            rng: ChaCha8Rng::seed_from_u64(seed),
            observations: Vec::new(),
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
        }
    }

    fn explore(&mut self) -> Configuration {
        let mut config = Configuration::new();
        for dim in &self.space.dimensions {
            config.insert(dim.name.clone(), sample_dimension(dim, &mut self.rng));
        }
        config
    }

    fn best(&self) -> Option<&Configuration> {
        self.observations
            .iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(config, _)| config)
    }

    fn exploit(&mut self) -> Configuration {
        let Some(base) = self.best().cloned() else {
            return self.explore();
        };

        let mut perturbed = Configuration::new();
        for dim in &self.space.dimensions {
            let value = match (&dim.kind, base.get(&dim.name)) {
                (DimensionKind::Range { min, max, is_integer: false }, Some(v)) => {
                    let v = v.as_f64().unwrap_or(*min);
                    let noise = self.rng.gen_range(-0.1..0.1) * (max - min);
                    ParameterValue::Float((v + noise).clamp(*min, *max))
                }
                (DimensionKind::Range { min, max, is_integer: true }, Some(v)) => {
                    let v = v.as_f64().unwrap_or(*min).round() as i64;
                    let span = (((max - min) * 0.05).round() as i64).max(1);
                    let delta = self.rng.gen_range(-span..=span);
                    ParameterValue::Int((v + delta).clamp(*min as i64, *max as i64))
                }
                (DimensionKind::Enumerated { .. }, Some(v)) if self.rng.gen::<f64>() >= 0.3 => {
                    v.clone()
                }
                _ => sample_dimension(dim, &mut self.rng),
            };
            perturbed.insert(dim.name.clone(), value);
        }
        perturbed
    }
}

impl SearchStrategy for GuidedSearch {
    fn propose(&mut self) -> Configuration {
        if self.observations.is_empty() || self.rng.gen::<f64>() < self.exploration_weight {
            self.explore()
        } else {
            self.exploit()
        }
    }

    fn report(&mut self, config: &Configuration, cost: f64) {
        self.observations.push((config.clone(), cost));
    }

    fn name(&self) -> &str {
        "guided"
    }
}

// ---- Coverage stop ----

/// Wraps a strategy and declares convergence once every choice of one
/// enumerated dimension has been measured.
#[derive(Debug, Clone)]
pub struct CoverageStop<S> {
    inner: S,
    dimension: String,
    choices: BTreeSet<String>,
    seen: BTreeSet<String>,
}

impl<S: SearchStrategy> CoverageStop<S> {
    pub fn new(inner: S, space: &ParameterSpace, dimension: &str) -> KtResult<Self> {
        let choices = match space.dimension(dimension).map(|d| &d.kind) {
            Some(DimensionKind::Enumerated { choices }) => choices.iter().cloned().collect(),
            _ => return Err(validation_error!("{dimension} is not an enumerated dimension")),
        };
        Ok(Self {
            inner,
            dimension: dimension.to_string(),
            choices,
            seen: BTreeSet::new(),
        })
    }
}

impl<S: SearchStrategy> SearchStrategy for CoverageStop<S> {
    fn propose(&mut self) -> Configuration {
        self.inner.propose()
    }

    fn report(&mut self, config: &Configuration, cost: f64) {
        if let Some(ParameterValue::Choice(choice)) = config.get(&self.dimension) {
            if self.seen.insert(choice.clone()) && self.choices.is_subset(&self.seen) {
                debug!(dimension = %self.dimension, "every choice measured");
            }
        }
        self.inner.report(config, cost);
    }

    fn is_converged(&self) -> bool {
        self.inner.is_converged() || self.choices.is_subset(&self.seen)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Strategy selection as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyKind {
    Random,
    Guided { exploration_weight: f64 },
}

impl Default for StrategyKind {
    fn default() -> Self {
        Self::Guided {
            exploration_weight: 0.3,
        }
    }
}

impl StrategyKind {
    /// Build a strategy, optionally capped by coverage of one dimension.
    pub fn build(
        &self,
        space: &ParameterSpace,
        seed: u64,
        coverage: Option<&str>,
    ) -> KtResult<Box<dyn SearchStrategy>> {
        let strategy: Box<dyn SearchStrategy> = match self {
            Self::Random => Box::new(RandomSearch::new(space.clone(), seed)),
            Self::Guided { exploration_weight } => {
                Box::new(GuidedSearch::new(space.clone(), *exploration_weight, seed))
            }
        };
        match coverage {
            Some(dimension) => Ok(Box::new(CoverageStop::new(strategy, space, dimension)?)),
            None => Ok(strategy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_search_respects_bounds() {
        let space = ParameterSpace::declare();
        let mut rs = RandomSearch::new(space.clone(), 11);
        for _ in 0..50 {
            let config = rs.propose();
            space.validate(&config).unwrap();
        }
    }

    #[test]
    fn random_search_is_reproducible_for_a_seed() {
        let space = ParameterSpace::declare();
        let mut a = RandomSearch::new(space.clone(), 5);
        let mut b = RandomSearch::new(space, 5);
        for _ in 0..5 {
            assert_eq!(a.propose(), b.propose());
        }
    }

    #[test]
    fn guided_search_starts_with_exploration() {
        let space = ParameterSpace::declare();
        let mut gs = GuidedSearch::new(space.clone(), 0.0, 1);
        // No observations yet, so this is a random point.
        let config = gs.propose();
        space.validate(&config).unwrap();
    }

    #[test]
    fn guided_search_exploits_near_cheapest_point() {
        let space = ParameterSpace::new().add_int("unroll", 0, 100);
        let mut gs = GuidedSearch::new(space.clone(), 0.0, 9);

        let mut cheap = Configuration::new();
        cheap.insert("unroll".into(), ParameterValue::Int(50));
        let mut dear = Configuration::new();
        dear.insert("unroll".into(), ParameterValue::Int(3));
        gs.report(&dear, 900.0);
        gs.report(&cheap, 100.0);

        for _ in 0..20 {
            match gs.propose().get("unroll") {
                Some(ParameterValue::Int(v)) => assert!((45..=55).contains(v), "unroll {v}"),
                other => panic!("unexpected unroll value: {other:?}"),
            }
        }
    }

    #[test]
    fn coverage_stop_converges_after_every_choice() {
        let space = ParameterSpace::declare();
        let inner = RandomSearch::new(space.clone(), 3);
        let mut strategy = CoverageStop::new(inner, &space, "MIScheduler").unwrap();
        assert!(!strategy.is_converged());

        let mut config = strategy.propose();
        for choice in ["topdown", "bottomup"] {
            config.insert("MIScheduler".into(), ParameterValue::Choice(choice.into()));
            strategy.report(&config, 10.0);
        }
        assert!(!strategy.is_converged());

        config.insert("MIScheduler".into(), ParameterValue::Choice("bidirectional".into()));
        strategy.report(&config, 10.0);
        assert!(strategy.is_converged());
    }

    #[test]
    fn coverage_requires_enumerated_dimension() {
        let space = ParameterSpace::declare();
        let inner = RandomSearch::new(space.clone(), 0);
        assert!(CoverageStop::new(inner, &space, "RegCoalescer_0").is_err());
    }

    #[test]
    fn strategy_kind_builds_named_strategies() {
        let space = ParameterSpace::declare();
        assert_eq!(StrategyKind::Random.build(&space, 0, None).unwrap().name(), "random");
        let guided = StrategyKind::default().build(&space, 0, Some("MachineSink")).unwrap();
        assert_eq!(guided.name(), "guided");

        let json = serde_json::to_string(&StrategyKind::default()).unwrap();
        assert_eq!(serde_json::from_str::<StrategyKind>(&json).unwrap(), StrategyKind::default());
    }
}
