use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use outpost_common::{Endpoint, PoolError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::strategy::StrategyKind;

pub const DEFAULT_DYNAMIC_WEIGHT: u32 = 100;
pub const MIN_DYNAMIC_WEIGHT: u32 = 10;
pub const MAX_DYNAMIC_WEIGHT: u32 = 200;
const FAILURE_PENALTY: u32 = 15;

/// Shared state a strategy may consult while choosing.
pub struct SelectionContext<'a> {
    weights: &'a DashMap<String, u32>,
    round_robin: &'a AtomicU64,
    rng: &'a Mutex<StdRng>,
}

impl SelectionContext<'_> {
    pub fn dynamic_weight(&self, id: &str) -> Option<u32> {
        self.weights.get(id).map(|w| *w.value())
    }

    /// Dynamic weight when one has been learned, otherwise the static base weight.
    pub fn effective_weight(&self, ep: &Endpoint) -> u32 {
        self.dynamic_weight(&ep.id).unwrap_or(ep.base_weight).max(1)
    }

    pub fn next_round_robin(&self) -> u64 {
        self.round_robin.fetch_add(1, Ordering::Relaxed)
    }

    /// Draw `r` in `[0, total)` and return the first index whose cumulative
    /// weight exceeds it. Falls back to a uniform pick when the total is not positive.
    pub fn weighted_pick(&self, weights: &[f64]) -> usize {
        if weights.len() <= 1 {
            return 0;
        }
        let total: f64 = weights.iter().sum();
        let mut rng = self.rng.lock();
        if !(total.is_finite() && total > 0.0) {
            return rng.gen_range(0..weights.len());
        }

        let r = rng.gen_range(0.0..total);
        let mut running = 0.0;
        for (i, w) in weights.iter().enumerate() {
            running += w;
            if running > r {
                return i;
            }
        }
        weights.len() - 1
    }
}

/// Selection engine: strategy dispatch plus the outcome-driven weight table.
pub struct Selector {
    weights: DashMap<String, u32>,
    round_robin: AtomicU64,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("weights", &self.weights.len())
            .field("round_robin", &self.round_robin.load(Ordering::Relaxed))
            .finish()
    }
}

impl Selector {
    pub fn new() -> Arc<Self> {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic draws, for reproducible selection.
    pub fn with_seed(seed: u64) -> Arc<Self> {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Arc<Self> {
        Arc::new(Self {
            weights: DashMap::new(),
            round_robin: AtomicU64::new(0),
            rng: Mutex::new(rng),
        })
    }

    fn context(&self) -> SelectionContext<'_> {
        SelectionContext {
            weights: &self.weights,
            round_robin: &self.round_robin,
            rng: &self.rng,
        }
    }

    /// Pick exactly one endpoint. An empty candidate list is an exhaustion error.
    pub fn select(&self, candidates: &[Endpoint], kind: StrategyKind) -> Result<Endpoint, PoolError> {
        match candidates {
            [] => Err(PoolError::Exhaustion("empty candidate list".to_string())),
            [only] => Ok(only.clone()),
            _ => {
                let strategy = kind.strategy();
                let idx = strategy
                    .select(candidates, &self.context())
                    .unwrap_or(0);
                let chosen = candidates[idx].clone();
                tracing::debug!(
                    strategy = strategy.name(),
                    candidates = candidates.len(),
                    endpoint_id = %chosen.id,
                    "endpoint selected"
                );
                Ok(chosen)
            }
        }
    }

    /// Feed one outcome into the dynamic weight table and return the new weight.
    pub fn adjust_weight(&self, id: &str, success: bool, response_time_ms: u64) -> u32 {
        let mut entry = self
            .weights
            .entry(id.to_string())
            .or_insert(DEFAULT_DYNAMIC_WEIGHT);
        let current = *entry;
        let next = if success {
            let delta = match response_time_ms {
                0..=199 => 10,
                200..=499 => 5,
                500..=999 => 2,
                _ => 1,
            };
            (current + delta).min(MAX_DYNAMIC_WEIGHT)
        } else {
            current
                .saturating_sub(FAILURE_PENALTY)
                .max(MIN_DYNAMIC_WEIGHT)
        };
        *entry = next;
        tracing::trace!(endpoint_id = %id, success, response_time_ms, weight = next, "weight adjusted");
        next
    }

    pub fn weight(&self, id: &str) -> u32 {
        self.weights
            .get(id)
            .map(|w| *w.value())
            .unwrap_or(DEFAULT_DYNAMIC_WEIGHT)
    }

    pub fn set_weight(&self, id: &str, weight: u32) {
        self.weights.insert(
            id.to_string(),
            weight.clamp(MIN_DYNAMIC_WEIGHT, MAX_DYNAMIC_WEIGHT),
        );
    }

    pub fn reset_weight(&self, id: &str) {
        self.weights.remove(id);
    }

    pub fn clear_weights(&self) {
        self.weights.clear();
        tracing::debug!("dynamic weights cleared");
    }

    pub fn weights(&self) -> HashMap<String, u32> {
        self.weights
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Best-scoring healthy candidate other than `exclude_id`.
    pub fn select_backup(&self, candidates: &[Endpoint], exclude_id: &str) -> Result<Endpoint, PoolError> {
        let available: Vec<Endpoint> = candidates
            .iter()
            .filter(|c| c.is_healthy && c.id != exclude_id)
            .cloned()
            .collect();
        self.select(&available, StrategyKind::PerformanceBased)
    }

    /// Top `count` healthy candidates by performance score, for initial connection attempts.
    pub fn pre_warm(&self, candidates: &[Endpoint], count: usize) -> Vec<Endpoint> {
        let mut healthy: Vec<Endpoint> = candidates.iter().filter(|c| c.is_healthy).cloned().collect();
        healthy.sort_by(|a, b| b.performance_score().total_cmp(&a.performance_score()));
        healthy.truncate(count);
        healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_common::ProtocolKind;
    use std::collections::BTreeMap;

    fn make_ep(id: &str, latency: Option<u64>) -> Endpoint {
        let mut ep = Endpoint::new(id, id, ProtocolKind::Http, "10.0.0.1", 8080, BTreeMap::new())
            .unwrap();
        ep.latency_ms = latency;
        ep
    }

    #[test]
    fn test_empty_candidates_is_exhaustion() {
        let selector = Selector::with_seed(1);
        for kind in [
            StrategyKind::WeightedRoundRobin,
            StrategyKind::LatencyBased,
            StrategyKind::PerformanceBased,
            StrategyKind::Hybrid,
        ] {
            assert!(matches!(selector.select(&[], kind), Err(PoolError::Exhaustion(_))));
        }
    }

    #[test]
    fn test_single_candidate_fast_path() {
        let selector = Selector::with_seed(1);
        let only = make_ep("only", None);
        let chosen = selector.select(std::slice::from_ref(&only), StrategyKind::WeightedRoundRobin).unwrap();
        assert_eq!(chosen.id, "only");
        // the round-robin counter is untouched by the fast path
        assert_eq!(selector.context().next_round_robin(), 0);
    }

    #[test]
    fn test_adjust_weight_fast_successes() {
        let selector = Selector::with_seed(1);
        let seen: Vec<u32> = (0..5).map(|_| selector.adjust_weight("a", true, 150)).collect();
        assert_eq!(seen, vec![110, 120, 130, 140, 150]);
    }

    #[test]
    fn test_adjust_weight_steps() {
        let selector = Selector::with_seed(1);
        assert_eq!(selector.adjust_weight("a", true, 200), 105);
        assert_eq!(selector.adjust_weight("a", true, 999), 107);
        assert_eq!(selector.adjust_weight("a", true, 5000), 108);

        selector.set_weight("b", 50);
        assert_eq!(selector.adjust_weight("b", false, 0), 35);
    }

    #[test]
    fn test_adjust_weight_bounded() {
        let selector = Selector::with_seed(1);
        for _ in 0..100 {
            assert!(selector.adjust_weight("up", true, 10) <= MAX_DYNAMIC_WEIGHT);
            assert!(selector.adjust_weight("down", false, 0) >= MIN_DYNAMIC_WEIGHT);
        }
        assert_eq!(selector.weight("up"), 200);
        assert_eq!(selector.weight("down"), 10);

        selector.reset_weight("up");
        assert_eq!(selector.weight("up"), DEFAULT_DYNAMIC_WEIGHT);
        selector.clear_weights();
        assert!(selector.weights().is_empty());
    }

    #[test]
    fn test_weighted_pick_zero_total_is_uniform() {
        let selector = Selector::with_seed(9);
        let ctx = selector.context();
        let mut seen = [0usize; 3];
        for _ in 0..300 {
            seen[ctx.weighted_pick(&[0.0, 0.0, 0.0])] += 1;
        }
        assert!(seen.iter().all(|&n| n > 0));
    }

    #[test]
    fn test_select_backup_excludes_and_filters() {
        let selector = Selector::with_seed(1);
        let mut sick = make_ep("sick", Some(1));
        sick.is_healthy = false;
        let candidates = vec![make_ep("current", Some(10)), sick, make_ep("other", Some(400))];
        assert_eq!(selector.select_backup(&candidates, "current").unwrap().id, "other");
        assert!(matches!(
            selector.select_backup(&candidates[..2], "current"),
            Err(PoolError::Exhaustion(_))
        ));
    }

    #[test]
    fn test_pre_warm_orders_by_score() {
        let selector = Selector::with_seed(1);
        let mut sick = make_ep("sick", Some(1));
        sick.is_healthy = false;
        let candidates = vec![
            make_ep("slow", Some(800)),
            sick,
            make_ep("fast", Some(20)),
            make_ep("mid", Some(100)),
        ];
        let ids: Vec<String> = selector.pre_warm(&candidates, 2).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["fast", "mid"]);
        assert!(selector.weights().is_empty());
    }
}
