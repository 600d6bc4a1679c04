use std::fmt;
use std::str::FromStr;

use outpost_common::Endpoint;
use serde::{Deserialize, Serialize};

use crate::selector::SelectionContext;

/// Number of candidates the latency and hybrid strategies draw from.
const TOP_CANDIDATES: usize = 3;
/// Upper bound for the hybrid "fast set" latency threshold.
const HYBRID_LATENCY_CAP_MS: u64 = 1000;

/// Trait for pluggable selection strategies.
/// The selector handles the empty and single-candidate cases, then delegates.
pub trait SelectionStrategy: Send + Sync {
    /// Select one candidate from a list of at least two. Returns the index into `candidates`.
    fn select(&self, candidates: &[Endpoint], ctx: &SelectionContext<'_>) -> Option<usize>;

    /// Human-readable name for logging.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    WeightedRoundRobin,
    LatencyBased,
    PerformanceBased,
    #[default]
    Hybrid,
}

impl StrategyKind {
    pub fn strategy(self) -> &'static dyn SelectionStrategy {
        match self {
            StrategyKind::WeightedRoundRobin => &WeightedRoundRobin,
            StrategyKind::LatencyBased => &LatencyBased,
            StrategyKind::PerformanceBased => &PerformanceBased,
            StrategyKind::Hybrid => &Hybrid,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.strategy().name()
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "weighted_round_robin" => Ok(StrategyKind::WeightedRoundRobin),
            "latency_based" => Ok(StrategyKind::LatencyBased),
            "performance_based" => Ok(StrategyKind::PerformanceBased),
            "hybrid" => Ok(StrategyKind::Hybrid),
            other => Err(format!(
                "unknown selection strategy '{other}', available: weighted_round_robin, latency_based, performance_based, hybrid"
            )),
        }
    }
}

/// Indices of `candidates` ordered by latency, unknown last. Stable for ties.
fn by_latency(candidates: &[Endpoint]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by_key(|&i| candidates[i].latency_key());
    order
}

// ---------------------------------------------------------------------------
// WeightedRoundRobin: deterministic rotation proportional to weight
// ---------------------------------------------------------------------------

pub struct WeightedRoundRobin;

impl SelectionStrategy for WeightedRoundRobin {
    fn select(&self, candidates: &[Endpoint], ctx: &SelectionContext<'_>) -> Option<usize> {
        let weights: Vec<u64> = candidates
            .iter()
            .map(|c| u64::from(ctx.effective_weight(c)))
            .collect();
        let total: u64 = weights.iter().sum();
        if total == 0 {
            return None;
        }

        let target = ctx.next_round_robin() % total;
        let mut running = 0u64;
        for (i, w) in weights.iter().enumerate() {
            running += w;
            if running > target {
                return Some(i);
            }
        }
        Some(0)
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

// ---------------------------------------------------------------------------
// LatencyBased: weighted draw among the three fastest, faster weighs more
// ---------------------------------------------------------------------------

pub struct LatencyBased;

impl SelectionStrategy for LatencyBased {
    fn select(&self, candidates: &[Endpoint], ctx: &SelectionContext<'_>) -> Option<usize> {
        let top: Vec<usize> = by_latency(candidates)
            .into_iter()
            .take(TOP_CANDIDATES)
            .collect();
        if top.len() <= 1 {
            return top.first().copied();
        }

        let max_latency = top
            .iter()
            .map(|&i| candidates[i].latency_key() as f64)
            .fold(0.0, f64::max);
        let weights: Vec<f64> = top
            .iter()
            .map(|&i| {
                if max_latency <= 0.0 {
                    return 100.0;
                }
                let latency = candidates[i].latency_key() as f64;
                ((max_latency - latency + 1.0) / max_latency * 100.0)
                    .round()
                    .max(1.0)
            })
            .collect();

        Some(top[ctx.weighted_pick(&weights)])
    }

    fn name(&self) -> &'static str {
        "latency_based"
    }
}

// ---------------------------------------------------------------------------
// PerformanceBased: highest performance score, first wins on ties
// ---------------------------------------------------------------------------

pub struct PerformanceBased;

impl SelectionStrategy for PerformanceBased {
    fn select(&self, candidates: &[Endpoint], _ctx: &SelectionContext<'_>) -> Option<usize> {
        let mut best_idx: Option<usize> = None;
        let mut best_score = f64::NEG_INFINITY;

        for (i, c) in candidates.iter().enumerate() {
            let score = c.performance_score();
            if score > best_score {
                best_score = score;
                best_idx = Some(i);
            }
        }

        best_idx
    }

    fn name(&self) -> &'static str {
        "performance_based"
    }
}

// ---------------------------------------------------------------------------
// Hybrid: restrict to the fast half (capped at 1s), keep the best three by
// score, then draw weighted by base weight, success rate and latency.
// ---------------------------------------------------------------------------

pub struct Hybrid;

impl Hybrid {
    fn weight(ep: &Endpoint) -> f64 {
        let latency_factor = 1000.0 / (ep.latency_key() as f64 + 100.0);
        f64::from(ep.base_weight) * ep.success_rate() * latency_factor
    }
}

impl SelectionStrategy for Hybrid {
    fn select(&self, candidates: &[Endpoint], ctx: &SelectionContext<'_>) -> Option<usize> {
        let sorted = by_latency(candidates);
        let median = *sorted.get(sorted.len() / 2)?;
        let threshold = HYBRID_LATENCY_CAP_MS.min(candidates[median].latency_key());

        let mut fast: Vec<usize> = sorted
            .iter()
            .copied()
            .filter(|&i| candidates[i].latency_key() <= threshold)
            .collect();
        if fast.is_empty() {
            tracing::debug!("no endpoint under the latency threshold, taking the fastest");
            return sorted.first().copied();
        }

        if fast.len() > TOP_CANDIDATES {
            fast.sort_by(|&a, &b| {
                candidates[b]
                    .performance_score()
                    .total_cmp(&candidates[a].performance_score())
            });
            fast.truncate(TOP_CANDIDATES);
        }

        let weights: Vec<f64> = fast.iter().map(|&i| Self::weight(&candidates[i])).collect();
        Some(fast[ctx.weighted_pick(&weights)])
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}
