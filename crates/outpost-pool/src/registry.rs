use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use outpost_common::{now_ms, smooth_latency, Endpoint, PoolError};
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::PoolConfig;

#[derive(Debug, Default)]
struct Inner {
    endpoints: HashMap<String, Endpoint>,
    /// Ids of endpoints with `is_healthy == true`.
    healthy: HashSet<String>,
}

impl Inner {
    fn upsert(&mut self, endpoint: Endpoint) {
        if endpoint.is_healthy {
            self.healthy.insert(endpoint.id.clone());
        } else {
            self.healthy.remove(&endpoint.id);
        }
        self.endpoints.insert(endpoint.id.clone(), endpoint);
    }

    fn mark_unhealthy(&mut self, id: &str, reason: &str) -> bool {
        let Some(ep) = self.endpoints.get_mut(id) else {
            return false;
        };
        ep.is_healthy = false;
        ep.consecutive_failures = ep.consecutive_failures.saturating_add(1);
        self.healthy.remove(id);
        tracing::warn!(
            endpoint_id = %id,
            name = %ep.display_name,
            failures = ep.consecutive_failures,
            reason,
            "endpoint marked unhealthy"
        );
        true
    }

    fn mark_healthy(&mut self, id: &str) -> bool {
        let Some(ep) = self.endpoints.get_mut(id) else {
            return false;
        };
        let was_healthy = ep.is_healthy;
        ep.is_healthy = true;
        ep.consecutive_failures = 0;
        self.healthy.insert(id.to_string());
        if !was_healthy {
            tracing::info!(endpoint_id = %id, name = %ep.display_name, "endpoint recovered");
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub healthy: usize,
    pub avg_latency_ms: f64,
    pub best_latency_ms: Option<u64>,
    pub worst_latency_ms: Option<u64>,
}

/// Authoritative set of known endpoints.
///
/// Every read hands out an owned snapshot; every mutation goes through a named
/// method holding the write lock, so the endpoint map and the healthy index
/// never disagree.
pub struct Registry {
    inner: RwLock<Inner>,
    unhealthy_after_failures: u32,
    gc_failure_threshold: u32,
    gc_stale_after_ms: u64,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Registry")
            .field("endpoints", &inner.endpoints.len())
            .field("healthy", &inner.healthy.len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Self::with_config(&PoolConfig::default())
    }

    pub fn with_config(config: &PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            unhealthy_after_failures: config.unhealthy_after_failures,
            gc_failure_threshold: config.gc_failure_threshold,
            gc_stale_after_ms: config.gc_stale_after_ms,
        })
    }

    /// Insert or replace an endpoint. Endpoints with a configuration error are
    /// rejected and never become selectable.
    pub fn add(&self, endpoint: Endpoint) -> Result<(), PoolError> {
        endpoint.validate()?;
        tracing::debug!(endpoint_id = %endpoint.id, protocol = %endpoint.protocol, "endpoint added");
        self.inner.write().upsert(endpoint);
        Ok(())
    }

    /// Bulk upsert under a single write lock. Returns the rejected endpoints' errors.
    pub fn add_all(&self, endpoints: impl IntoIterator<Item = Endpoint>) -> Vec<PoolError> {
        let mut rejected = Vec::new();
        let mut added = 0usize;
        {
            let mut inner = self.inner.write();
            for endpoint in endpoints {
                match endpoint.validate() {
                    Ok(()) => {
                        inner.upsert(endpoint);
                        added += 1;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "rejecting misconfigured endpoint");
                        rejected.push(PoolError::from(e));
                    }
                }
            }
        }
        tracing::info!(added, rejected = rejected.len(), "bulk endpoint add");
        rejected
    }

    pub fn get(&self, id: &str) -> Option<Endpoint> {
        self.inner.read().endpoints.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Endpoint> {
        self.inner.read().endpoints.values().cloned().collect()
    }

    /// Healthy endpoints, lowest latency first; unknown latency sorts last.
    pub fn healthy(&self) -> Vec<Endpoint> {
        let mut out: Vec<Endpoint> = {
            let inner = self.inner.read();
            inner
                .healthy
                .iter()
                .filter_map(|id| inner.endpoints.get(id))
                .filter(|ep| ep.is_healthy)
                .cloned()
                .collect()
        };
        out.sort_by_key(|ep| ep.latency_key());
        out
    }

    /// Healthy endpoint with the highest performance score.
    pub fn best(&self) -> Option<Endpoint> {
        let mut best: Option<Endpoint> = None;
        for ep in self.healthy() {
            let better = best
                .as_ref()
                .map(|b| ep.performance_score() > b.performance_score())
                .unwrap_or(true);
            if better {
                best = Some(ep);
            }
        }
        best
    }

    pub fn mark_unhealthy(&self, id: &str, reason: &str) -> bool {
        self.inner.write().mark_unhealthy(id, reason)
    }

    pub fn mark_healthy(&self, id: &str) -> bool {
        self.inner.write().mark_healthy(id)
    }

    pub fn update_latency(&self, id: &str, latency_ms: u64) -> bool {
        let mut inner = self.inner.write();
        let Some(ep) = inner.endpoints.get_mut(id) else {
            return false;
        };
        ep.latency_ms = Some(smooth_latency(ep.latency_ms, latency_ms));
        tracing::debug!(endpoint_id = %id, latency_ms = ?ep.latency_ms, "latency updated");
        true
    }

    /// Record one request or probe outcome. Crossing the failure threshold marks
    /// the endpoint unhealthy; a success on an unhealthy endpoint revives it.
    pub fn record_outcome(&self, id: &str, success: bool, response_time_ms: u64) -> bool {
        let mut inner = self.inner.write();
        let Some(ep) = inner.endpoints.get_mut(id) else {
            return false;
        };

        ep.total_requests = ep.total_requests.saturating_add(1);
        ep.last_checked_ms = now_ms();
        if success {
            ep.success_count = ep.success_count.saturating_add(1);
            ep.consecutive_failures = 0;
            if response_time_ms > 0 {
                ep.latency_ms = Some(smooth_latency(ep.latency_ms, response_time_ms));
            }
        } else {
            ep.consecutive_failures = ep.consecutive_failures.saturating_add(1);
        }

        let failures = ep.consecutive_failures;
        let is_healthy = ep.is_healthy;
        if !success && failures >= self.unhealthy_after_failures {
            let reason = format!("{failures} consecutive failures");
            inner.mark_unhealthy(id, &reason);
        } else if success && !is_healthy && failures == 0 {
            inner.mark_healthy(id);
        }
        true
    }

    /// Drop endpoints that have been failing for long and were not checked within
    /// the staleness window. Returns the removed ids.
    pub fn cleanup(&self) -> Vec<String> {
        let now = now_ms();
        let mut inner = self.inner.write();
        let doomed: Vec<String> = inner
            .endpoints
            .values()
            .filter(|ep| {
                !ep.is_healthy
                    && ep.consecutive_failures > self.gc_failure_threshold
                    && now.saturating_sub(ep.last_checked_ms) > self.gc_stale_after_ms
            })
            .map(|ep| ep.id.clone())
            .collect();

        for id in &doomed {
            inner.endpoints.remove(id);
            inner.healthy.remove(id);
            tracing::info!(endpoint_id = %id, "removed dead endpoint");
        }
        doomed
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        let latencies: Vec<u64> = inner
            .healthy
            .iter()
            .filter_map(|id| inner.endpoints.get(id))
            .filter_map(|ep| ep.latency_ms)
            .collect();
        let avg_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        };
        RegistryStats {
            total: inner.endpoints.len(),
            healthy: inner.healthy.len(),
            avg_latency_ms,
            best_latency_ms: latencies.iter().min().copied(),
            worst_latency_ms: latencies.iter().max().copied(),
        }
    }

    /// Opaque snapshot of every endpoint for the host's persistent store.
    pub fn serialize_all(&self) -> Result<Vec<u8>, PoolError> {
        let mut endpoints = self.all();
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        serde_json::to_vec(&endpoints).map_err(|e| PoolError::Snapshot(e.to_string()))
    }

    /// Upsert every endpoint from a blob produced by [`Registry::serialize_all`].
    /// Returns how many endpoints were accepted.
    pub fn restore_all(&self, blob: &[u8]) -> Result<usize, PoolError> {
        let endpoints: Vec<Endpoint> =
            serde_json::from_slice(blob).map_err(|e| PoolError::Snapshot(e.to_string()))?;
        let total = endpoints.len();
        let rejected = self.add_all(endpoints);
        Ok(total - rejected.len())
    }
}
