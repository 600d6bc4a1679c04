use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use outpost_common::{Endpoint, HealthResult, PoolError};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{PoolConfig, DEFAULT_CANARY_URLS};
use crate::registry::Registry;
use crate::selector::Selector;
use crate::transport::ProbeTransport;

#[derive(Clone)]
struct ProbeSettings {
    canary_urls: Arc<[String]>,
    transport_timeout: Duration,
    behavioral_timeout: Duration,
}

impl ProbeSettings {
    fn pick_canary(&self) -> String {
        self.canary_urls
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| DEFAULT_CANARY_URLS[0].to_string())
    }
}

/// Transport phase then behavioral phase. Latency spans both and is only
/// reported on success.
async fn probe_endpoint(
    transport: Arc<dyn ProbeTransport>,
    settings: ProbeSettings,
    endpoint: Endpoint,
) -> HealthResult {
    let started = Instant::now();

    match timeout(settings.transport_timeout, transport.connect(&endpoint)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return HealthResult::unhealthy(e),
        Err(_) => {
            return HealthResult::unhealthy(PoolError::transport(
                &endpoint.id,
                format!("connect timed out after {:?}", settings.transport_timeout),
            ))
        }
    }

    let url = settings.pick_canary();
    match timeout(settings.behavioral_timeout, transport.fetch(&endpoint, &url)).await {
        Ok(Ok(status)) if (200..300).contains(&status) => {
            HealthResult::healthy(started.elapsed().as_millis() as u64)
        }
        Ok(Ok(status)) => HealthResult::unhealthy(PoolError::probe(
            &endpoint.id,
            format!("canary {url} answered {status}"),
        )),
        Ok(Err(e)) => HealthResult::unhealthy(e),
        Err(_) => HealthResult::unhealthy(PoolError::probe(
            &endpoint.id,
            format!("canary {url} timed out after {:?}", settings.behavioral_timeout),
        )),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub probed: usize,
    pub healthy: usize,
    pub removed: usize,
}

/// Periodic and on-demand endpoint verification.
pub struct HealthProber {
    registry: Arc<Registry>,
    selector: Arc<Selector>,
    transport: Arc<dyn ProbeTransport>,
    settings: ProbeSettings,
    interval: Duration,
    retry_interval: Duration,
    permits: Arc<Semaphore>,
    cycles_total: AtomicU64,
}

impl std::fmt::Debug for HealthProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProber")
            .field("interval", &self.interval)
            .field("cycles_total", &self.cycles_total.load(Ordering::Relaxed))
            .finish()
    }
}

impl HealthProber {
    pub fn new(
        config: &PoolConfig,
        registry: Arc<Registry>,
        selector: Arc<Selector>,
        transport: Arc<dyn ProbeTransport>,
    ) -> Arc<Self> {
        let canary_urls: Vec<String> = if config.canary_urls.is_empty() {
            DEFAULT_CANARY_URLS.iter().map(|u| u.to_string()).collect()
        } else {
            config.canary_urls.clone()
        };
        Arc::new(Self {
            registry,
            selector,
            transport,
            settings: ProbeSettings {
                canary_urls: canary_urls.into(),
                transport_timeout: config.transport_timeout(),
                behavioral_timeout: config.behavioral_timeout(),
            },
            interval: config.probe_interval(),
            retry_interval: config.probe_retry_interval(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_probes.max(1))),
            cycles_total: AtomicU64::new(0),
        })
    }

    pub fn cycles_total(&self) -> u64 {
        self.cycles_total.load(Ordering::Relaxed)
    }

    /// Probe one endpoint without touching any state.
    pub async fn check(&self, endpoint: &Endpoint) -> HealthResult {
        probe_endpoint(self.transport.clone(), self.settings.clone(), endpoint.clone()).await
    }

    pub async fn quick_check(&self, endpoint: &Endpoint) -> bool {
        let result = self.check(endpoint).await;
        if let Some(e) = &result.error {
            tracing::debug!(endpoint_id = %endpoint.id, error = %e, "quick check failed");
        }
        result.is_healthy
    }

    /// Quick-check all `endpoints` concurrently; returns the ones that passed, in
    /// completion order.
    pub async fn quick_check_all(&self, endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
        let mut set = JoinSet::new();
        for ep in endpoints {
            let transport = self.transport.clone();
            let settings = self.settings.clone();
            set.spawn(async move {
                let result = probe_endpoint(transport, settings, ep.clone()).await;
                result.is_healthy.then_some(ep)
            });
        }

        let mut passed = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(ep)) => passed.push(ep),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "quick check task failed"),
            }
        }
        passed
    }

    /// Fold one probe result into the registry and the selector's weights.
    pub fn apply_result(&self, endpoint: &Endpoint, result: &HealthResult) {
        let Some(was_healthy) = self.registry.get(&endpoint.id).map(|e| e.is_healthy) else {
            // removed while the probe was in flight
            return;
        };

        if result.is_healthy {
            // record_outcome ignores zero response times
            let latency = result.latency_ms.unwrap_or_default().max(1);
            if !was_healthy {
                self.registry.mark_healthy(&endpoint.id);
            }
            self.registry.record_outcome(&endpoint.id, true, latency);
            self.selector.adjust_weight(&endpoint.id, true, latency);
            tracing::debug!(endpoint_id = %endpoint.id, latency_ms = latency, "probe ok");
        } else {
            let reason = result
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "probe failed".to_string());
            if was_healthy {
                self.registry.mark_unhealthy(&endpoint.id, &reason);
            }
            self.registry.record_outcome(&endpoint.id, false, 0);
            self.selector.adjust_weight(&endpoint.id, false, 0);
            tracing::debug!(endpoint_id = %endpoint.id, error = %reason, "probe failed");
        }
    }

    /// Probe every known endpoint once, then garbage-collect dead ones.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        let endpoints = self.registry.all();
        if endpoints.is_empty() {
            tracing::warn!("no endpoints to probe");
            return Ok(CycleReport::default());
        }

        tracing::debug!(count = endpoints.len(), "health cycle started");
        let mut set = JoinSet::new();
        for ep in endpoints {
            let transport = self.transport.clone();
            let settings = self.settings.clone();
            let permits = self.permits.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = probe_endpoint(transport, settings, ep.clone()).await;
                (ep, result)
            });
        }

        let mut report = CycleReport::default();
        while let Some(joined) = set.join_next().await {
            let (ep, result) = joined?;
            self.apply_result(&ep, &result);
            report.probed += 1;
            if result.is_healthy {
                report.healthy += 1;
            }
        }

        report.removed = self.registry.cleanup().len();
        self.cycles_total.fetch_add(1, Ordering::Relaxed);

        let stats = self.registry.stats();
        tracing::info!(
            total = stats.total,
            healthy = stats.healthy,
            avg_latency_ms = stats.avg_latency_ms,
            best_latency_ms = ?stats.best_latency_ms,
            removed = report.removed,
            "health cycle finished"
        );
        Ok(report)
    }

    /// Run cycles until `shutdown` fires. Cancelling drops the in-flight cycle,
    /// which aborts its probe tasks instead of waiting for their timeouts.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(interval = ?self.interval, "health prober started");
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.run_cycle() => match res {
                    Ok(_) => self.interval,
                    Err(e) => {
                        tracing::warn!(error = %e, "health cycle failed, retrying soon");
                        self.retry_interval
                    }
                },
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(next) => {}
            }
        }
        tracing::info!("health prober stopped");
    }

    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(shutdown))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use outpost_common::ProtocolKind;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub(crate) enum Behavior {
        Healthy,
        Refused,
        Status(u16),
        SlowFetch(u64),
        HangConnect,
        HangFetch,
        PanicFetch,
    }

    /// Scripted transport keyed by endpoint id; unknown ids are healthy.
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        behaviors: Mutex<HashMap<String, Behavior>>,
        pub(crate) fetches: AtomicUsize,
    }

    impl FakeTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn set(&self, id: &str, behavior: Behavior) {
            self.behaviors.lock().insert(id.to_string(), behavior);
        }

        fn behavior(&self, id: &str) -> Behavior {
            self.behaviors
                .lock()
                .get(id)
                .copied()
                .unwrap_or(Behavior::Healthy)
        }
    }

    #[async_trait]
    impl ProbeTransport for FakeTransport {
        async fn connect(&self, endpoint: &Endpoint) -> Result<(), PoolError> {
            match self.behavior(&endpoint.id) {
                Behavior::Refused => Err(PoolError::transport(&endpoint.id, "connection refused")),
                Behavior::HangConnect => std::future::pending().await,
                _ => Ok(()),
            }
        }

        async fn fetch(&self, endpoint: &Endpoint, _url: &str) -> Result<u16, PoolError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.behavior(&endpoint.id) {
                Behavior::Status(code) => Ok(code),
                Behavior::SlowFetch(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(200)
                }
                Behavior::HangFetch => std::future::pending().await,
                Behavior::PanicFetch => panic!("fetch blew up"),
                _ => Ok(204),
            }
        }
    }

    pub(crate) fn make_ep(id: &str, latency: Option<u64>) -> Endpoint {
        let mut ep = Endpoint::new(id, id, ProtocolKind::Socks5, "10.0.0.1", 1080, BTreeMap::new())
            .unwrap();
        ep.latency_ms = latency;
        ep
    }

    fn setup() -> (Arc<Registry>, Arc<Selector>, Arc<FakeTransport>, Arc<HealthProber>) {
        let registry = Registry::new();
        let selector = Selector::with_seed(1);
        let transport = FakeTransport::new();
        let prober = HealthProber::new(
            &PoolConfig::default(),
            registry.clone(),
            selector.clone(),
            transport.clone(),
        );
        (registry, selector, transport, prober)
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_measures_latency() {
        let (_, _, transport, prober) = setup();
        transport.set("a", Behavior::SlowFetch(120));
        let result = prober.check(&make_ep("a", None)).await;
        assert!(result.is_healthy);
        assert!(result.latency_ms.unwrap() >= 120);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_short_circuits() {
        let (_, _, transport, prober) = setup();
        transport.set("a", Behavior::Refused);
        let result = prober.check(&make_ep("a", None)).await;
        assert!(!result.is_healthy);
        assert_eq!(result.latency_ms, None);
        assert!(matches!(result.error, Some(PoolError::Transport { .. })));
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_success_status_is_probe_error() {
        let (_, _, transport, prober) = setup();
        transport.set("a", Behavior::Status(503));
        let result = prober.check(&make_ep("a", None)).await;
        assert!(matches!(result.error, Some(PoolError::Probe { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_classified() {
        let (_, _, transport, prober) = setup();
        transport.set("c", Behavior::HangConnect);
        transport.set("f", Behavior::HangFetch);

        let started = Instant::now();
        let result = prober.check(&make_ep("c", None)).await;
        assert!(matches!(result.error, Some(PoolError::Transport { .. })));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));

        let started = Instant::now();
        let result = prober.check(&make_ep("f", None)).await;
        assert!(matches!(result.error, Some(PoolError::Probe { .. })));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_cycle_updates_registry_and_weights() {
        let (registry, selector, transport, prober) = setup();
        registry.add(make_ep("good", None)).unwrap();
        registry.add(make_ep("bad", Some(80))).unwrap();
        let mut back = make_ep("back", None);
        back.is_healthy = false;
        back.consecutive_failures = 4;
        registry.add(back).unwrap();
        transport.set("bad", Behavior::Refused);

        let report = prober.run_cycle().await.unwrap();
        assert_eq!(report, CycleReport { probed: 3, healthy: 2, removed: 0 });
        assert_eq!(prober.cycles_total(), 1);

        let good = registry.get("good").unwrap();
        assert!(good.is_healthy);
        assert!(good.latency_ms.is_some());
        assert_eq!(good.total_requests, 1);
        assert_eq!(selector.weight("good"), 110);

        let bad = registry.get("bad").unwrap();
        assert!(!bad.is_healthy);
        assert_eq!(selector.weight("bad"), 85);

        assert!(registry.get("back").unwrap().is_healthy);
        let healthy: Vec<String> = registry.healthy().into_iter().map(|e| e.id).collect();
        assert!(!healthy.contains(&"bad".to_string()));
    }

    #[tokio::test]
    async fn test_quick_check_all_filters() {
        let (_, _, transport, prober) = setup();
        transport.set("b", Behavior::Status(500));
        transport.set("c", Behavior::Refused);
        let passed = prober
            .quick_check_all(vec![make_ep("a", None), make_ep("b", None), make_ep("c", None)])
            .await;
        let ids: Vec<String> = passed.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a".to_string()]);
        assert!(prober.quick_check_all(Vec::new()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_interval() {
        let (registry, _, _, prober) = setup();
        registry.add(make_ep("a", None)).unwrap();
        let shutdown = CancellationToken::new();
        let handle = prober.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(prober.cycles_total(), 3);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_retries_after_short_interval() {
        let (registry, _, transport, prober) = setup();
        registry.add(make_ep("a", None)).unwrap();
        transport.set("a", Behavior::PanicFetch);

        let shutdown = CancellationToken::new();
        let handle = prober.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 2);

        // back to the base interval once a cycle succeeds
        transport.set("a", Behavior::Healthy);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(prober.cycles_total(), 1);
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 3);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 4);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_aborts_inflight_probes() {
        let (registry, _, transport, prober) = setup();
        registry.add(make_ep("stuck", None)).unwrap();
        transport.set("stuck", Behavior::HangFetch);

        let shutdown = CancellationToken::new();
        let handle = prober.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("prober should stop without waiting for probe timeouts")
            .unwrap();
        assert_eq!(prober.cycles_total(), 0);
    }
}
