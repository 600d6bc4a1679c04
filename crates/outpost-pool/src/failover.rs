use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use outpost_common::{Endpoint, PoolError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::PoolConfig;
use crate::prober::HealthProber;
use crate::registry::Registry;
use crate::selector::Selector;
use crate::strategy::StrategyKind;
use crate::tunnel::TunnelConfigurator;

const EVENT_CAPACITY: usize = 64;
const PRE_WARM_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverState {
    /// No endpoint has been activated yet.
    Idle,
    Stable,
    Switching,
    /// The last switch found no usable endpoint and the previous one did not recover.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FailoverEvent {
    ActiveChanged {
        from: Option<String>,
        to: Option<String>,
    },
    SwitchStarted {
        reason: String,
    },
    SwitchCompleted {
        endpoint: String,
    },
    SwitchFailed {
        reason: String,
    },
}

/// What a failure report did to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReport {
    /// The endpoint was not active when the report arrived.
    Discarded,
    Recorded,
    SwitchStarted,
}

impl FailureReport {
    pub fn accepted(self) -> bool {
        !matches!(self, Self::Discarded)
    }

    pub fn switch_started(self) -> bool {
        matches!(self, Self::SwitchStarted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailoverStats {
    pub active_id: Option<String>,
    pub active_name: Option<String>,
    pub state: FailoverState,
    pub consecutive_failures: u32,
    pub switch_attempts: u32,
    pub last_switch_at: Option<DateTime<Utc>>,
    pub is_switching: bool,
    pub switches_total: u64,
    pub switch_failures_total: u64,
    pub discarded_reports_total: u64,
}

#[derive(Debug)]
struct ControlState {
    active: Option<Endpoint>,
    phase: FailoverState,
    consecutive_failures: u32,
    /// Failure-driven switches since the last successful report or commit.
    switch_attempts: u32,
    last_switch: Option<Instant>,
    last_switch_at: Option<DateTime<Utc>>,
}

/// Holds the single-flight flag for the lifetime of one switch.
struct SwitchGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for SwitchGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
struct FailoverPolicy {
    failure_trigger: u32,
    cooldown: Duration,
    max_switch_attempts: u32,
    verify_backoff: Duration,
    max_verify_retries: u32,
    rebalance_margin: f64,
    strategy: StrategyKind,
}

/// Decides when the active endpoint is replaced and drives the replacement.
///
/// Outcome reports may arrive from any thread. At most one switch runs at a
/// time; a committed switch is visible to later reports before the
/// single-flight flag is released.
pub struct FailoverController {
    registry: Arc<Registry>,
    selector: Arc<Selector>,
    prober: Arc<HealthProber>,
    tunnel: Arc<dyn TunnelConfigurator>,
    policy: FailoverPolicy,

    state: Mutex<ControlState>,
    is_switching: Arc<AtomicBool>,

    switches_total: AtomicU64,
    switch_failures_total: AtomicU64,
    discarded_reports_total: AtomicU64,

    events: broadcast::Sender<FailoverEvent>,
    runtime: Handle,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for FailoverController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FailoverController")
            .field("active", &state.active.as_ref().map(|e| &e.id))
            .field("phase", &state.phase)
            .field("is_switching", &self.is_switching())
            .finish()
    }
}

impl FailoverController {
    /// `runtime` is where switch tasks are spawned, so reports can come from
    /// threads outside the runtime.
    pub fn new(
        config: &PoolConfig,
        registry: Arc<Registry>,
        selector: Arc<Selector>,
        prober: Arc<HealthProber>,
        tunnel: Arc<dyn TunnelConfigurator>,
        runtime: Handle,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            registry,
            selector,
            prober,
            tunnel,
            policy: FailoverPolicy {
                failure_trigger: config.failure_trigger.max(1),
                cooldown: config.switch_cooldown(),
                max_switch_attempts: config.max_switch_attempts,
                verify_backoff: config.verify_backoff(),
                max_verify_retries: config.max_verify_retries,
                rebalance_margin: config.rebalance_margin,
                strategy: config.strategy,
            },
            state: Mutex::new(ControlState {
                active: None,
                phase: FailoverState::Idle,
                consecutive_failures: 0,
                switch_attempts: 0,
                last_switch: None,
                last_switch_at: None,
            }),
            is_switching: Arc::new(AtomicBool::new(false)),
            switches_total: AtomicU64::new(0),
            switch_failures_total: AtomicU64::new(0),
            discarded_reports_total: AtomicU64::new(0),
            events,
            runtime,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailoverEvent> {
        self.events.subscribe()
    }

    pub fn active(&self) -> Option<Endpoint> {
        self.state.lock().active.clone()
    }

    pub fn state(&self) -> FailoverState {
        self.state.lock().phase
    }

    pub fn is_switching(&self) -> bool {
        self.is_switching.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> FailoverStats {
        let state = self.state.lock();
        FailoverStats {
            active_id: state.active.as_ref().map(|e| e.id.clone()),
            active_name: state.active.as_ref().map(|e| e.display_name.clone()),
            state: state.phase,
            consecutive_failures: state.consecutive_failures,
            switch_attempts: state.switch_attempts,
            last_switch_at: state.last_switch_at,
            is_switching: self.is_switching(),
            switches_total: self.switches_total.load(Ordering::Relaxed),
            switch_failures_total: self.switch_failures_total.load(Ordering::Relaxed),
            discarded_reports_total: self.discarded_reports_total.load(Ordering::Relaxed),
        }
    }

    /// Clear the failure and attempt counters.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.switch_attempts = 0;
        tracing::info!("failover counters reset");
    }

    fn emit(&self, event: FailoverEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn discard(&self, endpoint_id: &str, kind: &str) {
        self.discarded_reports_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(endpoint_id = %endpoint_id, kind, "report for inactive endpoint discarded");
    }

    /// Record a successful request through the active endpoint. Returns whether
    /// the report was accepted.
    pub fn report_success(&self, endpoint_id: &str, response_time_ms: u64) -> bool {
        {
            let mut state = self.state.lock();
            if !state.active.as_ref().is_some_and(|a| a.id == endpoint_id) {
                drop(state);
                self.discard(endpoint_id, "success");
                return false;
            }
            state.consecutive_failures = 0;
            state.switch_attempts = 0;
        }
        self.registry.record_outcome(endpoint_id, true, response_time_ms);
        self.selector.adjust_weight(endpoint_id, true, response_time_ms);
        true
    }

    /// Record a failed request through the active endpoint. Acceptance and the
    /// switch decision come from the same view of the active endpoint.
    pub fn report_failure(self: &Arc<Self>, endpoint_id: &str, error: &str) -> FailureReport {
        let failures = {
            let mut state = self.state.lock();
            if !state.active.as_ref().is_some_and(|a| a.id == endpoint_id) {
                drop(state);
                self.discard(endpoint_id, "failure");
                return FailureReport::Discarded;
            }
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.consecutive_failures
        };

        self.registry.record_outcome(endpoint_id, false, 0);
        self.selector.adjust_weight(endpoint_id, false, 0);
        let registry_failures = self
            .registry
            .get(endpoint_id)
            .map(|e| e.consecutive_failures)
            .unwrap_or_default();
        tracing::warn!(
            endpoint_id = %endpoint_id,
            failures,
            registry_failures,
            error,
            "request through active endpoint failed"
        );

        if failures < self.policy.failure_trigger && registry_failures < self.policy.failure_trigger {
            return FailureReport::Recorded;
        }
        if self.shutdown.is_cancelled() {
            return FailureReport::Recorded;
        }

        let reason = format!("{failures} consecutive failures: {error}");
        match self.try_begin_switch(&reason) {
            Some(guard) => {
                self.spawn_switch(guard, reason, self.policy.strategy);
                FailureReport::SwitchStarted
            }
            None => FailureReport::Recorded,
        }
    }

    /// Start a switch to the best-scoring backup without waiting for the
    /// failure trigger. Cooldown and attempt budget still apply.
    pub fn switch_to_backup(self: &Arc<Self>, reason: &str) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match self.try_begin_switch(reason) {
            Some(guard) => {
                self.spawn_switch(guard, reason.to_string(), StrategyKind::PerformanceBased);
                true
            }
            None => false,
        }
    }

    fn acquire_guard(&self) -> Option<SwitchGuard> {
        self.is_switching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SwitchGuard {
                flag: self.is_switching.clone(),
            })
    }

    /// Take the single-flight guard and do the start-of-switch bookkeeping, or
    /// return `None` when a switch is running, cooling down, or out of budget.
    fn try_begin_switch(&self, reason: &str) -> Option<SwitchGuard> {
        let Some(guard) = self.acquire_guard() else {
            tracing::debug!("switch already in flight");
            return None;
        };

        {
            let mut state = self.state.lock();
            if let Some(last) = state.last_switch {
                let elapsed = last.elapsed();
                if elapsed < self.policy.cooldown {
                    tracing::debug!(?elapsed, "within switch cooldown");
                    return None;
                }
            }
            if state.switch_attempts >= self.policy.max_switch_attempts {
                tracing::warn!(attempts = state.switch_attempts, "switch attempt budget spent");
                return None;
            }
            state.switch_attempts += 1;
            state.last_switch = Some(Instant::now());
            state.last_switch_at = Some(Utc::now());
            state.phase = FailoverState::Switching;
        }

        tracing::info!(reason, "failover started");
        self.emit(FailoverEvent::SwitchStarted {
            reason: reason.to_string(),
        });
        Some(guard)
    }

    fn spawn_switch(self: &Arc<Self>, guard: SwitchGuard, reason: String, kind: StrategyKind) {
        let this = self.clone();
        self.tasks.spawn_on(
            async move {
                this.run_switch(&reason, kind).await;
                drop(guard);
            },
            &self.runtime,
        );
    }

    /// Candidates for replacing `exclude_id`: the healthy set, or whatever passes
    /// a quick check when nothing is marked healthy.
    async fn candidate_pool(&self, exclude_id: Option<&str>) -> Vec<Endpoint> {
        let keep = |e: &Endpoint| Some(e.id.as_str()) != exclude_id;
        let healthy: Vec<Endpoint> = self.registry.healthy().into_iter().filter(keep).collect();
        if !healthy.is_empty() {
            return healthy;
        }

        let rest: Vec<Endpoint> = self.registry.all().into_iter().filter(keep).collect();
        tracing::warn!(candidates = rest.len(), "no healthy backup, quick-checking every endpoint");
        self.prober.quick_check_all(rest).await
    }

    async fn run_switch(&self, reason: &str, kind: StrategyKind) {
        let previous = self.active();
        if let Some(prev) = &previous {
            self.registry.mark_unhealthy(&prev.id, reason);
        }
        let exclude_id = previous.as_ref().map(|e| e.id.as_str());

        let mut failed_verifications = 0u32;
        loop {
            let pool = self.candidate_pool(exclude_id).await;
            if pool.is_empty() {
                self.handle_exhaustion(previous.as_ref(), "no usable endpoint left")
                    .await;
                return;
            }
            if failed_verifications >= self.policy.max_verify_retries {
                self.handle_exhaustion(
                    previous.as_ref(),
                    &format!("{failed_verifications} candidates failed verification"),
                )
                .await;
                return;
            }

            let candidate = match self.selector.select(&pool, kind) {
                Ok(c) => c,
                Err(e) => {
                    self.handle_exhaustion(previous.as_ref(), &e.to_string()).await;
                    return;
                }
            };

            if self.prober.quick_check(&candidate).await {
                self.registry.mark_healthy(&candidate.id);
                if let Err(e) = self.commit(candidate, true).await {
                    tracing::error!(error = %e, "failover could not apply the new endpoint");
                }
                return;
            }

            failed_verifications += 1;
            self.registry
                .mark_unhealthy(&candidate.id, "failed verification during failover");
            tracing::warn!(
                endpoint_id = %candidate.id,
                attempt = failed_verifications,
                "candidate failed verification, trying the next one"
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.abandon_switch("shutdown");
                    return;
                }
                _ = tokio::time::sleep(self.policy.verify_backoff) => {}
            }
        }
    }

    fn abandon_switch(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            state.phase = if state.active.is_some() {
                FailoverState::Stable
            } else {
                FailoverState::Idle
            };
        }
        self.switch_failures_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(reason, "switch abandoned");
        self.emit(FailoverEvent::SwitchFailed {
            reason: reason.to_string(),
        });
    }

    /// No replacement was found: give the previous endpoint one more chance,
    /// otherwise drop it and report exhaustion.
    async fn handle_exhaustion(&self, previous: Option<&Endpoint>, detail: &str) {
        let err = PoolError::Exhaustion(detail.to_string());
        tracing::error!(error = %err, "failover exhausted");
        self.switch_failures_total.fetch_add(1, Ordering::Relaxed);
        self.emit(FailoverEvent::SwitchFailed {
            reason: err.to_string(),
        });

        if let Some(prev) = previous {
            if self.prober.quick_check(prev).await {
                self.registry.mark_healthy(&prev.id);
                let mut state = self.state.lock();
                state.consecutive_failures = 0;
                state.phase = FailoverState::Stable;
                tracing::info!(endpoint_id = %prev.id, "previous endpoint recovered, keeping it");
                return;
            }
        }

        let dropped = {
            let mut state = self.state.lock();
            state.phase = FailoverState::Exhausted;
            state.active.take()
        };
        if let Some(old) = dropped {
            self.emit(FailoverEvent::ActiveChanged {
                from: Some(old.id),
                to: None,
            });
        }
    }

    /// Hand `endpoint` to the tunnel configurator and make it active. Manual
    /// activation does not start a cooldown window, `is_switch` commits do.
    async fn commit(&self, endpoint: Endpoint, is_switch: bool) -> Result<(), PoolError> {
        if let Err(e) = self.tunnel.apply_active_endpoint(&endpoint).await {
            let err = PoolError::Commit {
                endpoint_id: endpoint.id.clone(),
                message: format!("{e:#}"),
            };
            {
                let mut state = self.state.lock();
                state.phase = if state.active.is_some() {
                    FailoverState::Stable
                } else {
                    FailoverState::Exhausted
                };
            }
            self.switch_failures_total.fetch_add(1, Ordering::Relaxed);
            self.emit(FailoverEvent::SwitchFailed {
                reason: err.to_string(),
            });
            return Err(err);
        }

        let previous = {
            let mut state = self.state.lock();
            let previous = state.active.replace(endpoint.clone());
            state.consecutive_failures = 0;
            state.switch_attempts = 0;
            if is_switch {
                state.last_switch = Some(Instant::now());
            }
            state.last_switch_at = Some(Utc::now());
            state.phase = FailoverState::Stable;
            previous
        };
        self.switches_total.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            from = previous.as_ref().map(|e| e.id.as_str()).unwrap_or("-"),
            to = %endpoint.id,
            address = %endpoint.authority(),
            protocol = %endpoint.protocol,
            "active endpoint committed"
        );
        if previous.as_ref().map(|e| &e.id) != Some(&endpoint.id) {
            self.emit(FailoverEvent::ActiveChanged {
                from: previous.map(|e| e.id),
                to: Some(endpoint.id.clone()),
            });
        }
        self.emit(FailoverEvent::SwitchCompleted {
            endpoint: endpoint.id,
        });
        Ok(())
    }

    /// Make a registered endpoint active right away, bypassing selection.
    pub async fn activate(&self, endpoint_id: &str) -> Result<(), PoolError> {
        let endpoint = self
            .registry
            .get(endpoint_id)
            .ok_or_else(|| PoolError::UnknownEndpoint(endpoint_id.to_string()))?;
        let _guard = self.acquire_guard().ok_or(PoolError::SwitchInProgress)?;
        self.commit(endpoint, false).await
    }

    /// Choose and commit the first endpoint: the best pre-warmed candidates are
    /// tried in order, then anything that passes a quick check.
    pub async fn bootstrap(&self) -> Result<Endpoint, PoolError> {
        let _guard = self.acquire_guard().ok_or(PoolError::SwitchInProgress)?;

        let all = self.registry.all();
        for candidate in self.selector.pre_warm(&all, PRE_WARM_COUNT) {
            if self.prober.quick_check(&candidate).await {
                self.commit(candidate.clone(), false).await?;
                return Ok(candidate);
            }
            tracing::debug!(endpoint_id = %candidate.id, "pre-warmed candidate failed quick check");
        }

        let passed = self.prober.quick_check_all(all).await;
        let chosen = self.selector.select(&passed, self.policy.strategy)?;
        self.registry.mark_healthy(&chosen.id);
        self.commit(chosen.clone(), false).await?;
        Ok(chosen)
    }

    /// Move to the registry's best endpoint if it beats the active one by the
    /// rebalance margin. Returns `false` when a switch is running, nothing is
    /// selectable, or the commit failed.
    pub async fn switch_to_optimal(&self) -> bool {
        if self.is_switching() {
            tracing::debug!("rebalance skipped, switch in flight");
            return false;
        }
        let Some(optimal) = self.registry.best() else {
            tracing::warn!("rebalance found no healthy endpoint");
            return false;
        };

        if let Some(current) = self.active() {
            if current.id == optimal.id {
                return true;
            }
            let current_score = self
                .registry
                .get(&current.id)
                .unwrap_or(current)
                .performance_score();
            let optimal_score = optimal.performance_score();
            if optimal_score <= current_score * self.policy.rebalance_margin {
                tracing::debug!(
                    optimal = %optimal.id,
                    optimal_score,
                    current_score,
                    "active endpoint kept, improvement below margin"
                );
                return true;
            }
        }

        let Some(_guard) = self.acquire_guard() else {
            return false;
        };
        tracing::info!(endpoint_id = %optimal.id, "rebalancing to a better endpoint");
        self.commit(optimal, true).await.is_ok()
    }

    /// Stop accepting switches and wait for a running one to finish its
    /// current verification step.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("failover controller stopped");
    }
}
