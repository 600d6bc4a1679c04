use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::strategy::StrategyKind;

/// Canary targets for the behavioral probe. One is picked at random per probe.
pub const DEFAULT_CANARY_URLS: &[&str] = &[
    "https://www.google.com/generate_204",
    "https://www.youtube.com/favicon.ico",
    "https://httpbin.org/ip",
];

/// Tunables for the registry, prober, selector and failover controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub probe_interval_ms: u64,
    /// Delay before the next cycle after an internal error.
    pub probe_retry_interval_ms: u64,
    pub transport_timeout_ms: u64,
    pub behavioral_timeout_ms: u64,
    pub canary_urls: Vec<String>,
    pub max_concurrent_probes: usize,
    /// Local SOCKS listener of the proxy engine, used to probe protocols the
    /// host cannot speak natively.
    pub bridge_socks_addr: String,

    pub unhealthy_after_failures: u32,
    pub gc_failure_threshold: u32,
    pub gc_stale_after_ms: u64,

    pub failure_trigger: u32,
    pub switch_cooldown_ms: u64,
    pub max_switch_attempts: u32,
    pub verify_backoff_ms: u64,
    pub max_verify_retries: u32,
    pub rebalance_margin: f64,
    pub strategy: StrategyKind,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            probe_retry_interval_ms: 5_000,
            transport_timeout_ms: 5_000,
            behavioral_timeout_ms: 10_000,
            canary_urls: DEFAULT_CANARY_URLS.iter().map(|u| u.to_string()).collect(),
            max_concurrent_probes: 16,
            bridge_socks_addr: "127.0.0.1:10808".to_string(),
            unhealthy_after_failures: 3,
            gc_failure_threshold: 10,
            gc_stale_after_ms: 24 * 60 * 60 * 1000,
            failure_trigger: 3,
            switch_cooldown_ms: 5_000,
            max_switch_attempts: 3,
            verify_backoff_ms: 1_000,
            max_verify_retries: 5,
            rebalance_margin: 1.2,
            strategy: StrategyKind::Hybrid,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl PoolConfig {
    /// Defaults overlaid with any `OUTPOST_*` environment variables that parse.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("OUTPOST_PROBE_INTERVAL_MS") {
            cfg.probe_interval_ms = v;
        }
        if let Some(v) = env_parse("OUTPOST_PROBE_RETRY_INTERVAL_MS") {
            cfg.probe_retry_interval_ms = v;
        }
        if let Some(v) = env_parse("OUTPOST_TRANSPORT_TIMEOUT_MS") {
            cfg.transport_timeout_ms = v;
        }
        if let Some(v) = env_parse("OUTPOST_BEHAVIORAL_TIMEOUT_MS") {
            cfg.behavioral_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("OUTPOST_CANARY_URLS") {
            let urls: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
            if !urls.is_empty() {
                cfg.canary_urls = urls;
            }
        }
        if let Some(v) = env_parse::<usize>("OUTPOST_MAX_CONCURRENT_PROBES") {
            cfg.max_concurrent_probes = v.max(1);
        }
        if let Ok(v) = std::env::var("OUTPOST_BRIDGE_SOCKS_ADDR") {
            cfg.bridge_socks_addr = v;
        }
        if let Some(v) = env_parse("OUTPOST_SWITCH_COOLDOWN_MS") {
            cfg.switch_cooldown_ms = v;
        }
        if let Some(v) = env_parse("OUTPOST_MAX_SWITCH_ATTEMPTS") {
            cfg.max_switch_attempts = v;
        }
        if let Some(v) = env_parse("OUTPOST_MAX_VERIFY_RETRIES") {
            cfg.max_verify_retries = v;
        }
        if let Some(v) = env_parse("OUTPOST_STRATEGY") {
            cfg.strategy = v;
        }
        cfg
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_retry_interval(&self) -> Duration {
        Duration::from_millis(self.probe_retry_interval_ms)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    pub fn behavioral_timeout(&self) -> Duration {
        Duration::from_millis(self.behavioral_timeout_ms)
    }

    pub fn switch_cooldown(&self) -> Duration {
        Duration::from_millis(self.switch_cooldown_ms)
    }

    pub fn verify_backoff(&self) -> Duration {
        Duration::from_millis(self.verify_backoff_ms)
    }
}
