use crate::error::PoolError;
use crate::util::now_ms;

/// Outcome of one transport + behavioral probe against an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthResult {
    pub is_healthy: bool,
    /// Wall-clock probe latency; only present on success.
    pub latency_ms: Option<u64>,
    pub error: Option<PoolError>,
    pub checked_at_ms: u64,
}

impl HealthResult {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            is_healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
            checked_at_ms: now_ms(),
        }
    }

    pub fn unhealthy(error: PoolError) -> Self {
        Self {
            is_healthy: false,
            latency_ms: None,
            error: Some(error),
            checked_at_ms: now_ms(),
        }
    }
}
