use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::handlers::{REBALANCE_PATH, REPORT_PATH};
use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    /// Outcome reports from the data plane, including rejected bodies.
    pub report_requests: AtomicU64,
    pub rebalance_requests: AtomicU64,
    /// Non-2xx answers on the report and rebalance routes.
    pub control_errors: AtomicU64,
}

pub fn render(st: &AppState) -> String {
    let registry = st.pool.registry.stats();
    let failover = st.pool.failover.stats();
    format!(
        "outpost_agent_requests_total {}\n\
         outpost_agent_requests_inflight {}\n\
         outpost_agent_responses_2xx {}\n\
         outpost_agent_responses_4xx {}\n\
         outpost_agent_responses_5xx {}\n\
         outpost_agent_report_requests_total {}\n\
         outpost_agent_rebalance_requests_total {}\n\
         outpost_agent_control_errors_total {}\n\
         outpost_endpoints_total {}\n\
         outpost_endpoints_healthy {}\n\
         outpost_health_cycles_total {}\n\
         outpost_switches_total {}\n\
         outpost_switch_failures_total {}\n\
         outpost_discarded_reports_total {}\n",
        st.metrics.requests_total.load(Ordering::Relaxed),
        st.metrics.requests_inflight.load(Ordering::Relaxed),
        st.metrics.status_2xx.load(Ordering::Relaxed),
        st.metrics.status_4xx.load(Ordering::Relaxed),
        st.metrics.status_5xx.load(Ordering::Relaxed),
        st.metrics.report_requests.load(Ordering::Relaxed),
        st.metrics.rebalance_requests.load(Ordering::Relaxed),
        st.metrics.control_errors.load(Ordering::Relaxed),
        registry.total,
        registry.healthy,
        st.pool.prober.cycles_total(),
        failover.switches_total,
        failover.switch_failures_total,
        failover.discarded_reports_total,
    )
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, render(&st))
}

fn control_counter<'a>(metrics: &'a Metrics, path: &str) -> Option<&'a AtomicU64> {
    match path {
        REPORT_PATH => Some(&metrics.report_requests),
        REBALANCE_PATH => Some(&metrics.rebalance_requests),
        _ => None,
    }
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    let metrics = &st.metrics;
    let control = control_counter(metrics, req.uri().path());
    if let Some(counter) = control {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status();
    let bucket = match status.as_u16() {
        500.. => Some(&metrics.status_5xx),
        400..=499 => Some(&metrics.status_4xx),
        200..=299 => Some(&metrics.status_2xx),
        _ => None,
    };
    if let Some(bucket) = bucket {
        bucket.fetch_add(1, Ordering::Relaxed);
    }
    if control.is_some() && !status.is_success() {
        metrics.control_errors.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(status = %status, "control request rejected");
    }

    Ok(resp)
}
