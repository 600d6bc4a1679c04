use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use outpost_common::Endpoint;
use outpost_pool::snapshot;
use serde::{Deserialize, Serialize};

use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

pub const ENDPOINTS_PATH: &str = "/v1/endpoints";
pub const FAILOVER_PATH: &str = "/v1/failover";
pub const REPORT_PATH: &str = "/v1/report";
pub const REBALANCE_PATH: &str = "/v1/rebalance";

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Serialize)]
pub struct EndpointView {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub success_rate: f64,
    pub performance_score: f64,
    pub dynamic_weight: u32,
}

pub async fn list_endpoints(State(st): State<AppState>) -> Json<Vec<EndpointView>> {
    let mut endpoints = st.pool.registry.all();
    endpoints.sort_by(|a, b| a.id.cmp(&b.id));
    let views = endpoints
        .into_iter()
        .map(|endpoint| EndpointView {
            success_rate: endpoint.success_rate(),
            performance_score: endpoint.performance_score(),
            dynamic_weight: st.pool.selector.weight(&endpoint.id),
            endpoint,
        })
        .collect();
    Json(views)
}

pub async fn failover_stats(State(st): State<AppState>) -> Response {
    (StatusCode::OK, Json(st.pool.failover.stats())).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub endpoint_id: String,
    pub success: bool,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ReportResponse {
    pub accepted: bool,
    pub switch_triggered: bool,
}

/// Outcome of one forwarded connection, as seen by the data plane.
pub async fn report(State(st): State<AppState>, Json(req): Json<ReportRequest>) -> Json<ReportResponse> {
    let failover = &st.pool.failover;

    let resp = if req.success {
        ReportResponse {
            accepted: failover.report_success(&req.endpoint_id, req.response_time_ms.unwrap_or(0)),
            switch_triggered: false,
        }
    } else {
        let error = req.error.as_deref().unwrap_or("unspecified failure");
        let outcome = failover.report_failure(&req.endpoint_id, error);
        ReportResponse {
            accepted: outcome.accepted(),
            switch_triggered: outcome.switch_started(),
        }
    };
    Json(resp)
}

pub async fn rebalance(State(st): State<AppState>) -> Response {
    let ok = st.pool.failover.switch_to_optimal().await;
    if let Some(store) = &st.snapshot {
        if let Err(e) = snapshot::persist(&st.pool.registry, store.as_ref()).await {
            tracing::warn!(error = %e, "snapshot save after rebalance failed");
        }
    }
    (StatusCode::OK, Json(serde_json::json!({ "ok": ok }))).into_response()
}

pub fn router(st: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route(ENDPOINTS_PATH, get(list_endpoints))
        .route(FAILOVER_PATH, get(failover_stats))
        .route(REPORT_PATH, post(report))
        .route(REBALANCE_PATH, post(rebalance))
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use outpost_common::{PoolError, ProtocolKind};
    use outpost_pool::{MemorySnapshotStore, Pool, PoolConfig, ProbeTransport, SnapshotStore, TunnelConfigurator};

    use crate::metrics::{self, Metrics};

    struct AlwaysUp;

    #[async_trait]
    impl ProbeTransport for AlwaysUp {
        async fn connect(&self, _endpoint: &Endpoint) -> Result<(), PoolError> {
            Ok(())
        }

        async fn fetch(&self, _endpoint: &Endpoint, _url: &str) -> Result<u16, PoolError> {
            Ok(204)
        }
    }

    struct NoopTunnel;

    #[async_trait]
    impl TunnelConfigurator for NoopTunnel {
        async fn apply_active_endpoint(&self, _endpoint: &Endpoint) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn make_ep(id: &str, latency: u64) -> Endpoint {
        let mut ep = Endpoint::new(id, id, ProtocolKind::Http, "10.0.0.1", 3128, BTreeMap::new())
            .unwrap();
        ep.latency_ms = Some(latency);
        ep
    }

    fn app_state() -> (AppState, Arc<MemorySnapshotStore>) {
        let pool = Pool::new(&PoolConfig::default(), Arc::new(AlwaysUp), Arc::new(NoopTunnel)).unwrap();
        pool.registry.add(make_ep("a", 100)).unwrap();
        pool.registry.add(make_ep("b", 20)).unwrap();
        let store = Arc::new(MemorySnapshotStore::new());
        let st = AppState {
            pool,
            snapshot: Some(store.clone() as Arc<dyn SnapshotStore>),
            metrics: Arc::new(Metrics::default()),
        };
        (st, store)
    }

    #[tokio::test]
    async fn test_report_routes_by_outcome() {
        let (st, _) = app_state();
        st.pool.failover.activate("a").await.unwrap();

        let Json(resp) = report(
            State(st.clone()),
            Json(ReportRequest {
                endpoint_id: "a".to_string(),
                success: true,
                response_time_ms: Some(80),
                error: None,
            }),
        )
        .await;
        assert_eq!(resp, ReportResponse { accepted: true, switch_triggered: false });

        let Json(resp) = report(
            State(st.clone()),
            Json(ReportRequest {
                endpoint_id: "b".to_string(),
                success: false,
                response_time_ms: None,
                error: Some("reset".to_string()),
            }),
        )
        .await;
        assert_eq!(resp, ReportResponse { accepted: false, switch_triggered: false });
        assert_eq!(st.pool.registry.get("a").unwrap().total_requests, 1);
    }

    #[tokio::test]
    async fn test_report_failure_flags_the_switch() {
        let (st, _) = app_state();
        st.pool.failover.activate("a").await.unwrap();

        let failure = || ReportRequest {
            endpoint_id: "a".to_string(),
            success: false,
            response_time_ms: None,
            error: Some("reset".to_string()),
        };
        for _ in 0..2 {
            let Json(resp) = report(State(st.clone()), Json(failure())).await;
            assert_eq!(resp, ReportResponse { accepted: true, switch_triggered: false });
        }
        let Json(resp) = report(State(st.clone()), Json(failure())).await;
        assert_eq!(resp, ReportResponse { accepted: true, switch_triggered: true });
    }

    #[tokio::test]
    async fn test_router_counts_control_routes() {
        let (st, _) = app_state();
        st.pool.failover.activate("a").await.unwrap();
        let app = router(st.clone());

        let report_body = r#"{"endpoint_id":"a","success":true,"response_time_ms":40}"#;
        for _ in 0..2 {
            let req = Request::post(REPORT_PATH)
                .header("content-type", "application/json")
                .body(Body::from(report_body))
                .unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let req = Request::post(REBALANCE_PATH).body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::OK);
        let req = Request::get("/healthz").body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::OK);
        let req = Request::post(REPORT_PATH)
            .header("content-type", "application/json")
            .body(Body::from("{"))
            .unwrap();
        assert!(app.oneshot(req).await.unwrap().status().is_client_error());

        let m = &st.metrics;
        assert_eq!(m.requests_total.load(Ordering::Relaxed), 5);
        assert_eq!(m.report_requests.load(Ordering::Relaxed), 3);
        assert_eq!(m.rebalance_requests.load(Ordering::Relaxed), 1);
        assert_eq!(m.control_errors.load(Ordering::Relaxed), 1);
        assert_eq!(m.status_2xx.load(Ordering::Relaxed), 4);
        assert_eq!(m.requests_inflight.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_rebalance_switches_and_saves() {
        let (st, store) = app_state();
        st.pool.failover.activate("a").await.unwrap();

        let resp = rebalance(State(st.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(st.pool.failover.active().unwrap().id, "b");
        assert!(store.load().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_endpoints_and_metrics() {
        let (st, _) = app_state();
        let Json(views) = list_endpoints(State(st.clone())).await;
        let ids: Vec<&str> = views.iter().map(|v| v.endpoint.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(views[0].success_rate, 1.0);
        assert_eq!(views[0].dynamic_weight, 100);

        let body = metrics::render(&st);
        assert!(body.contains("outpost_endpoints_total 2\n"));
        assert!(body.contains("outpost_switches_total 0\n"));
    }
}
