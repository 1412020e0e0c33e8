use crate::bandwidth::{BandwidthResult, BandwidthTester, Measurement};
use crate::metrics::Metrics;
use crate::reachability::ReachabilityState;
use crate::snapshot::MetricsSnapshot;
use crate::state::State as AgentState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<AgentState>>,
    pub bandwidth: Arc<BandwidthTester>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiState {
    pub started_at_unix: i64,
    pub last_refresh_unix: i64,
    pub last_refresh: Option<String>,
    pub refresh_count: u64,
    pub metrics: MetricsSnapshot,
    pub reachability: ReachabilityState,
    pub reachability_label: &'static str,
    pub bandwidth: BandwidthResult,
}

impl From<&AgentState> for ApiState {
    fn from(value: &AgentState) -> Self {
        Self {
            started_at_unix: value.started_at_unix,
            last_refresh_unix: value.last_refresh_unix,
            last_refresh: rfc3339(value.last_refresh_unix),
            refresh_count: value.refresh_count,
            metrics: value.snapshot.clone(),
            reachability: value.reachability,
            reachability_label: value.reachability.status.label(),
            bandwidth: value.bandwidth.clone(),
        }
    }
}

pub fn build_router(
    metrics: Arc<Metrics>,
    state: Arc<RwLock<AgentState>>,
    bandwidth: Arc<BandwidthTester>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .route("/api/speedtest", post(speedtest_handler))
        .with_state(HttpAppState {
            metrics,
            state,
            bandwidth,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(ApiState::from(&*guard))
}

async fn speedtest_handler(State(state): State<HttpAppState>) -> Json<Measurement> {
    let measurement = state.bandwidth.measure().await;
    state.metrics.inc_speedtest_run(measurement.outcome.as_str());

    let snapshot = {
        let mut guard = state.state.write().await;
        guard.bandwidth = state.bandwidth.last_good();
        guard.clone()
    };
    state.metrics.update_from_state(&snapshot);

    Json(measurement)
}

fn rfc3339(unix: i64) -> Option<String> {
    let secs = u64::try_from(unix).ok().filter(|s| *s > 0)?;
    Some(humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(secs)).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::tests::{exited, install_dir, tester, ScriptedRunner, SAMPLE};
    use crate::bandwidth::TokioCommandRunner;
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app_with(bandwidth: BandwidthTester) -> (Router, Arc<RwLock<AgentState>>) {
        let metrics = Metrics::new().expect("инициализация метрик");
        let state = Arc::new(RwLock::new(AgentState::new(0)));
        (
            build_router(metrics, state.clone(), Arc::new(bandwidth)),
            state,
        )
    }

    fn idle_tester(dir: &std::path::Path) -> BandwidthTester {
        tester(Arc::new(TokioCommandRunner), dir)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app_with(idle_tester(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn metrics_contains_headroom() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app_with(idle_tester(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("hwpulse_psu_headroom_percent"));
        assert!(text.contains("hwpulse_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn api_state_returns_json() {
        let dir = tempfile::tempdir().unwrap();
        let (app, state) = app_with(idle_tester(dir.path()));
        {
            let mut guard = state.write().await;
            guard.last_refresh_unix = 1_700_000_000;
            guard.snapshot.cpu_usage = 12.5;
        }

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["metrics"]["cpu_usage"], 12.5);
        assert_eq!(json["reachability"]["status"], "checking");
        assert_eq!(json["reachability"]["color_hint"], "amber");
        assert_eq!(json["reachability_label"], "Checking...");
        assert_eq!(json["last_refresh"], "2023-11-14T22:13:20Z");
    }

    #[tokio::test]
    async fn speedtest_without_executable_returns_zero_result() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app_with(idle_tester(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/speedtest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["outcome"], "missing_executable");
        assert_eq!(json["result"]["download_mbps"], 0.0);
    }

    #[tokio::test]
    async fn speedtest_result_is_published_to_state() {
        let dir = install_dir();
        let runner = Arc::new(ScriptedRunner::new(Ok(exited(0, SAMPLE, ""))));
        let (app, state) = app_with(tester(runner, dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/speedtest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["outcome"], "measured");
        assert_eq!(json["result"]["upload_mbps"], 50.0);
        assert_eq!(state.read().await.bandwidth.download_mbps, 100.0);
    }
}
