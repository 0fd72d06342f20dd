use crate::blacklist;
use crate::config::BlacklistConfig;
use crate::metrics::{now_unix, Metrics};
use crate::state::{CycleSummary, State as DaemonState};
use crate::store::ResultStore;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task;
use tracing::warn;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<DaemonState>>,
    pub store: Arc<dyn ResultStore>,
    pub blacklist: Arc<BlacklistConfig>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiState {
    pub started_at_unix: i64,
    pub last_cycle: Option<CycleSummary>,
    pub blacklist_generated_at: Option<i64>,
    pub blacklist_size: usize,
}

impl From<&DaemonState> for ApiState {
    fn from(value: &DaemonState) -> Self {
        Self {
            started_at_unix: value.started_at_unix,
            last_cycle: value.last_cycle.clone(),
            blacklist_generated_at: value.blacklist_generated_at,
            blacklist_size: value.blacklist_size,
        }
    }
}

pub fn build_router(app_state: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .route("/api/systems/:id", get(system_handler))
        .route("/api/blacklist", get(blacklist_handler))
        .with_state(app_state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    state.metrics.update_from_state(&*state.state.read().await);
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

/// Latest record of one system.
async fn system_handler(State(state): State<HttpAppState>, Path(id): Path<u32>) -> Response {
    let store = Arc::clone(&state.store);
    match task::spawn_blocking(move || store.latest(id)).await {
        Ok(Ok(Some(result))) => Json(result).into_response(),
        Ok(Ok(None)) => (StatusCode::NOT_FOUND, format!("система {id} ещё не проверялась")).into_response(),
        Ok(Err(err)) => {
            warn!(system = id, error = %err, "latest check result unavailable");
            state.metrics.inc_store_error();
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Serves the artifact, regenerating it first if it is missing.
async fn blacklist_handler(State(state): State<HttpAppState>) -> Response {
    let store = Arc::clone(&state.store);
    let cfg = Arc::clone(&state.blacklist);
    let existed = cfg.path.exists();
    let loaded = task::spawn_blocking(move || {
        blacklist::load_or_regenerate(store.as_ref(), &cfg, now_unix())
    })
    .await;

    match loaded {
        Ok(Ok(list)) => {
            if !existed {
                state.metrics.inc_blacklist_generation();
                state
                    .state
                    .write()
                    .await
                    .record_blacklist(list.generated_at, list.systems.len());
            }
            Json(list).into_response()
        }
        Ok(Err(err)) => {
            warn!(error = %err, "blacklist unavailable");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::sample_result;
    use crate::store::SqliteStore;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app_state(store: Arc<SqliteStore>, blacklist: BlacklistConfig) -> HttpAppState {
        HttpAppState {
            metrics: Metrics::new().expect("инициализация метрик"),
            state: Arc::new(RwLock::new(DaemonState::new(10))),
            store,
            blacklist: Arc::new(blacklist),
        }
    }

    fn empty_state() -> HttpAppState {
        app_state(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            BlacklistConfig::default(),
        )
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (status, body) = get_body(build_router(empty_state()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime() {
        let (status, body) = get_body(build_router(empty_state()), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("sysmon_uptime_seconds"));
        assert!(body.contains("sysmon_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn api_state_returns_json() {
        let state = empty_state();
        state.state.write().await.record_cycle(CycleSummary {
            systems_total: 3,
            failed: vec![2],
            ..CycleSummary::default()
        });

        let (status, body) = get_body(build_router(state), "/api/state").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["started_at_unix"], 10);
        assert_eq!(json["last_cycle"]["systems_total"], 3);
        assert_eq!(json["last_cycle"]["failed"][0], 2);
    }

    #[tokio::test]
    async fn system_returns_latest_record() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.insert(&sample_result(4, 100)).unwrap();
        store.insert(&sample_result(4, 200)).unwrap();
        let state = app_state(store, BlacklistConfig::default());

        let (status, body) = get_body(build_router(state.clone()), "/api/systems/4").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["timestamp"], 200);
        assert_eq!(json["application_state"], "html");

        let (status, _) = get_body(build_router(state), "/api/systems/5").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn blacklist_is_generated_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = now_unix();
        for i in 0..10 {
            let mut r = sample_result(9, now - 100 + i);
            r.icmp_request = false;
            r.download = None;
            store.insert(&r).unwrap();
        }
        let cfg = BlacklistConfig {
            path: dir.path().join("blacklist.json"),
            ..BlacklistConfig::default()
        };
        let state = app_state(store, cfg.clone());

        let (status, body) = get_body(build_router(state.clone()), "/api/blacklist").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["systems"], serde_json::json!([9]));
        assert!(cfg.path.exists());
        assert_eq!(state.state.read().await.blacklist_size, 1);
    }
}
