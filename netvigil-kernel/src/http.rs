/*!
 * API HTTP NETVIGIL - Ingestion collecteur + vues d'état + WebSocket
 *
 * RÔLE :
 * Expose les endpoints du collecteur (`/ping`, `/snmp`), l'endpoint
 * observateurs (`/ws`) et les vues d'administration (`/health`,
 * `/system/health`, `/stats`, `/devices`).
 *
 * FONCTIONNEMENT :
 * - Corps d'ingestion : tableau JSON obligatoire (400 sinon) ; réponse 204
 *   même si une partie des enregistrements est ignorée, bilan en en-têtes
 *   `x-ingest-processed` / `x-ingest-skipped` / `x-ingest-errors`
 * - Taille de corps bornée (`http.max_body_bytes`)
 *
 * SÉCURITÉ :
 * - Si une clé est configurée, header `x-api-key` obligatoire hors `/health`
 */

use crate::cache::CacheManager;
use crate::health::{HealthTracker, KernelHealth};
use crate::hub::{serve_socket, Hub};
use crate::ingest::{IngestReport, MetricIngestor};
use crate::models::DeviceSnapshot;
use crate::writer::BatchWriter;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<MetricIngestor>,
    pub hub: Hub,
    pub cache: CacheManager,
    pub writer: BatchWriter,
    pub health_tracker: HealthTracker,
    pub api_key: Option<String>,
}

pub fn build_router(app_state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/stats", get(get_stats))
        .route("/ping", post(post_ping))
        .route("/snmp", post(post_snmp))
        .route("/devices", get(get_devices))
        .route("/devices/{id}", get(get_device))
        .route("/ws", get(ws_upgrade))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

fn is_authorized(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };
    // liveness toujours accessible
    if req.uri().path() == "/health" || is_authorized(req.headers(), expected) {
        return Ok(next.run(req).await);
    }
    warn!("[http] rejected unauthenticated request to {}", req.uri().path());
    Err(StatusCode::UNAUTHORIZED)
}

/// Le corps doit être un tableau JSON d'enregistrements
fn array_body(body: Result<Json<Value>, JsonRejection>) -> Result<Vec<Value>, Response> {
    match body {
        Ok(Json(Value::Array(records))) => Ok(records),
        Ok(_) => Err((StatusCode::BAD_REQUEST, Json(json!({ "error": "body must be a JSON array" }))).into_response()),
        Err(rejection) => {
            let status = match rejection.status() {
                StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
            Err((status, Json(json!({ "error": rejection.body_text() }))).into_response())
        }
    }
}

fn report_response(report: IngestReport) -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (HeaderName::from_static("x-ingest-processed"), HeaderValue::from(report.processed)),
            (HeaderName::from_static("x-ingest-skipped"), HeaderValue::from(report.skipped)),
            (HeaderName::from_static("x-ingest-errors"), HeaderValue::from(report.errors)),
        ],
    )
        .into_response()
}

// POST /ping
async fn post_ping(State(app): State<AppState>, body: Result<Json<Value>, JsonRejection>) -> Response {
    match array_body(body) {
        Ok(records) => report_response(app.ingestor.ingest_ping_batch(&records).await),
        Err(response) => response,
    }
}

// POST /snmp
async fn post_snmp(State(app): State<AppState>, body: Result<Json<Value>, JsonRejection>) -> Response {
    match array_body(body) {
        Ok(records) => report_response(app.ingestor.ingest_snmp_batch(&records).await),
        Err(response) => response,
    }
}

async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.collect(&app).await)
}

async fn get_stats(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "writer": app.writer.stats(),
        "ingest": app.ingestor.counters(),
        "flapping": { "interfacesTracked": app.ingestor.flapping().tracked() },
        "observers": app.hub.client_count(),
        "droppedObserverMessages": app.hub.dropped_messages(),
    }))
}

// GET /devices
async fn get_devices(State(app): State<AppState>) -> Json<Vec<DeviceSnapshot>> {
    Json(app.ingestor.devices().await)
}

// GET /devices/{id}
async fn get_device(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<DeviceSnapshot>, StatusCode> {
    app.ingestor.device(&id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn ws_upgrade(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, app.hub))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ingest::test_support::{pipeline, Pipeline};

    pub async fn app_state(connect_cache: bool) -> (AppState, Pipeline) {
        let p = pipeline(100, connect_cache).await;
        let app = AppState {
            ingestor: p.ingestor.clone(),
            hub: p.hub.clone(),
            cache: p.cache.clone(),
            writer: p.writer.clone(),
            health_tracker: HealthTracker::new(),
            api_key: None,
        };
        (app, p)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::app_state;
    use super::*;
    use netvigil_devkit::collector::{interface_metric, ping_metric};

    fn header(response: &Response, name: &str) -> String {
        response.headers().get(name).and_then(|v| v.to_str().ok()).unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_post_ping_returns_no_content_with_counts() {
        let (app, _p) = app_state(true).await;
        let body = json!([ping_metric("10.0.0.1", Some(12.0), 0.0), ping_metric("172.16.0.1", Some(12.0), 0.0)]);

        let response = post_ping(State(app.clone()), Ok(Json(body))).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&response, "x-ingest-processed"), "1");
        assert_eq!(header(&response, "x-ingest-skipped"), "1");
        assert_eq!(header(&response, "x-ingest-errors"), "0");
    }

    #[tokio::test]
    async fn test_non_array_body_is_bad_request() {
        let (app, _p) = app_state(true).await;
        let response = post_ping(State(app.clone()), Ok(Json(json!({"name": "ping"})))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = post_snmp(State(app), Ok(Json(json!("nope")))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_post_snmp_and_device_views() {
        let (app, _p) = app_state(true).await;
        let body = json!([interface_metric("10.0.0.2:161", 1, "ge-0/0/1", "up", Some(1000.0))]);
        let response = post_snmp(State(app.clone()), Ok(Json(body))).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&response, "x-ingest-processed"), "1");

        post_ping(State(app.clone()), Ok(Json(json!([ping_metric("10.0.0.1", Some(12.0), 0.0)])))).await;
        let Json(devices) = get_devices(State(app.clone())).await;
        assert_eq!(devices.len(), 1);

        let Json(device) = get_device(State(app.clone()), Path("core-1".into())).await.unwrap();
        assert_eq!(device.device_id, "core-1");
        assert_eq!(get_device(State(app), Path("missing".into())).await.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stats_view() {
        let (app, _p) = app_state(true).await;
        post_ping(State(app.clone()), Ok(Json(json!([ping_metric("10.0.0.1", Some(12.0), 0.0)])))).await;
        let Json(stats) = get_stats(State(app)).await;
        assert_eq!(stats["ingest"]["processed"], 1);
        assert_eq!(stats["writer"]["queueLen"], 1);
    }

    #[test]
    fn test_api_key_check() {
        let mut headers = HeaderMap::new();
        assert!(!is_authorized(&headers, "secret"));
        headers.insert("x-api-key", HeaderValue::from_static("wrong"));
        assert!(!is_authorized(&headers, "secret"));
        headers.insert("x-api-key", HeaderValue::from_static("secret"));
        assert!(is_authorized(&headers, "secret"));
    }

    mod router {
        use super::super::test_support::app_state;
        use super::super::*;
        use axum::body::{self, Body};
        use axum::http::Request;
        use netvigil_devkit::collector::ping_metric;
        use tower::ServiceExt; // pour `oneshot`

        fn get(uri: &str) -> Request<Body> {
            Request::builder().uri(uri).body(Body::empty()).unwrap()
        }

        fn post_json(uri: &str, body: String) -> Request<Body> {
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap()
        }

        #[tokio::test]
        async fn test_routes_are_wired() {
            let (app, _p) = app_state(true).await;
            let router = build_router(app, 1 << 20);

            let health = router.clone().oneshot(get("/health")).await.unwrap();
            assert_eq!(health.status(), StatusCode::OK);
            let text = body::to_bytes(health.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&text[..], b"ok");

            let body = json!([ping_metric("10.0.0.1", Some(12.0), 0.0)]).to_string();
            let ingested = router.clone().oneshot(post_json("/ping", body)).await.unwrap();
            assert_eq!(ingested.status(), StatusCode::NO_CONTENT);
            assert_eq!(ingested.headers()["x-ingest-processed"], "1");

            let device = router.clone().oneshot(get("/devices/core-1")).await.unwrap();
            assert_eq!(device.status(), StatusCode::OK);
            let raw = body::to_bytes(device.into_body(), usize::MAX).await.unwrap();
            let snapshot: Value = serde_json::from_slice(&raw).unwrap();
            assert_eq!(snapshot["deviceId"], "core-1");

            let missing = router.oneshot(get("/devices/nope")).await.unwrap();
            assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn test_api_key_guards_everything_but_liveness() {
            let (mut app, _p) = app_state(true).await;
            app.api_key = Some("secret".into());
            let router = build_router(app, 1 << 20);

            assert_eq!(router.clone().oneshot(get("/health")).await.unwrap().status(), StatusCode::OK);
            assert_eq!(router.clone().oneshot(get("/stats")).await.unwrap().status(), StatusCode::UNAUTHORIZED);

            let body = json!([ping_metric("10.0.0.1", Some(12.0), 0.0)]).to_string();
            let rejected = router.clone().oneshot(post_json("/ping", body)).await.unwrap();
            assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

            let keyed = Request::builder().uri("/stats").header("x-api-key", "secret").body(Body::empty()).unwrap();
            assert_eq!(router.oneshot(keyed).await.unwrap().status(), StatusCode::OK);
        }

        #[tokio::test]
        async fn test_oversized_and_untyped_bodies() {
            let (app, _p) = app_state(true).await;
            let router = build_router(app, 256);

            let records: Vec<Value> = (0..20).map(|_| ping_metric("10.0.0.1", Some(12.0), 0.0)).collect();
            let oversized = router.clone().oneshot(post_json("/ping", json!(records).to_string())).await.unwrap();
            assert_eq!(oversized.status(), StatusCode::PAYLOAD_TOO_LARGE);

            let untyped = Request::builder().method("POST").uri("/snmp").body(Body::from("[]")).unwrap();
            assert_eq!(router.oneshot(untyped).await.unwrap().status(), StatusCode::BAD_REQUEST);
        }
    }
}
