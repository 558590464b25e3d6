//! REST API for meter inventory, on-demand collection and metrics

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::collector::{Collector, CycleReport, DeviceProbe};
use crate::modbus::Endpoint;
use crate::store::{Meter, MeterInput};

#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<Collector>,
    /// Present when the Prometheus recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

fn not_found(id: u32) -> ApiError {
    api_error(StatusCode::NOT_FOUND, format!("Meter {} not found", id))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub meters: usize,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/meters", get(list_meters).post(create_meter))
        .route(
            "/api/meters/:id",
            get(get_meter).put(update_meter).delete(delete_meter),
        )
        .route("/api/meters/:id/test", get(test_meter))
        .route("/api/meters/:id/collect", axum::routing::post(collect_meter))
        .route("/api/test_device", get(test_device))
        .route("/metrics", get(render_metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let meters = state.collector.store().read().await.list().len();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        meters,
    })
}

async fn list_meters(State(state): State<AppState>) -> Json<Vec<Meter>> {
    Json(state.collector.store().read().await.list().to_vec())
}

async fn get_meter(State(state): State<AppState>, Path(id): Path<u32>) -> ApiResult<Meter> {
    state
        .collector
        .store()
        .read()
        .await
        .get(id)
        .cloned()
        .map(Json)
        .ok_or_else(|| not_found(id))
}

async fn create_meter(
    State(state): State<AppState>,
    Json(input): Json<MeterInput>,
) -> Result<(StatusCode, Json<Meter>), ApiError> {
    let meter = state
        .collector
        .store()
        .write()
        .await
        .create(input)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("{:#}", e)))?;
    Ok((StatusCode::CREATED, Json(meter)))
}

async fn update_meter(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    Json(input): Json<MeterInput>,
) -> ApiResult<Meter> {
    let mut store = state.collector.store().write().await;
    if store.get(id).is_none() {
        return Err(not_found(id));
    }
    store
        .update(id, input)
        .map(Json)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("{:#}", e)))
}

async fn delete_meter(State(state): State<AppState>, Path(id): Path<u32>) -> Result<StatusCode, ApiError> {
    let deleted = state.collector.store().write().await.delete(id);
    match deleted {
        Ok(true) => {
            state.collector.forget_meter(id).await;
            Ok(StatusCode::NO_CONTENT)
        }
        Ok(false) => Err(not_found(id)),
        Err(e) => {
            error!("Failed to delete meter {}: {:#}", id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
        }
    }
}

async fn test_meter(State(state): State<AppState>, Path(id): Path<u32>) -> ApiResult<DeviceProbe> {
    if state.collector.store().read().await.get(id).is_none() {
        return Err(not_found(id));
    }
    state
        .collector
        .probe(id)
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
}

#[derive(Debug, Deserialize)]
pub struct TestDeviceQuery {
    pub ip: String,
    #[serde(default = "default_unit")]
    pub unit: u8,
    pub port: Option<u16>,
}

fn default_unit() -> u8 {
    1
}

/// Probe a device that is not yet in the inventory
async fn test_device(
    State(state): State<AppState>,
    Query(query): Query<TestDeviceQuery>,
) -> ApiResult<DeviceProbe> {
    if query.ip.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "ip must not be empty"));
    }
    let settings = state.collector.settings();
    let endpoint = Endpoint {
        host: query.ip.clone(),
        port: query.port.unwrap_or(settings.default_port),
        unit_id: query.unit,
        request_timeout: settings.request_timeout,
    };
    Ok(Json(state.collector.probe_endpoint(&query.ip, &endpoint).await))
}

async fn collect_meter(State(state): State<AppState>, Path(id): Path<u32>) -> ApiResult<CycleReport> {
    if state.collector.store().read().await.get(id).is_none() {
        return Err(not_found(id));
    }
    info!("On-demand collection for meter {}", id);
    state
        .collector
        .collect_meter(id)
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, format!("{:#}", e)))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => api_error(StatusCode::NOT_FOUND, "Metrics are disabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorSettings;
    use crate::config::Config;
    use crate::store::MeterStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn app(dir: &std::path::Path) -> Router {
        let store = MeterStore::open(dir.join("meters.json")).unwrap();
        let mut settings = CollectorSettings::from_config(&Config::default());
        settings.default_port = 9;
        let collector = Collector::new(Arc::new(RwLock::new(store)), settings);
        create_router(AppState {
            collector: Arc::new(collector),
            metrics: None,
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path()).oneshot(get_request("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["meters"], 0);
    }

    #[tokio::test]
    async fn test_meter_crud() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/meters",
                serde_json::json!({"serial_number": "AC123", "ip_address": "127.0.0.1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["id"], 1);
        assert_eq!(created["last_record_index"], 0);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/meters/1",
                serde_json::json!({"serial_number": "AC123", "ip_address": "10.0.0.9", "enabled": false}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["ip_address"], "10.0.0.9");

        let response = app.clone().oneshot(get_request("/api/meters")).await.unwrap();
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/meters/1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(get_request("/api/meters/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_rejects_blank_serial() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(json_request(
                "POST",
                "/api/meters",
                serde_json::json!({"serial_number": "", "ip_address": "127.0.0.1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_collect_unknown_meter() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(json_request("POST", "/api/meters/42/collect", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_probe_unreachable_meter() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/meters",
                serde_json::json!({"serial_number": "AC123", "ip_address": "127.0.0.1"}),
            ))
            .await
            .unwrap();

        let response = app.oneshot(get_request("/api/meters/1/test")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["reachable"], false);
        assert!(body["reason"].is_string());
    }

    #[tokio::test]
    async fn test_device_by_address() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let response = app
            .clone()
            .oneshot(get_request("/api/test_device?ip=127.0.0.1&unit=3"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["reachable"], false);
        assert!(body["reason"].is_string());

        let response = app.oneshot(get_request("/api/test_device?ip=")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path()).oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
