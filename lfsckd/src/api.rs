//! HTTP control surface: one axum route per Public API operation, plus the
//! ambient healthz/metrics endpoints, translating `LfsckError` into a
//! stable status code the way `cognitod::api` translates its own domain
//! errors before responding.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use lfsck_proto::{LfsckError, LfsckRequest, StartParam, StopParam};
use serde::{Deserialize, Serialize};

use crate::config::DaemonConfig;
use crate::control::ControlProtocol;
use crate::fid::{Fid, FidSequenceClient, LocalFidSequence};
use crate::metrics::Metrics;
use crate::registry::InstanceRegistry;
use crate::rpc::InProcessTransport;
use crate::sqlite_store::SqliteStorage;
use crate::store::StorageBackend;
use crate::tdt::TargetDescriptor;

pub struct AppState {
    pub registry: InstanceRegistry,
    pub control: ControlProtocol,
    pub metrics: Arc<Metrics>,
    pub config: DaemonConfig,
}

impl AppState {
    pub fn new(config: DaemonConfig) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());
        let registry = InstanceRegistry::with_metrics(
            std::time::Duration::from_millis(config.runtime.tick_ms),
            config.runtime.default_speed_limit,
            metrics.clone(),
        );
        let control = ControlProtocol::new(Arc::new(InProcessTransport::new()));
        Arc::new(AppState { registry, control, metrics, config })
    }

    async fn open_backend(&self, device: &str) -> Result<Arc<dyn StorageBackend>, LfsckError> {
        let path = if self.config.storage.sqlite_path == ":memory:" {
            ":memory:".to_string()
        } else {
            format!("{}.{device}", self.config.storage.sqlite_path)
        };
        Ok(Arc::new(SqliteStorage::connect(&path).await?))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(e: LfsckError) -> Response {
    log::error!("request failed: {e}");
    let status = match &e {
        LfsckError::AlreadyExists(_) => StatusCode::CONFLICT,
        LfsckError::NotFound(_) | LfsckError::NoSuchDevice(_) => StatusCode::NOT_FOUND,
        LfsckError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        LfsckError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
        LfsckError::AlreadyInState { .. } => StatusCode::CONFLICT,
        LfsckError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody { error: e.to_string() })).into_response()
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    #[serde(default = "default_true")]
    master: bool,
}

fn default_true() -> bool {
    true
}

async fn register(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Json(body): Json<RegisterBody>,
) -> Response {
    let store = match state.open_backend(&device).await {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };
    let fid_client: Arc<dyn FidSequenceClient> = Arc::new(LocalFidSequence::new(4));
    match state.registry.register(&device, body.master, store, fid_client).await {
        Ok(_) => StatusCode::CREATED.into_response(),
        Err(e) => error_response(e),
    }
}

async fn degister(State(state): State<Arc<AppState>>, Path(device): Path<String>) -> Response {
    match state.registry.degister(&device) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct StartBody {
    #[serde(default)]
    start: StartParam,
    objects: Vec<Fid>,
}

async fn start(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Json(body): Json<StartBody>,
) -> Response {
    let Some(instance) = state.registry.find(&device) else {
        return error_response(LfsckError::NoSuchDevice(device));
    };
    match instance.start(body.objects, &body.start).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e),
    }
}

async fn stop(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Json(body): Json<StopParam>,
) -> Response {
    let Some(instance) = state.registry.find(&device) else {
        return error_response(LfsckError::NoSuchDevice(device));
    };
    match instance.stop(&body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn notify(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Json(req): Json<LfsckRequest>,
) -> Response {
    let Some(instance) = state.registry.find(&device) else {
        return error_response(LfsckError::NoSuchDevice(device));
    };
    match state.control.in_notify(&instance, &req).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn query(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Json(req): Json<LfsckRequest>,
) -> Response {
    let Some(instance) = state.registry.find(&device) else {
        return error_response(LfsckError::NoSuchDevice(device));
    };
    match state.control.query(&instance, &req).await {
        Ok(body) => body.into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_speed(State(state): State<Arc<AppState>>, Path(device): Path<String>) -> Response {
    let Some(instance) = state.registry.find(&device) else {
        return error_response(LfsckError::NoSuchDevice(device));
    };
    match instance.bookmark.get_speed().await {
        Ok(body) => body.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct SpeedBody {
    limit: u32,
}

async fn set_speed(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Json(body): Json<SpeedBody>,
) -> Response {
    let Some(instance) = state.registry.find(&device) else {
        return error_response(LfsckError::NoSuchDevice(device));
    };
    match instance.bookmark.set_speed(body.limit).await {
        Ok(()) => {
            instance.governor.set_limit(body.limit);
            StatusCode::OK.into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn get_windows(State(state): State<Arc<AppState>>, Path(device): Path<String>) -> Response {
    let Some(instance) = state.registry.find(&device) else {
        return error_response(LfsckError::NoSuchDevice(device));
    };
    match instance.bookmark.get_windows().await {
        Ok(body) => body.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct WindowsBody {
    windows: u16,
}

async fn set_windows(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Json(body): Json<WindowsBody>,
) -> Response {
    let Some(instance) = state.registry.find(&device) else {
        return error_response(LfsckError::NoSuchDevice(device));
    };
    match instance.bookmark.set_windows(body.windows).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn dump(State(state): State<Arc<AppState>>, Path(device): Path<String>) -> Response {
    let Some(instance) = state.registry.find(&device) else {
        return error_response(LfsckError::NoSuchDevice(device));
    };
    let mut lines = Vec::new();
    for c in instance.components.scan_components() {
        lines.push(c.dump());
    }
    for c in instance.components.double_scan_components() {
        lines.push(c.dump());
    }
    lines.join("\n").into_response()
}

#[derive(Debug, Deserialize)]
struct AddTargetBody {
    index: u16,
    key: String,
    #[serde(default = "default_true")]
    for_ost: bool,
}

async fn add_target(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Json(body): Json<AddTargetBody>,
) -> Response {
    let td = TargetDescriptor::new(body.index, body.key);
    match state.registry.add_target(&device, td, body.for_ost).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct DelTargetQuery {
    #[serde(default = "default_true")]
    for_ost: bool,
}

async fn del_target(
    State(state): State<Arc<AppState>>,
    Path((device, index)): Path<(String, u16)>,
    axum::extract::Query(q): axum::extract::Query<DelTargetQuery>,
) -> Response {
    match state.registry.del_target(&device, index, q.for_ost).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/targets/:device/register", post(register))
        .route("/v1/targets/:device/degister", post(degister))
        .route("/v1/targets/:device/start", post(start))
        .route("/v1/targets/:device/stop", post(stop))
        .route("/v1/targets/:device/notify", post(notify))
        .route("/v1/targets/:device/query", post(query))
        .route("/v1/targets/:device/speed", get(get_speed).put(set_speed))
        .route("/v1/targets/:device/windows", get(get_windows).put(set_windows))
        .route("/v1/targets/:device/dump", get(dump))
        .route("/v1/targets/:device/targets", post(add_target))
        .route("/v1/targets/:device/targets/:index", delete(del_target))
        .route("/v1/healthz", get(healthz))
        .route("/v1/metrics", get(metrics))
        .with_state(state)
}
