//! HTTP/WebSocket host
//!
//! This module provides:
//! - REST endpoints under `/api/v1` mapping onto [`WuRemoteService`]
//! - A `/api/v1/callbacks` WebSocket that joins the observer broadcast

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::broadcast::{CallbackEvent, DeliveryError, Liveness, Observer};
use crate::service::WuRemoteService;
use crate::update::{
    FaultKind, ProgressSnapshot, ServiceError, Settings, UpdateDescriptor, WuState, WuStatus,
};

/// Shared state for HTTP handlers
pub struct AppState {
    pub service: Arc<WuRemoteService>,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Serialize)]
struct ApiError {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<i32>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn api_error(err: ServiceError) -> (StatusCode, Json<ApiError>) {
    let fault = err.fault();
    let status = match fault.kind {
        FaultKind::InvalidTransition | FaultKind::PreconditionNotFulfilled => StatusCode::CONFLICT,
        FaultKind::BadArgument => StatusCode::BAD_REQUEST,
        FaultKind::UpdateNotFound => StatusCode::NOT_FOUND,
        FaultKind::ApiFault => StatusCode::BAD_GATEWAY,
        FaultKind::Unexpected => {
            error!(error = %err, "Unanticipated failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    let error = serde_json::to_value(fault.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unexpected".to_string());

    (
        status,
        Json(ApiError {
            error,
            message: fault.message,
            code: fault.code,
        }),
    )
}

#[derive(Serialize)]
struct StateResponse {
    state: WuState,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HostInfo {
    fqdn: String,
    service_version: String,
    observers: usize,
}

#[derive(Serialize)]
struct SelectionResponse {
    selected: usize,
}

/// Partial settings update; absent fields keep their value. Field names
/// match the [`Settings`] it patches.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsPatch {
    search_timeout_secs: Option<i32>,
    download_timeout_secs: Option<i32>,
    install_timeout_secs: Option<i32>,
    auto_accept_eulas: Option<bool>,
    auto_select_updates: Option<bool>,
}

// ============================================================================
// Server
// ============================================================================

/// Serve the API until `shutdown` resolves.
pub async fn run_http_server(
    addr: SocketAddr,
    service: Arc<WuRemoteService>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(Arc::new(AppState { service }));

    info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Build the application router with all routes
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    let api_routes = Router::new()
        // Status
        .route("/status", get(get_status))
        .route("/progress", get(get_progress))
        // Phases
        .route("/search", post(begin_search))
        .route("/search/abort", post(abort_search))
        .route("/download", post(begin_download))
        .route("/download/abort", post(abort_download))
        .route("/install", post(begin_install))
        .route("/install/abort", post(abort_install))
        // Updates
        .route("/updates", get(list_updates))
        .route("/updates/select-all", post(select_all))
        .route("/updates/unselect-all", post(unselect_all))
        .route("/updates/:update_id/select", post(select_update))
        .route("/updates/:update_id/unselect", post(unselect_update))
        .route("/updates/:update_id/accept-eula", post(accept_eula))
        // Settings
        .route("/settings", get(get_settings).put(update_settings))
        // Host
        .route("/host", get(get_host_info))
        .route("/host/reboot", post(reboot_host))
        .route("/service/reset", post(reset_service))
        // Observers
        .route("/callbacks", get(callbacks))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Handlers
// ============================================================================

async fn get_status(State(state): State<Arc<AppState>>) -> Json<WuStatus> {
    Json(state.service.get_wu_status())
}

async fn get_progress(State(state): State<Arc<AppState>>) -> Json<Option<ProgressSnapshot>> {
    Json(state.service.get_current_progress())
}

fn state_response(result: crate::update::Result<WuState>) -> ApiResult<StateResponse> {
    result
        .map(|state| Json(StateResponse { state }))
        .map_err(api_error)
}

async fn begin_search(State(state): State<Arc<AppState>>) -> ApiResult<StateResponse> {
    state_response(state.service.begin_search_updates().await)
}

async fn abort_search(State(state): State<Arc<AppState>>) -> ApiResult<StateResponse> {
    state_response(state.service.abort_search_updates().await)
}

async fn begin_download(State(state): State<Arc<AppState>>) -> ApiResult<StateResponse> {
    state_response(state.service.begin_download_updates().await)
}

async fn abort_download(State(state): State<Arc<AppState>>) -> ApiResult<StateResponse> {
    state_response(state.service.abort_download_updates().await)
}

async fn begin_install(State(state): State<Arc<AppState>>) -> ApiResult<StateResponse> {
    state_response(state.service.begin_install_updates().await)
}

async fn abort_install(State(state): State<Arc<AppState>>) -> ApiResult<StateResponse> {
    state_response(state.service.abort_install_updates().await)
}

async fn list_updates(State(state): State<Arc<AppState>>) -> Json<Vec<UpdateDescriptor>> {
    Json(state.service.get_available_updates())
}

async fn select_all(State(state): State<Arc<AppState>>) -> Json<SelectionResponse> {
    let selected = state.service.select_all_updates().await;
    Json(SelectionResponse { selected })
}

async fn unselect_all(State(state): State<Arc<AppState>>) -> StatusCode {
    state.service.unselect_all_updates().await;
    StatusCode::NO_CONTENT
}

async fn select_update(
    State(state): State<Arc<AppState>>,
    Path(update_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .service
        .select_update(&update_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(api_error)
}

async fn unselect_update(
    State(state): State<Arc<AppState>>,
    Path(update_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .service
        .unselect_update(&update_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(api_error)
}

async fn accept_eula(
    State(state): State<Arc<AppState>>,
    Path(update_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .service
        .accept_eula(&update_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(api_error)
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Settings> {
    Json(state.service.get_settings())
}

/// Apply a settings patch. Timeouts are validated first so a rejected
/// value leaves every setting untouched.
async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Settings> {
    let timeouts = [
        ("search_timeout", patch.search_timeout_secs),
        ("download_timeout", patch.download_timeout_secs),
        ("install_timeout", patch.install_timeout_secs),
    ];
    for (argument, value) in timeouts {
        if let Some(secs) = value {
            crate::update::validate_timeout(argument, i64::from(secs)).map_err(api_error)?;
        }
    }

    let service = &state.service;
    if let Some(secs) = patch.search_timeout_secs {
        service.set_search_timeout(secs).map_err(api_error)?;
    }
    if let Some(secs) = patch.download_timeout_secs {
        service.set_download_timeout(secs).map_err(api_error)?;
    }
    if let Some(secs) = patch.install_timeout_secs {
        service.set_install_timeout(secs).map_err(api_error)?;
    }
    if let Some(enabled) = patch.auto_accept_eulas {
        service.set_auto_accept_eulas(enabled);
    }
    if let Some(enabled) = patch.auto_select_updates {
        service.set_auto_select_updates(enabled);
    }

    Ok(Json(service.get_settings()))
}

async fn get_host_info(State(state): State<Arc<AppState>>) -> Json<HostInfo> {
    Json(HostInfo {
        fqdn: state.service.get_fqdn(),
        service_version: state.service.get_service_version().to_string(),
        observers: state.service.observer_count(),
    })
}

async fn reboot_host(State(state): State<Arc<AppState>>) -> ApiResult<StateResponse> {
    state_response(state.service.reboot_host().await)
}

async fn reset_service(State(state): State<Arc<AppState>>) -> ApiResult<StateResponse> {
    state_response(state.service.reset_service().await)
}

// ============================================================================
// Callback WebSocket
// ============================================================================

async fn callbacks(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_callback_socket(socket, state))
        .into_response()
}

/// Events a callback socket may have queued before it counts as stalled.
const CALLBACK_QUEUE_DEPTH: usize = 256;

/// Observer backed by a WebSocket connection.
///
/// A client that stops draining its socket fills the bounded queue and is
/// marked faulted, so the next broadcast prunes it.
pub struct WsObserver {
    id: String,
    liveness: AtomicU8,
    outbound: mpsc::Sender<CallbackEvent>,
}

impl WsObserver {
    fn new(outbound: mpsc::Sender<CallbackEvent>) -> Self {
        Self {
            id: format!("ws-{}", uuid::Uuid::new_v4()),
            liveness: AtomicU8::new(encode_liveness(Liveness::Created)),
            outbound,
        }
    }

    fn set_liveness(&self, liveness: Liveness) {
        self.liveness
            .store(encode_liveness(liveness), Ordering::Release);
    }
}

fn encode_liveness(liveness: Liveness) -> u8 {
    match liveness {
        Liveness::Created => 0,
        Liveness::Open => 1,
        Liveness::Closing => 2,
        Liveness::Closed => 3,
        Liveness::Faulted => 4,
    }
}

fn decode_liveness(value: u8) -> Liveness {
    match value {
        0 => Liveness::Created,
        1 => Liveness::Open,
        2 => Liveness::Closing,
        3 => Liveness::Closed,
        _ => Liveness::Faulted,
    }
}

#[async_trait]
impl Observer for WsObserver {
    fn id(&self) -> &str {
        &self.id
    }

    fn liveness(&self) -> Liveness {
        decode_liveness(self.liveness.load(Ordering::Acquire))
    }

    async fn deliver(&self, event: CallbackEvent) -> Result<(), DeliveryError> {
        match self.outbound.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.set_liveness(Liveness::Faulted);
                Err(DeliveryError::Failed(format!(
                    "callback queue full ({CALLBACK_QUEUE_DEPTH} events)"
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Disconnected),
        }
    }
}

async fn handle_callback_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<CallbackEvent>(CALLBACK_QUEUE_DEPTH);
    let observer = Arc::new(WsObserver::new(tx));

    state.service.register_for_callback(observer.clone());
    observer.set_liveness(Liveness::Open);
    info!(observer = %observer.id, "Callback socket connected");

    let writer_observer = observer.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if writer_observer.liveness() == Liveness::Faulted {
                warn!(observer = %writer_observer.id, "Callback client fell behind, closing socket");
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode callback event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                writer_observer.set_liveness(Liveness::Faulted);
                return;
            }
            if matches!(event, CallbackEvent::ServiceShutdown { .. }) {
                writer_observer.set_liveness(Liveness::Closing);
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        }
    });

    let mut reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Close(_)) => return Liveness::Closed,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Callback socket read failed");
                    return Liveness::Faulted;
                }
            }
        }
        Liveness::Closed
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        ended = &mut reader => {
            writer.abort();
            if let Ok(liveness) = ended {
                observer.set_liveness(liveness);
            }
        }
    }

    if observer.liveness().is_deliverable() || observer.liveness() == Liveness::Closing {
        observer.set_liveness(Liveness::Closed);
    }
    info!(observer = %observer.id, liveness = ?observer.liveness(), "Callback socket disconnected");
}
