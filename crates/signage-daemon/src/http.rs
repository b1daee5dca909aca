use crate::core::SupervisorHandle;
use crate::error::ControlError;
use crate::publisher::{PlaylistView, PublishedPlaylist};
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use signage_proto::catalog::CatalogError;
use signage_proto::protocol::{ChannelStatus, PlaylistEntry, ReconcileReport};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
struct HttpState {
    supervisor: SupervisorHandle,
    playlist: PlaylistView,
}

#[derive(Serialize)]
struct ApiErrorBody {
    error: String,
    retryable: bool,
}

/// Seconds a client should wait before retrying a 503.
const RETRY_AFTER_SECS: &str = "5";

struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::ContentSequenceEmpty(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ControlError::Timeout(_) | ControlError::Catalog(CatalogError::Timeout(_)) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ControlError::Catalog(_) | ControlError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        if status.is_server_error() {
            warn!("HTTP API: {}", self.0);
        }

        let body = Json(ApiErrorBody {
            error: self.0.to_string(),
            retryable: self.0.is_retryable(),
        });
        let mut response = (status, body).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(supervisor: SupervisorHandle, playlist: PlaylistView) -> Router {
    let app_state = HttpState {
        supervisor,
        playlist,
    };

    Router::new()
        .route("/api/channels", get(list_channels))
        .route("/api/channels/:id", get(channel_status))
        .route("/api/channels/:id/start", post(start_channel))
        .route("/api/channels/:id/stop", post(stop_channel))
        .route("/api/channels/:id/reset", post(reset_channel))
        .route("/api/live", get(list_live))
        .route("/api/reconcile", post(reconcile))
        .route("/api/playlist", get(playlist_info))
        .route("/playlist.m3u", get(playlist_file))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    supervisor: SupervisorHandle,
    playlist: PlaylistView,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(supervisor, playlist);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn list_channels(State(state): State<HttpState>) -> ApiResult<Vec<ChannelStatus>> {
    Ok(Json(state.supervisor.list_status().await?))
}

async fn channel_status(
    State(state): State<HttpState>,
    Path(id): Path<u32>,
) -> ApiResult<ChannelStatus> {
    Ok(Json(state.supervisor.get_status(id).await?))
}

async fn start_channel(
    State(state): State<HttpState>,
    Path(id): Path<u32>,
) -> ApiResult<ChannelStatus> {
    info!("HTTP API: start channel {}", id);
    Ok(Json(state.supervisor.request_start(id).await?))
}

async fn stop_channel(
    State(state): State<HttpState>,
    Path(id): Path<u32>,
) -> ApiResult<ChannelStatus> {
    info!("HTTP API: stop channel {}", id);
    Ok(Json(state.supervisor.request_stop(id).await?))
}

async fn reset_channel(
    State(state): State<HttpState>,
    Path(id): Path<u32>,
) -> ApiResult<ChannelStatus> {
    info!("HTTP API: reset channel {}", id);
    Ok(Json(state.supervisor.request_reset(id).await?))
}

async fn list_live(State(state): State<HttpState>) -> ApiResult<Vec<PlaylistEntry>> {
    Ok(Json(state.supervisor.list_live().await?))
}

async fn reconcile(State(state): State<HttpState>) -> ApiResult<ReconcileReport> {
    info!("HTTP API: reconcile");
    Ok(Json(state.supervisor.reconcile().await?))
}

async fn playlist_info(State(state): State<HttpState>) -> Json<PublishedPlaylist> {
    Json(state.playlist.get().await)
}

async fn playlist_file(State(state): State<HttpState>) -> impl IntoResponse {
    let playlist = state.playlist.get().await;
    (
        [
            (header::CONTENT_TYPE, "audio/x-mpegurl"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        playlist.content,
    )
}
