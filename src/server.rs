use std::{convert::Infallible, future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::{Method, StatusCode},
    response::{
        IntoResponse, Json,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};

use crate::{
    desktop::Notification,
    fleet::{FleetShutdown, ResumeOutcome},
    sidecar::ProcessSupervisor,
    termination::StopOptions,
    update::{CommandUpdater, UpdateEvent, UpdateOrchestrator},
};

/// Shared handles behind the control server.
#[derive(Clone)]
pub struct ControlState {
    pub supervisor: Arc<ProcessSupervisor>,
    pub fleet: Arc<FleetShutdown>,
    pub updates: Arc<UpdateOrchestrator>,
    /// Present in headless mode, where update events arrive over HTTP.
    pub feed: Option<Arc<CommandUpdater>>,
    pub notifications: broadcast::Sender<Notification>,
}

pub fn router(state: ControlState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/sidecar", get(sidecar_status))
        .route("/sidecar/restart", post(sidecar_restart))
        .route("/sidecar/stop", post(sidecar_stop))
        .route("/update", get(update_status))
        .route("/update/check", post(update_check))
        .route("/update/manual", post(update_manual))
        .route("/update/latest", get(update_latest))
        .route("/update/install", post(update_install))
        .route("/update/enabled", post(update_enabled))
        .route("/update/events", post(update_event))
        .route("/shutdown/last", get(last_shutdown).delete(clear_last_shutdown))
        .route("/shutdown/resume", post(resume_servers))
        .route("/events", get(events_stream))
        .layer(cors)
        .with_state(state)
}

/// Serves the control API until `shutdown` resolves. An occupied port is not fatal.
pub async fn serve(
    addr: SocketAddr,
    state: ControlState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            tracing::warn!(%addr, "control port already in use; control server disabled");
            shutdown.await;
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| format!("failed to bind {addr}")),
    };

    tracing::info!("control server listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("control server error")?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "message": "thv supervisor ready"
    }))
}

async fn sidecar_status(State(state): State<ControlState>) -> impl IntoResponse {
    let supervisor = &state.supervisor;
    Json(json!({
        "running": supervisor.is_running(),
        "state": supervisor.state(),
        "port": supervisor.port(),
        "mcpPort": supervisor.mcp_port(),
        "pid": supervisor.pid(),
        "binaryPath": supervisor.binary_path().display().to_string(),
    }))
}

async fn sidecar_restart(State(state): State<ControlState>) -> impl IntoResponse {
    let outcome = state.supervisor.restart().await;
    Json(json!({
        "outcome": format!("{outcome:?}"),
        "running": state.supervisor.is_running(),
        "port": state.supervisor.port(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct StopRequest {
    #[serde(default)]
    force: bool,
}

async fn sidecar_stop(
    State(state): State<ControlState>,
    body: Option<Json<StopRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let options = if request.force {
        StopOptions::forced()
    } else {
        StopOptions::graceful()
    };
    let outcome = state.supervisor.stop(options);
    Json(json!({ "outcome": format!("{outcome:?}") }))
}

async fn update_status(State(state): State<ControlState>) -> impl IntoResponse {
    let updates = &state.updates;
    Json(json!({
        "state": updates.state(),
        "inProgress": updates.is_update_in_progress(),
        "pendingVersion": updates.pending_version(),
        "enabled": updates.is_enabled(),
    }))
}

async fn update_check(State(state): State<ControlState>) -> impl IntoResponse {
    match state.updates.check_for_updates() {
        Ok(started) => (StatusCode::OK, Json(json!({ "started": started }))).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{err:#}") })),
        )
            .into_response(),
    }
}

async fn update_manual(State(state): State<ControlState>) -> impl IntoResponse {
    match state.updates.manual_update() {
        Ok(started) => (
            StatusCode::OK,
            Json(json!({ "started": started, "enabled": state.updates.is_enabled() })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{err:#}") })),
        )
            .into_response(),
    }
}

async fn update_latest(State(state): State<ControlState>) -> impl IntoResponse {
    Json(state.updates.latest_version().await)
}

async fn update_install(State(state): State<ControlState>) -> impl IntoResponse {
    Json(state.updates.install_update_and_restart().await)
}

#[derive(Debug, Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

async fn update_enabled(
    State(state): State<ControlState>,
    Json(request): Json<EnabledRequest>,
) -> impl IntoResponse {
    if request.enabled {
        state.updates.enable();
    } else {
        state.updates.disable();
    }
    Json(json!({ "enabled": state.updates.is_enabled() }))
}

async fn update_event(
    State(state): State<ControlState>,
    Json(event): Json<UpdateEvent>,
) -> impl IntoResponse {
    match state.feed.as_ref() {
        Some(feed) => {
            feed.publish(event);
            StatusCode::ACCEPTED.into_response()
        }
        None => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "update events are only accepted in headless mode" })),
        )
            .into_response(),
    }
}

async fn last_shutdown(State(state): State<ControlState>) -> impl IntoResponse {
    match state.fleet.last_shutdown_servers() {
        Ok(servers) => (StatusCode::OK, Json(json!({ "servers": servers }))).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{err:#}") })),
        )
            .into_response(),
    }
}

async fn clear_last_shutdown(State(state): State<ControlState>) -> impl IntoResponse {
    match state.fleet.clear_shutdown_history() {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{err:#}") })),
        )
            .into_response(),
    }
}

async fn resume_servers(State(state): State<ControlState>) -> impl IntoResponse {
    let Some(port) = state.supervisor.port() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "thv is not running" })),
        )
            .into_response();
    };

    match state.fleet.resume_servers(port).await {
        Ok(ResumeOutcome::NothingToResume) => {
            (StatusCode::OK, Json(json!({ "restarted": [] }))).into_response()
        }
        Ok(ResumeOutcome::Restarted(names)) => {
            (StatusCode::OK, Json(json!({ "restarted": names }))).into_response()
        }
        Err(err) => {
            tracing::error!(err = %format!("{err:#}"), "failed to resume servers");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": format!("{err:#}") })),
            )
                .into_response()
        }
    }
}

async fn events_stream(
    State(state): State<ControlState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.notifications.subscribe()).filter_map(|result| async move {
        match result {
            Ok(notification) => match serde_json::to_string(&notification) {
                Ok(payload) => Some(Ok(Event::default()
                    .event(notification.event_name())
                    .data(payload))),
                Err(err) => {
                    tracing::error!(?err, "failed to serialize notification");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(?err, "notification channel dropped event");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text(":thv-supervisor keep-alive"),
    )
}
