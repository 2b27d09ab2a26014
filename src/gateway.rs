//! Event gateway: the public HTTP surface that receives change notifications.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/` | Receive a notification |
//! | `POST` | `/webhook/nextcloud` | Same handler, alternate route |
//! | `GET`  | `/health` | Liveness plus queue reachability |
//!
//! # Response contract
//!
//! | Status | Body | When |
//! |--------|------|------|
//! | `202` | `{"status": "queued"}` | enqueued on every interested role's queue |
//! | `202` | `{"status": "ignored"}` | unknown or malformed notification, dropped |
//! | `400` | `{"detail": "Invalid JSON"}` | body is not JSON |
//! | `401` | `{"detail": "Missing auth"}` and friends | credential missing or wrong |
//! | `500` | `{"detail": "Queue unavailable"}` | push failed |
//!
//! Credentials are checked before the body is parsed. The body is never
//! pre-normalised into the queue: each entry carries the original
//! notification and consumers normalise it with the same [`Normalizer`].

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::error::SyncError;
use crate::event::Normalizer;
use crate::models::QueueEntry;
use crate::path::ResolverChain;
use crate::queue::{self, Routes, WorkQueue};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    auth: Arc<Authenticator>,
    queue: Arc<dyn WorkQueue>,
    normalizer: Arc<Normalizer>,
    routes: Arc<Routes>,
    source: String,
}

impl AppState {
    pub fn new(
        auth: Authenticator,
        queue: Arc<dyn WorkQueue>,
        normalizer: Arc<Normalizer>,
        routes: Routes,
        source: impl Into<String>,
    ) -> Self {
        Self {
            auth: Arc::new(auth),
            queue,
            normalizer,
            routes: Arc::new(routes),
            source: source.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(handle_notification))
        .route("/webhook/nextcloud", post(handle_notification))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves on `listener` until `cancel` fires, then drains in-flight requests.
pub async fn serve(listener: TcpListener, state: AppState, cancel: CancellationToken) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Gateway server failed")
}

/// `rag-sync gateway`
pub async fn run_gateway(config: &Config) -> Result<()> {
    config.validate_gateway()?;

    let queue: Arc<dyn WorkQueue> = Arc::new(queue::open(config).await?);
    let normalizer = Arc::new(Normalizer::new(Arc::new(ResolverChain::with_owner_root(
        config.paths.owner_prefix_root.clone(),
    ))));
    let state = AppState::new(
        Authenticator::new(&config.gateway.secret, config.gateway.effective_token()),
        queue,
        normalizer,
        Routes::from_config(&config.queue),
        config.gateway.source.clone(),
    );

    let listener = TcpListener::bind(&config.gateway.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.gateway.bind))?;
    info!(bind = %config.gateway.bind, "gateway listening");

    serve(listener, state, crate::worker::shutdown_token()).await
}

// ============ Responses ============

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
}

#[derive(Serialize)]
struct DetailBody {
    detail: &'static str,
}

fn status(code: StatusCode, status: &'static str) -> Response {
    (code, Json(StatusBody { status })).into_response()
}

fn detail(code: StatusCode, detail: &'static str) -> Response {
    (code, Json(DetailBody { detail })).into_response()
}

// ============ POST / and /webhook/nextcloud ============

async fn handle_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(failure) = state.auth.verify(&headers, &body) {
        let err = SyncError::from(failure);
        warn!(error = %err, kind = err.kind(), "rejected notification");
        return detail(StatusCode::UNAUTHORIZED, failure.detail());
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "notification body is not JSON");
            return detail(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    let job = match state.normalizer.normalize(&state.source, &payload) {
        Ok(job) => job,
        Err(e) => {
            warn!(error = %e, "dropping notification");
            return status(StatusCode::ACCEPTED, "ignored");
        }
    };

    let targets = state.routes.targets(job.event_kind);
    if targets.is_empty() {
        debug!(kind = %job.event_kind, "no consumer interested, dropping");
        return status(StatusCode::ACCEPTED, "ignored");
    }

    let entry = QueueEntry::pending(state.source.clone(), payload);
    for queue in targets {
        if let Err(e) = state.queue.push(queue, &entry).await {
            error!(queue, job_id = %entry.id, error = %e, "enqueue failed");
            return detail(StatusCode::INTERNAL_SERVER_ERROR, "Queue unavailable");
        }
        info!(
            queue,
            job_id = %entry.id,
            kind = %job.event_kind,
            file_id = %job.file_id,
            path = %job.file_path,
            "notification queued"
        );
    }

    status(StatusCode::ACCEPTED, "queued")
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    queue: bool,
    version: &'static str,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        queue: state.queue.ping().await,
        version: env!("CARGO_PKG_VERSION"),
    })
}
