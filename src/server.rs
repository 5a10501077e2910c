//! HTTP surface: intake, submission views, queue health and the SSE stream.
//!
//! Authentication happens upstream; the gateway forwards the caller as
//! `x-user-id` and `x-user-role` headers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::Submission;
use crate::error::{with_rate_limit_headers, IntakeError};
use crate::intake::{SubmissionReceipt, SubmissionService, SubmitRequest, Viewer};
use crate::notifications::NotificationBus;
use crate::queue_health::{QueueHealth, QueueHealthService, SubmissionQueueInfo};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub struct AppState {
    pub submissions: SubmissionService,
    pub queue_health: QueueHealthService,
    pub notifications: NotificationBus,
    /// Ends open notification streams so graceful shutdown is not held up
    pub shutdown: CancellationToken,
}

impl<S: Send + Sync> FromRequestParts<S> for Viewer {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };
        let user_id = header(USER_ID_HEADER).and_then(|v| v.parse::<i64>().ok());
        let is_admin = header(USER_ROLE_HEADER)
            .map(|role| role.eq_ignore_ascii_case("admin"))
            .unwrap_or(false);
        Ok(Viewer { user_id, is_admin })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/problems/{id}/submit", post(handler_submit))
        .route("/api/problems/{id}/run", post(handler_run))
        .route("/api/admin/problems/{id}/submit", post(handler_admin_submit))
        .route("/api/admin/problems/{id}/validate", post(handler_validate))
        .route("/api/submissions/{id}", get(handler_submission))
        .route("/api/submissions/{id}/queue", get(handler_submission_queue))
        .route("/api/queue/health", get(handler_queue_health))
        .route("/api/notifications/stream", get(handler_notifications))
        .with_state(state)
}

/// Serve until `cancel` fires.
pub async fn serve(bind: &str, state: Arc<AppState>, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

fn accepted(receipt: SubmissionReceipt) -> Response {
    let rate_limit = receipt.rate_limit;
    let response = (StatusCode::ACCEPTED, Json(receipt)).into_response();
    match rate_limit {
        Some(decision) => with_rate_limit_headers(response, &decision),
        None => response,
    }
}

async fn handler_submit(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(problem_id): Path<i64>,
    Json(request): Json<SubmitRequest>,
) -> Result<Response, IntakeError> {
    let receipt = state.submissions.submit(&viewer, problem_id, request).await?;
    Ok(accepted(receipt))
}

async fn handler_run(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(problem_id): Path<i64>,
    Json(request): Json<SubmitRequest>,
) -> Result<Response, IntakeError> {
    let receipt = state.submissions.run_code(&viewer, problem_id, request).await?;
    Ok(accepted(receipt))
}

async fn handler_admin_submit(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(problem_id): Path<i64>,
    Json(request): Json<SubmitRequest>,
) -> Result<Response, IntakeError> {
    let receipt = state
        .submissions
        .admin_submit(&viewer, problem_id, request)
        .await?;
    Ok(accepted(receipt))
}

async fn handler_validate(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(problem_id): Path<i64>,
    Json(request): Json<SubmitRequest>,
) -> Result<Response, IntakeError> {
    let receipt = state.submissions.validate(&viewer, problem_id, request).await?;
    Ok(accepted(receipt))
}

async fn handler_submission(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(id): Path<i64>,
) -> Result<Json<Submission>, IntakeError> {
    Ok(Json(state.submissions.get_submission(id, &viewer).await?))
}

async fn handler_submission_queue(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(id): Path<i64>,
) -> Result<Json<SubmissionQueueInfo>, IntakeError> {
    // Same visibility rule as the submission itself.
    state.submissions.get_submission(id, &viewer).await?;
    state
        .queue_health
        .submission_queue_info(id)
        .await?
        .map(Json)
        .ok_or_else(|| IntakeError::NotFound("Submission not found".into()))
}

async fn handler_queue_health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueHealth>, IntakeError> {
    Ok(Json(state.queue_health.health().await?))
}

async fn handler_notifications(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, IntakeError> {
    let Some(user_id) = viewer.user_id else {
        return Err(IntakeError::Validation("User identity is required".into()));
    };
    let subscription = state.notifications.register(user_id);
    info!("Notification stream opened: user_id={}", user_id);

    let events = subscription
        .into_frames()
        .take_until(state.shutdown.clone().cancelled_owned())
        .map(|frame| Ok(Event::default().data(frame)));
    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}
