use std::sync::Arc;

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use shared::models::{ControlFrame, TailFrame, TailKind};
use tracing::{info, instrument};
use utoipa::ToSchema;

use crate::{
    app_state::AppState,
    http::error::{ApiError, AppResult},
    services::multiplexer::SessionInfo,
};

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct FlushRequest {
    /// Shown to every tailing client in the `flush` frame.
    pub reason: String,
    /// Only sessions of this kind; all sessions when omitted.
    #[serde(default)]
    pub kind: Option<TailKind>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FlushResponse {
    pub delivered: usize,
}

/// Registered tail sessions, oldest first.
#[utoipa::path(
    get,
    path = "/api/admin/tail/sessions",
    responses(
        (status = 200, description = "Live tail sessions", body = Vec<SessionInfo>),
        (status = 403, description = "Caller is not an administrator", body = crate::http::problem::ProblemDetails)
    ),
    security(("bearer" = [])),
    tag = "Admin"
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(state.multiplexer.snapshot().await)
}

/// Ask tailing clients to discard what they hold and reload.
#[utoipa::path(
    post,
    path = "/api/admin/tail/flush",
    request_body = FlushRequest,
    responses(
        (status = 200, description = "Flush delivered", body = FlushResponse),
        (status = 400, description = "Empty reason", body = crate::http::problem::ProblemDetails),
        (status = 403, description = "Caller is not an administrator", body = crate::http::problem::ProblemDetails)
    ),
    security(("bearer" = [])),
    tag = "Admin"
)]
#[instrument(skip(state))]
pub async fn flush_sessions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FlushRequest>,
) -> AppResult<Json<FlushResponse>> {
    let reason = request.reason.trim();
    if reason.is_empty() {
        return Err(ApiError::bad_request("flush reason must not be empty"));
    }

    let frame = TailFrame::Control(ControlFrame::Flush {
        reason: reason.to_string(),
    });
    let delivered = state
        .multiplexer
        .broadcast(
            |session| request.kind.is_none_or(|kind| session.kind() == kind),
            &frame,
        )
        .await;
    info!(delivered, "flush broadcast");

    Ok(Json(FlushResponse { delivered }))
}
