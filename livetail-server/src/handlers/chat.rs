//! Chat generation endpoints: the streaming POST, remote abort and the
//! durable message listing used by recovering clients.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderName, HeaderValue, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use shared::models::{AbortResponse, ChatFrame, GenerationRequest, MessagesResponse};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    app_state::AppState, http::error::AppResult, middleware::request_context::RequestContext,
};

pub(crate) const CONVERSATION_HEADER: &str = "x-conversation-id";

/// Start a generation and stream its frames.
///
/// Closing the stream detaches the client; the generation keeps running.
#[utoipa::path(
    post,
    path = "/api/chat/stream",
    request_body = GenerationRequest,
    responses(
        (status = 200, description = "Chat frames as server-sent events", content_type = "text/event-stream", body = ChatFrame),
        (status = 400, description = "Prompt rejected", body = crate::http::problem::ProblemDetails),
        (status = 401, description = "Missing or invalid credential", body = crate::http::problem::ProblemDetails),
        (status = 409, description = "A generation is already running", body = crate::http::problem::ProblemDetails)
    ),
    security(("bearer" = [])),
    tag = "Chat"
)]
#[instrument(skip(state, context, request), fields(subject = context.subject()))]
pub async fn stream(
    State(state): State<Arc<AppState>>,
    axum::Extension(context): axum::Extension<RequestContext>,
    Json(request): Json<GenerationRequest>,
) -> AppResult<Response> {
    let started = state.chat.start(request).await?;
    info!(conversation_id = %started.conversation_id, "chat stream opened");

    let events = ReceiverStream::new(started.frames).filter_map(to_event);
    let mut response = Sse::new(events).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    if let Ok(value) = HeaderValue::from_str(&started.conversation_id.to_string()) {
        headers.insert(HeaderName::from_static(CONVERSATION_HEADER), value);
    }
    Ok(response)
}

fn to_event(frame: ChatFrame) -> Option<Result<Event, Infallible>> {
    match serde_json::to_string(&frame) {
        Ok(data) => Some(Ok(Event::default().event(frame.kind()).data(data))),
        Err(err) => {
            warn!(error = %err, kind = frame.kind(), "dropping chat frame that failed to serialize");
            None
        }
    }
}

/// Stop the running generation of a conversation. Idempotent.
#[utoipa::path(
    post,
    path = "/api/chat/{conversation_id}/abort",
    params(("conversation_id" = Uuid, Path, description = "Conversation to stop")),
    responses(
        (status = 200, description = "Why the generation stopped", body = AbortResponse),
        (status = 401, description = "Missing or invalid credential", body = crate::http::problem::ProblemDetails)
    ),
    security(("bearer" = [])),
    tag = "Chat"
)]
pub async fn abort(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
) -> Json<AbortResponse> {
    let reason = state.chat.abort(conversation_id).await;
    Json(AbortResponse {
        conversation_id,
        stop_reason: reason.as_str().to_string(),
    })
}

/// Durable messages of a conversation, in creation order.
#[utoipa::path(
    get,
    path = "/api/chat/{conversation_id}/messages",
    params(("conversation_id" = Uuid, Path, description = "Conversation to read")),
    responses(
        (status = 200, description = "Stored messages", body = MessagesResponse),
        (status = 401, description = "Missing or invalid credential", body = crate::http::problem::ProblemDetails)
    ),
    security(("bearer" = [])),
    tag = "Chat"
)]
pub async fn messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<MessagesResponse>> {
    Ok(Json(state.chat.messages(conversation_id).await?))
}
