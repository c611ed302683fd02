//! SSE endpoints for the admin tails of logs and conversations.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{HeaderName, HeaderValue, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use shared::{
    config::server::TailConfig,
    models::{TailQuery, TailRecord},
};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::{instrument, warn};

use crate::{
    app_state::AppState,
    http::error::AppResult,
    services::tail_session::{RunningSession, SessionOutput, TailService},
};

pub(crate) const SESSION_HEADER: &str = "x-tail-session";

/// Tail application logs: backlog page, `historical_complete`, then live.
#[utoipa::path(
    get,
    path = "/api/admin/logs/stream",
    params(TailQuery),
    responses(
        (status = 200, description = "Tail frames as server-sent events", content_type = "text/event-stream", body = String),
        (status = 400, description = "Invalid paging parameters", body = crate::http::problem::ProblemDetails),
        (status = 401, description = "Missing or invalid credential", body = crate::http::problem::ProblemDetails),
        (status = 403, description = "Caller is not an administrator", body = crate::http::problem::ProblemDetails)
    ),
    security(("bearer" = [])),
    tag = "Tail"
)]
#[instrument(skip(state))]
pub async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TailQuery>,
) -> AppResult<Response> {
    open_tail(&state.logs, &state.config.tail, &query).await
}

/// Tail conversation summaries, optionally scoped to one conversation.
#[utoipa::path(
    get,
    path = "/api/admin/conversations/stream",
    params(TailQuery),
    responses(
        (status = 200, description = "Tail frames as server-sent events", content_type = "text/event-stream", body = String),
        (status = 400, description = "Invalid paging parameters", body = crate::http::problem::ProblemDetails),
        (status = 401, description = "Missing or invalid credential", body = crate::http::problem::ProblemDetails),
        (status = 403, description = "Caller is not an administrator", body = crate::http::problem::ProblemDetails)
    ),
    security(("bearer" = [])),
    tag = "Tail"
)]
#[instrument(skip(state))]
pub async fn stream_conversations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TailQuery>,
) -> AppResult<Response> {
    open_tail(&state.conversations, &state.config.tail, &query).await
}

async fn open_tail<R: TailRecord>(
    service: &TailService<R>,
    config: &TailConfig,
    query: &TailQuery,
) -> AppResult<Response> {
    let (filter, page) = query.resolve(config.default_page_size, config.max_page_size)?;
    let session = service.open(filter, page).await;
    Ok(sse_response(session))
}

fn sse_response(session: RunningSession) -> Response {
    let session_id = session.id;
    let events = ReceiverStream::new(session.output).filter_map(to_event);

    let mut response = Sse::new(events).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    if let Ok(value) = HeaderValue::from_str(&session_id.to_string()) {
        headers.insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    response
}

fn to_event(output: SessionOutput) -> Option<Result<Event, Infallible>> {
    match output {
        SessionOutput::Retry(delay) => Some(Ok(Event::default().retry(delay))),
        SessionOutput::Frame(frame) => {
            let data = match serde_json::to_string(&frame) {
                Ok(data) => data,
                Err(err) => {
                    warn!(error = %err, "dropping frame that failed to serialize");
                    return None;
                }
            };
            let mut event = Event::default().data(data);
            // SSE ids may not carry line breaks or NUL.
            if let Some(id) = frame
                .record_id()
                .filter(|id| !id.contains(['\n', '\r', '\0']))
            {
                event = event.id(id);
            }
            Some(Ok(event))
        }
    }
}
