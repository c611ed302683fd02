#![allow(clippy::needless_for_each)] // Derive macro emits a for_each internally

use shared::models::{
    AbortResponse, Attachment, ChatFrame, GenerationRequest, MessageRole, MessageState,
    MessagesResponse, PageRequest, StepEvent, StepStatus, TailFilter, TailKind, TailQuery,
};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::{
    handlers::admin::{FlushRequest, FlushResponse},
    http::problem::ProblemDetails,
    services::{multiplexer::SessionInfo, tail_session::SessionPhase},
};

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "livetail API",
        version = "0.1.0",
        description = "Backlog-then-live admin tails and resumable chat generation streams"
    ),
    paths(
        crate::handlers::tail::stream_logs,
        crate::handlers::tail::stream_conversations,
        crate::handlers::admin::list_sessions,
        crate::handlers::admin::flush_sessions,
        crate::handlers::chat::stream,
        crate::handlers::chat::abort,
        crate::handlers::chat::messages,
    ),
    components(
        schemas(
            TailQuery,
            TailFilter,
            TailKind,
            PageRequest,
            SessionInfo,
            SessionPhase,
            FlushRequest,
            FlushResponse,
            GenerationRequest,
            ChatFrame,
            StepEvent,
            StepStatus,
            Attachment,
            MessageRole,
            MessageState,
            MessagesResponse,
            AbortResponse,
            ProblemDetails,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "Tail", description = "Admin tails of logs and conversations"),
        (name = "Admin", description = "Tail session management"),
        (name = "Chat", description = "Chat generation streams")
    )
)]
pub struct ApiDoc;
