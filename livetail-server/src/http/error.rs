use axum::{
    http::{HeaderValue, StatusCode, header::WWW_AUTHENTICATE},
    response::IntoResponse,
};
use serde_json::json;
use shared::models::PageError;
use thiserror::Error;

use super::problem::ProblemDetails;
use crate::services::{
    backlog::BacklogError, chat_service::ChatError, message_repository::RepositoryError,
};

pub type AppResult<T> = Result<T, ApiError>;

const INVALID_TOKEN_CHALLENGE: &str = r#"Bearer error="invalid_token""#;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
    challenge: Option<&'static str>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
            challenge: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_failed", message)
    }

    /// 401 without a credential; the client should authenticate.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        let mut error = Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message);
        error.challenge = Some("Bearer");
        error
    }

    /// 401 for an expired or unknown credential; the client should refresh.
    pub fn invalid_token(message: impl Into<String>) -> Self {
        let mut error = Self::new(StatusCode::UNAUTHORIZED, "invalid_token", message);
        error.challenge = Some(INVALID_TOKEN_CHALLENGE);
        error
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut problem = ProblemDetails::new(self.status, self.code, self.message);
        if let Some(details) = self.details {
            problem = problem.with_details(details);
        }

        let mut response = problem.into_response();
        if let Some(challenge) = self.challenge {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static(challenge));
        }
        response
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal_server_error(value.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err
                .code()
                .unwrap_or_else(|| std::borrow::Cow::Borrowed("unknown"));
            return Self::internal_server_error(format!("database error {code}"))
                .with_details(json!({ "sqlstate": code, "message": db_err.message() }));
        }
        Self::internal_server_error(err.to_string())
    }
}

impl From<PageError> for ApiError {
    fn from(err: PageError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<BacklogError> for ApiError {
    fn from(err: BacklogError) -> Self {
        match err {
            BacklogError::Storage(source) => Self::from(source),
            BacklogError::Unavailable(message) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "backlog_unavailable",
                message,
            ),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Busy(conversation_id) => Self::conflict(format!(
                "a generation is already running for conversation {conversation_id}"
            ))
            .with_details(json!({ "conversation_id": conversation_id })),
            ChatError::Generation(source) => Self::bad_request(source.to_string()),
            ChatError::Repository(RepositoryError::MessageNotFound(id)) => {
                Self::not_found(format!("message {id} not found"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::generation::GenerationError;
    use axum::http::header::CONTENT_TYPE;
    use serde_json::Value;
    use uuid::Uuid;

    #[tokio::test]
    async fn into_response_serializes_problem_details() {
        let response = ApiError::not_found("missing conversation")
            .with_details(json!({ "conversation_id": "c-1" }))
            .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );

        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["status"], 404);
        assert_eq!(json["details"]["conversation_id"], "c-1");
    }

    #[test]
    fn expired_credentials_carry_refresh_challenge() {
        let response = ApiError::invalid_token("token expired").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            INVALID_TOKEN_CHALLENGE
        );

        let missing = ApiError::unauthorized("no token").into_response();
        assert_eq!(missing.headers().get(WWW_AUTHENTICATE).unwrap(), "Bearer");
    }

    #[test]
    fn domain_errors_map_to_status_codes() {
        assert_eq!(
            ApiError::from(PageError::InvalidPage).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ChatError::Busy(Uuid::nil())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(ChatError::Generation(GenerationError::Rejected("empty".into())))
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(BacklogError::Storage(sqlx::Error::PoolTimedOut)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
