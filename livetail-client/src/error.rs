use thiserror::Error;
use uuid::Uuid;

use crate::credentials::CredentialError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server rejected the presented credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("server responded {status}: {message}")]
    Status { status: u16, message: String },
    #[error("connection failed: {0}")]
    Connection(String),
    /// A frame could not be decoded; the stream itself is still usable.
    #[error("malformed frame: {0}")]
    Decode(String),
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl TransportError {
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Connection(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("credentials were still rejected after {0} refresh attempt(s)")]
    CredentialsExhausted(u32),
    #[error("no session is running for conversation {0}")]
    NoSession(Uuid),
    #[error("the session ended before replying")]
    Closed,
}
