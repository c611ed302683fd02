//! Wire access to the livetail server.
//!
//! The session state machine only sees [`ChatTransport`] and
//! [`TailTransport`]; [`HttpTransport`] implements both over reqwest and
//! decodes SSE bodies into typed frames at this boundary.

use std::{pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{RequestBuilder, Response, StatusCode, header::WWW_AUTHENTICATE};
use serde_json::Value;
use shared::models::{
    AbortResponse, ChatFrame, GenerationRequest, MessageState, MessagesResponse, TailFrame,
    TailKind, TailQuery,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::{credentials::CredentialProvider, error::TransportError, sse::SseDecoder};

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<ChatFrame, TransportError>> + Send>>;

/// Items of a tail stream: the server's reconnect hint or a decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TailItem {
    Retry(Duration),
    Frame(TailFrame),
}

pub type TailStream = Pin<Box<dyn Stream<Item = Result<TailItem, TransportError>> + Send>>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Start a generation and stream its frames.
    async fn open(&self, request: &GenerationRequest) -> Result<FrameStream, TransportError>;

    /// Ask the server to stop the generation; returns its stop reason.
    async fn abort(&self, conversation_id: Uuid) -> Result<AbortResponse, TransportError>;

    /// Durable message state, used while recovering.
    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<MessageState>, TransportError>;

    /// Replace the current credential after the server rejected it.
    async fn refresh_credentials(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TailTransport: Send + Sync {
    async fn open_tail(
        &self,
        kind: TailKind,
        query: &TailQuery,
    ) -> Result<TailStream, TransportError>;
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
    credentials: Arc<dyn CredentialProvider>,
    token: RwLock<Option<String>>,
}

impl HttpTransport {
    pub fn new(base: Url, credentials: Arc<dyn CredentialProvider>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("livetail-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base,
            credentials,
            token: RwLock::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|err| TransportError::Endpoint(format!("{path}: {err}")))
    }

    async fn authorize(&self, builder: RequestBuilder) -> Result<RequestBuilder, TransportError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(builder.bearer_auth(token));
        }

        let token = self.credentials.token().await?;
        *self.token.write().await = token.clone();
        Ok(match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, TransportError> {
        let response = self.authorize(builder).await?.send().await?;
        check(response).await
    }
}

/// Map non-success responses to typed errors, reading the problem body.
async fn check(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let challenge = response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|problem| problem["message"].as_str().map(str::to_string))
        .unwrap_or(body);

    if status == StatusCode::UNAUTHORIZED {
        return Err(TransportError::Unauthorized(challenge.unwrap_or(message)));
    }
    Err(TransportError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Turn a response body into decoded SSE events.
fn sse_events(
    response: Response,
) -> impl Stream<Item = Result<crate::sse::SseEvent, TransportError>> + Send {
    let mut body = response.bytes_stream();
    async_stream::stream! {
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.push(&bytes) {
                        yield Ok(event);
                    }
                }
                Err(err) => {
                    yield Err(TransportError::Connection(err.to_string()));
                    return;
                }
            }
        }
        if decoder.buffered() > 0 {
            debug!(bytes = decoder.buffered(), "stream ended inside an event");
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, request: &GenerationRequest) -> Result<FrameStream, TransportError> {
        let url = self.endpoint("api/chat/stream")?;
        let response = self.send(self.client.post(url).json(request)).await?;

        let frames = sse_events(response).filter_map(|event| async move {
            match event {
                Ok(event) if event.data.is_empty() => None,
                Ok(event) => Some(
                    serde_json::from_str::<ChatFrame>(&event.data)
                        .map_err(|err| TransportError::Decode(err.to_string())),
                ),
                Err(err) => Some(Err(err)),
            }
        });
        Ok(Box::pin(frames))
    }

    async fn abort(&self, conversation_id: Uuid) -> Result<AbortResponse, TransportError> {
        let url = self.endpoint(&format!("api/chat/{conversation_id}/abort"))?;
        let response = self.send(self.client.post(url)).await?;
        Ok(response.json().await?)
    }

    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<MessageState>, TransportError> {
        let url = self.endpoint(&format!("api/chat/{conversation_id}/messages"))?;
        let response = self.send(self.client.get(url)).await?;
        let body: MessagesResponse = response.json().await?;
        Ok(body.messages)
    }

    async fn refresh_credentials(&self) -> Result<(), TransportError> {
        let token = self.credentials.refresh().await?;
        if token.is_none() {
            warn!("credential refresh produced no token");
        }
        *self.token.write().await = token;
        Ok(())
    }
}

#[async_trait]
impl TailTransport for HttpTransport {
    async fn open_tail(
        &self,
        kind: TailKind,
        query: &TailQuery,
    ) -> Result<TailStream, TransportError> {
        let url = self.endpoint(&format!("api/admin/{}/stream", kind.as_str()))?;
        let response = self.send(self.client.get(url).query(query)).await?;

        let items = sse_events(response).filter_map(|event| async move {
            match event {
                Ok(event) if event.is_retry_only() => event.retry.map(|d| Ok(TailItem::Retry(d))),
                Ok(event) if event.data.is_empty() => None,
                Ok(event) => Some(
                    serde_json::from_str::<TailFrame>(&event.data)
                        .map(TailItem::Frame)
                        .map_err(|err| TransportError::Decode(err.to_string())),
                ),
                Err(err) => Some(Err(err)),
            }
        });
        Ok(Box::pin(items))
    }
}
