//! Live change sources feeding the LIVE phase of a tail session.

use std::{marker::PhantomData, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use shared::models::{ChangeEvent, ChangeOperation, TailFilter, TailRecord};
use sqlx::{PgPool, postgres::PgListener};
use thiserror::Error;
use tracing::{debug, warn};

use super::backlog::RecordLookup;

#[derive(Debug, Error)]
pub enum ChangeSourceError {
    /// The backing subscription feature cannot be used. Sessions degrade to
    /// backlog-only mode.
    #[error("live updates unavailable: {0}")]
    Unavailable(String),
    #[error("undecodable change notification: {0}")]
    Decode(String),
    #[error("change stream failed: {0}")]
    Stream(String),
}

pub type ChangeStream<R> =
    Pin<Box<dyn Stream<Item = Result<ChangeEvent<R>, ChangeSourceError>> + Send>>;

/// Subscription to insert/update notifications.
///
/// The returned stream may be coarser than `filter`; consumers re-evaluate
/// the filter per event. Delivery is at-least-once.
#[async_trait]
pub trait ChangeSource<R>: Send + Sync {
    async fn watch(&self, filter: &TailFilter) -> Result<ChangeStream<R>, ChangeSourceError>;
}

/// A source that never subscribes; used when live updates are switched off.
#[derive(Debug, Default)]
pub struct DisabledChangeSource;

#[async_trait]
impl<R: TailRecord> ChangeSource<R> for DisabledChangeSource {
    async fn watch(&self, _filter: &TailFilter) -> Result<ChangeStream<R>, ChangeSourceError> {
        Err(ChangeSourceError::Unavailable(
            "no change feed configured".to_string(),
        ))
    }
}

/// Payload published by the `livetail.notify_change` trigger.
#[derive(Debug, Deserialize)]
struct Notification {
    operation: ChangeOperation,
    id: String,
    #[serde(default)]
    changed_fields: Option<Vec<String>>,
}

fn decode_notification(payload: &str) -> Result<Notification, ChangeSourceError> {
    serde_json::from_str(payload).map_err(|err| ChangeSourceError::Decode(err.to_string()))
}

/// `LISTEN`s on the kind's channel and resolves each notified id to the full
/// row.
pub struct PgChangeSource<R> {
    pool: PgPool,
    lookup: Arc<dyn RecordLookup<R>>,
    _record: PhantomData<fn() -> R>,
}

impl<R> std::fmt::Debug for PgChangeSource<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgChangeSource").finish_non_exhaustive()
    }
}

impl<R: TailRecord> PgChangeSource<R> {
    pub fn new(pool: PgPool, lookup: Arc<dyn RecordLookup<R>>) -> Self {
        Self {
            pool,
            lookup,
            _record: PhantomData,
        }
    }
}

#[async_trait]
impl<R: TailRecord> ChangeSource<R> for PgChangeSource<R> {
    async fn watch(&self, _filter: &TailFilter) -> Result<ChangeStream<R>, ChangeSourceError> {
        let channel = R::KIND.channel();
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|err| ChangeSourceError::Unavailable(err.to_string()))?;
        listener
            .listen(channel)
            .await
            .map_err(|err| ChangeSourceError::Unavailable(err.to_string()))?;
        debug!(channel, "listening for change notifications");

        let lookup = Arc::clone(&self.lookup);
        let stream = async_stream::stream! {
            loop {
                let notification = match listener.recv().await {
                    Ok(notification) => notification,
                    Err(err) => {
                        yield Err(ChangeSourceError::Stream(err.to_string()));
                        break;
                    }
                };

                let decoded = match decode_notification(notification.payload()) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        yield Err(err);
                        continue;
                    }
                };

                match lookup.find(&decoded.id).await {
                    Ok(Some(record)) => yield Ok(ChangeEvent {
                        operation: decoded.operation,
                        full_record: record,
                        changed_fields: decoded.changed_fields,
                    }),
                    Ok(None) => warn!(channel, id = %decoded.id, "notified record no longer exists"),
                    Err(err) => yield Err(ChangeSourceError::Stream(err.to_string())),
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
