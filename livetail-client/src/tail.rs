//! Follows an admin tail across reconnects.
//!
//! Every connection replays the backlog, so records already forwarded are
//! suppressed by id. A `flush` control frame resets that memory.

use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::StreamExt;
use shared::models::{
    ChangeOperation, ControlFrame, EventFrame, TailFrame, TailKind, TailQuery, TailRecord,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, TransportError},
    transport::{TailItem, TailTransport},
};

/// Used until the server sends its own retry hint.
const DEFAULT_RETRY: Duration = Duration::from_secs(3);

pub struct TailClient {
    transport: Arc<dyn TailTransport>,
    retry: Duration,
    max_reconnects: u32,
    seen: HashSet<String>,
    /// The current connection delivered its `historical_complete`.
    synced: bool,
}

impl std::fmt::Debug for TailClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailClient")
            .field("retry", &self.retry)
            .field("max_reconnects", &self.max_reconnects)
            .field("seen", &self.seen.len())
            .finish_non_exhaustive()
    }
}

fn dedup_key(frame: &TailFrame) -> Option<String> {
    match frame {
        TailFrame::Event(EventFrame::ConversationUpdate(record)) => {
            Some(record.dedup_key(ChangeOperation::Update))
        }
        other => other.record_id().map(str::to_string),
    }
}

impl TailClient {
    pub fn new(transport: Arc<dyn TailTransport>, max_reconnects: u32) -> Self {
        Self {
            transport,
            retry: DEFAULT_RETRY,
            max_reconnects,
            seen: HashSet::new(),
            synced: false,
        }
    }

    /// Current reconnect delay.
    #[must_use]
    pub fn retry(&self) -> Duration {
        self.retry
    }

    /// Stream frames into `sink` until it closes or reconnects run out.
    ///
    /// `max_reconnects` bounds consecutive failed attempts; a connection that
    /// got through its backlog starts the count again. Returns the last
    /// transport error when the final attempt failed.
    pub async fn follow(
        &mut self,
        kind: TailKind,
        query: &TailQuery,
        sink: mpsc::Sender<TailFrame>,
    ) -> Result<(), ClientError> {
        let mut attempts = 0;
        loop {
            let outcome = self.connect_once(kind, query, &sink).await;
            if sink.is_closed() {
                return Ok(());
            }
            if self.synced {
                attempts = 0;
            }
            if attempts >= self.max_reconnects {
                return outcome.map_err(ClientError::from);
            }
            if let Err(err) = &outcome {
                warn!(kind = kind.as_str(), error = %err, "tail connection failed");
            }

            attempts += 1;
            debug!(kind = kind.as_str(), attempt = attempts, delay_ms = self.retry.as_millis(), "reconnecting tail");
            tokio::time::sleep(self.retry).await;
        }
    }

    async fn connect_once(
        &mut self,
        kind: TailKind,
        query: &TailQuery,
        sink: &mpsc::Sender<TailFrame>,
    ) -> Result<(), TransportError> {
        self.synced = false;
        let mut items = self.transport.open_tail(kind, query).await?;
        while let Some(item) = items.next().await {
            let frame = match item {
                Ok(TailItem::Retry(retry)) => {
                    self.retry = retry;
                    continue;
                }
                Ok(TailItem::Frame(frame)) => frame,
                Err(TransportError::Decode(message)) => {
                    warn!(%message, "skipping malformed tail frame");
                    continue;
                }
                Err(err) => return Err(err),
            };

            if let Some(key) = dedup_key(&frame) {
                if !self.seen.insert(key) {
                    continue;
                }
            }
            match &frame {
                TailFrame::Control(ControlFrame::HistoricalComplete) => self.synced = true,
                TailFrame::Control(ControlFrame::Flush { reason }) => {
                    info!(%reason, "tail flushed; forgetting delivered records");
                    self.seen.clear();
                }
                TailFrame::Control(ControlFrame::SessionClosed { reason }) => {
                    debug!(%reason, "server closed tail session");
                }
                _ => {}
            }
            if sink.send(frame).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TailStream;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use shared::models::LogRecord;
    use std::sync::Mutex;
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    struct ScriptedTail {
        connections: Mutex<VecDeque<Vec<Result<TailItem, TransportError>>>>,
    }

    #[async_trait]
    impl TailTransport for ScriptedTail {
        async fn open_tail(
            &self,
            _kind: TailKind,
            _query: &TailQuery,
        ) -> Result<TailStream, TransportError> {
            let items = self
                .connections
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Connection("refused".into()))?;
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    fn log(id: u32) -> Result<TailItem, TransportError> {
        Ok(TailItem::Frame(TailFrame::Event(EventFrame::HistoricalLog(
            LogRecord {
                id: id.to_string(),
                timestamp: Utc.timestamp_opt(i64::from(id), 0).unwrap(),
                level: "info".into(),
                message: format!("line {id}"),
                meta: serde_json::Value::Null,
            },
        ))))
    }

    fn control(frame: ControlFrame) -> Result<TailItem, TransportError> {
        Ok(TailItem::Frame(TailFrame::Control(frame)))
    }

    async fn drain(mut rx: mpsc::Receiver<TailFrame>) -> Vec<TailFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    fn ids(frames: &[TailFrame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|frame| frame.record_id().map(str::to_string))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_honours_retry_hint_and_suppresses_replayed_records() {
        let transport = Arc::new(ScriptedTail::default());
        transport.connections.lock().unwrap().extend([
            vec![
                Ok(TailItem::Retry(Duration::from_millis(250))),
                log(1),
                log(2),
                control(ControlFrame::HistoricalComplete),
                Err(TransportError::Connection("reset".into())),
            ],
            vec![log(1), log(2), log(3), control(ControlFrame::HistoricalComplete)],
        ]);

        let mut client = TailClient::new(transport, 1);
        let (tx, rx) = mpsc::channel(32);
        let started = tokio::time::Instant::now();
        let result = client.follow(TailKind::Logs, &TailQuery::default(), tx).await;

        // Both connections synced, so only the refused third attempt counts.
        assert!(matches!(
            result,
            Err(ClientError::Transport(TransportError::Connection(_)))
        ));

        assert_eq!(client.retry(), Duration::from_millis(250));
        assert!(started.elapsed() >= Duration::from_millis(250));
        let frames = drain(rx).await;
        assert_eq!(ids(&frames), ["1", "2", "3"]);
        assert_eq!(
            frames.iter().filter(|f| f.is_historical_complete()).count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flush_forgets_delivered_records() {
        let transport = Arc::new(ScriptedTail::default());
        transport.connections.lock().unwrap().push_back(vec![
            log(1),
            control(ControlFrame::Flush {
                reason: "reindex".into(),
            }),
            log(1),
        ]);

        let mut client = TailClient::new(transport, 0);
        let (tx, rx) = mpsc::channel(32);
        client
            .follow(TailKind::Logs, &TailQuery::default(), tx)
            .await
            .unwrap();

        assert_eq!(ids(&drain(rx).await), ["1", "1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn synced_connections_do_not_use_up_reconnects() {
        let transport = Arc::new(ScriptedTail::default());
        transport.connections.lock().unwrap().extend([
            vec![log(1), control(ControlFrame::HistoricalComplete)],
            vec![log(2), control(ControlFrame::HistoricalComplete)],
            vec![log(3), control(ControlFrame::HistoricalComplete)],
        ]);

        let mut client = TailClient::new(Arc::clone(&transport) as Arc<dyn TailTransport>, 1);
        let (tx, rx) = mpsc::channel(32);
        let result = client.follow(TailKind::Logs, &TailQuery::default(), tx).await;

        assert!(result.is_err());
        assert!(transport.connections.lock().unwrap().is_empty());
        assert_eq!(ids(&drain(rx).await), ["1", "2", "3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_surface_the_error() {
        let transport = Arc::new(ScriptedTail::default());
        let mut client = TailClient::new(transport, 2);
        let (tx, _rx) = mpsc::channel(4);

        let result = client.follow(TailKind::Logs, &TailQuery::default(), tx).await;
        assert!(matches!(
            result,
            Err(ClientError::Transport(TransportError::Connection(_)))
        ));
    }
}
