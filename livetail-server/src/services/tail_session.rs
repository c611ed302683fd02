//! Server side tail session: backlog replay, `historical_complete`, then live
//! forwarding with dedup, heartbeats and a hard session timeout.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU8, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use metrics::{counter, gauge};
use serde::Serialize;
use shared::{
    config::server::TailConfig,
    models::{
        ChangeEvent, ChangeOperation, ControlFrame, PageRequest, TailFilter, TailFrame, TailRecord,
    },
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    backlog::{BacklogFetcher, BacklogPage, BacklogSource},
    change_source::{ChangeSource, ChangeSourceError, ChangeStream},
    multiplexer::{SessionHandle, SharedMultiplexer},
};

const CONTROL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Init,
    Backlog,
    Live,
    Closing,
    Closed,
}

impl SessionPhase {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Backlog => 1,
            Self::Live => 2,
            Self::Closing => 3,
            Self::Closed => 4,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Backlog,
            2 => Self::Live,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a session left the LIVE phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client went away or the transport broke.
    Disconnected,
    Timeout,
    Shutdown,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Item written to the transport by a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    /// Reconnect backoff advice; always the first output.
    Retry(Duration),
    Frame(TailFrame),
}

impl SessionOutput {
    #[must_use]
    pub fn frame(&self) -> Option<&TailFrame> {
        match self {
            Self::Retry(_) => None,
            Self::Frame(frame) => Some(frame),
        }
    }
}

/// Out-of-band instructions delivered through the multiplexer.
#[derive(Debug, Clone)]
pub enum SessionControl {
    Broadcast(TailFrame),
    Close(CloseReason),
}

/// Observable state of a session, shared with its multiplexer handle.
#[derive(Debug)]
pub struct SessionState {
    phase: AtomicU8,
    last_activity_ms: AtomicI64,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self {
            phase: AtomicU8::new(SessionPhase::Init.as_u8()),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity_ms.load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Identifiers already emitted by one session.
///
/// Unbounded for the life of the session; sessions are time-boxed by the
/// session timeout and the set is released on close.
#[derive(Debug, Default)]
pub struct ProcessedIds {
    seen: HashSet<String>,
}

impl ProcessedIds {
    /// Record `key`; false when it was already present.
    pub fn record(&mut self, key: String) -> bool {
        self.seen.insert(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn release(&mut self) {
        self.seen = HashSet::new();
    }
}

/// Filter and dedup a single live change, producing the frame to emit.
pub fn admit_change<R: TailRecord>(
    filter: &TailFilter,
    processed: &mut ProcessedIds,
    event: ChangeEvent<R>,
) -> Option<TailFrame> {
    if !event.full_record.matches(filter) {
        return None;
    }
    if !processed.record(event.full_record.dedup_key(event.operation)) {
        counter!("livetail_tail_dedup_suppressed_total", "kind" => R::KIND.as_str())
            .increment(1);
        return None;
    }
    Some(event.full_record.live_frame(event.operation))
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub heartbeat: Duration,
    pub timeout: Duration,
    pub retry_hint: Duration,
    pub channel_capacity: usize,
    pub max_snapshot_records: u32,
}

impl From<&TailConfig> for SessionSettings {
    fn from(config: &TailConfig) -> Self {
        Self {
            heartbeat: config.heartbeat_interval(),
            timeout: config.session_timeout(),
            retry_hint: config.retry_hint(),
            channel_capacity: config.channel_capacity.max(1),
            max_snapshot_records: config.max_snapshot_records,
        }
    }
}

/// A spawned session. Dropping `output` closes the session.
#[derive(Debug)]
pub struct RunningSession {
    pub id: Uuid,
    pub output: mpsc::Receiver<SessionOutput>,
    pub task: JoinHandle<CloseReason>,
}

/// Opens tail sessions of one record kind.
pub struct TailService<R> {
    fetcher: BacklogFetcher<R>,
    changes: Arc<dyn ChangeSource<R>>,
    settings: SessionSettings,
    multiplexer: SharedMultiplexer,
}

impl<R> Clone for TailService<R> {
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            changes: Arc::clone(&self.changes),
            settings: self.settings,
            multiplexer: Arc::clone(&self.multiplexer),
        }
    }
}

impl<R> std::fmt::Debug for TailService<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailService")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<R: TailRecord> TailService<R> {
    pub fn new(
        backlog: Arc<dyn BacklogSource<R>>,
        changes: Arc<dyn ChangeSource<R>>,
        settings: SessionSettings,
        multiplexer: SharedMultiplexer,
    ) -> Self {
        Self {
            fetcher: BacklogFetcher::new(backlog, settings.max_snapshot_records),
            changes,
            settings,
            multiplexer,
        }
    }

    #[must_use]
    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    /// Spawn a session for `filter`. The session registers itself with the
    /// multiplexer before any output is produced.
    pub async fn open(&self, filter: TailFilter, page: PageRequest) -> RunningSession {
        let id = Uuid::new_v4();
        let (tx, output) = mpsc::channel(self.settings.channel_capacity);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let state = Arc::new(SessionState::new());

        let handle = SessionHandle::new(
            id,
            R::KIND,
            filter.clone(),
            control_tx,
            Arc::clone(&state),
        );
        self.multiplexer.register(handle).await;
        counter!("livetail_tail_sessions_opened_total", "kind" => R::KIND.as_str()).increment(1);
        gauge!("livetail_tail_sessions_active").increment(1.0);

        let session = TailSession {
            id,
            filter,
            page,
            fetcher: self.fetcher.clone(),
            changes: Arc::clone(&self.changes),
            settings: self.settings,
            multiplexer: Arc::clone(&self.multiplexer),
            state,
        };
        let task = tokio::spawn(session.run(tx, control_rx));

        RunningSession { id, output, task }
    }
}

struct TailSession<R> {
    id: Uuid,
    filter: TailFilter,
    page: PageRequest,
    fetcher: BacklogFetcher<R>,
    changes: Arc<dyn ChangeSource<R>>,
    settings: SessionSettings,
    multiplexer: SharedMultiplexer,
    state: Arc<SessionState>,
}

/// The receiving side is gone.
#[derive(Debug)]
struct Disconnected;

async fn next_change<R>(
    changes: &mut Option<ChangeStream<R>>,
) -> Option<Result<ChangeEvent<R>, ChangeSourceError>> {
    match changes {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl<R: TailRecord> TailSession<R> {
    async fn run(
        self,
        tx: mpsc::Sender<SessionOutput>,
        mut control_rx: mpsc::Receiver<SessionControl>,
    ) -> CloseReason {
        let kind = R::KIND;
        let deadline = tokio::time::sleep(self.settings.timeout);
        tokio::pin!(deadline);
        let mut processed = ProcessedIds::default();
        info!(session_id = %self.id, kind = kind.as_str(), filter = ?self.filter, "tail session opened");

        let opening = async {
            self.send(&tx, SessionOutput::Retry(self.settings.retry_hint))
                .await?;
            // Subscribe first so changes racing the backlog query are buffered.
            let subscription = self.changes.watch(&self.filter).await;
            self.replay_backlog(&tx, &mut processed).await?;
            let changes = match subscription {
                Ok(stream) => Some(stream),
                Err(err) => {
                    warn!(session_id = %self.id, error = %err, "live change source unavailable");
                    self.emit(&tx, TailFrame::warning(format!("Live updates disabled: {err}")))
                        .await?;
                    None
                }
            };
            Ok::<_, Disconnected>(changes)
        };

        let opened = tokio::select! {
            biased;
            () = &mut deadline => Err(CloseReason::Timeout),
            opened = opening => opened.map_err(|Disconnected| CloseReason::Disconnected),
        };

        let reason = match opened {
            Ok(changes) => {
                self.state.set_phase(SessionPhase::Live);
                self.live(&tx, &mut control_rx, &mut deadline, &mut processed, changes)
                    .await
            }
            Err(reason) => reason,
        };

        self.close(&tx, &mut processed, reason).await;
        reason
    }

    async fn replay_backlog(
        &self,
        tx: &mpsc::Sender<SessionOutput>,
        processed: &mut ProcessedIds,
    ) -> Result<(), Disconnected> {
        self.state.set_phase(SessionPhase::Backlog);

        let page = match self.fetcher.fetch(&self.filter, self.page).await {
            Ok(page) => page,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "backlog fetch failed; continuing live");
                counter!("livetail_tail_backlog_errors_total", "kind" => R::KIND.as_str())
                    .increment(1);
                BacklogPage::empty()
            }
        };

        let count = page.records.len() as u64;
        self.emit(
            tx,
            TailFrame::Control(ControlFrame::Init {
                count,
                total: page.total,
            }),
        )
        .await?;

        for record in page.records.into_iter().rev() {
            // The backlog already shows this state; a buffered update for it is a repeat.
            processed.record(record.dedup_key(ChangeOperation::Insert));
            processed.record(record.dedup_key(ChangeOperation::Update));
            self.emit(tx, record.historical_frame()).await?;
        }

        self.emit(tx, TailFrame::Control(ControlFrame::HistoricalComplete))
            .await?;
        debug!(session_id = %self.id, count, "backlog replayed");
        Ok(())
    }

    async fn live(
        &self,
        tx: &mpsc::Sender<SessionOutput>,
        control_rx: &mut mpsc::Receiver<SessionControl>,
        deadline: &mut std::pin::Pin<&mut tokio::time::Sleep>,
        processed: &mut ProcessedIds,
        mut changes: Option<ChangeStream<R>>,
    ) -> CloseReason {
        let period = self.settings.heartbeat;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let frame = tokio::select! {
                biased;
                () = deadline.as_mut() => return CloseReason::Timeout,
                () = tx.closed() => return CloseReason::Disconnected,
                Some(control) = control_rx.recv() => match control {
                    SessionControl::Close(reason) => return reason,
                    SessionControl::Broadcast(frame) => frame,
                },
                _ = heartbeat.tick() => {
                    let frame = TailFrame::heartbeat(Utc::now());
                    match tx.try_send(SessionOutput::Frame(frame)) {
                        Ok(()) => {
                            counter!("livetail_tail_heartbeats_total").increment(1);
                        }
                        // A full channel means the connection is not idle.
                        Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            return CloseReason::Disconnected;
                        }
                    }
                    continue;
                }
                change = next_change(&mut changes) => match change {
                    Some(Ok(event)) => match admit_change(&self.filter, processed, event) {
                        Some(frame) => frame,
                        None => continue,
                    },
                    Some(Err(err)) => {
                        warn!(session_id = %self.id, error = %err, "skipping change notification");
                        continue;
                    }
                    None => {
                        warn!(session_id = %self.id, "live change stream ended");
                        changes = None;
                        TailFrame::warning("Live updates interrupted")
                    }
                },
            };

            // A reader that stops draining must not hold the session past its deadline.
            tokio::select! {
                biased;
                () = deadline.as_mut() => return CloseReason::Timeout,
                sent = self.emit(tx, frame) => {
                    if sent.is_err() {
                        return CloseReason::Disconnected;
                    }
                }
            }
        }
    }

    async fn close(
        &self,
        tx: &mpsc::Sender<SessionOutput>,
        processed: &mut ProcessedIds,
        reason: CloseReason,
    ) {
        self.state.set_phase(SessionPhase::Closing);
        let farewell = TailFrame::Control(ControlFrame::SessionClosed {
            reason: reason.as_str().to_string(),
        });
        // Best effort: only if the transport can still take it.
        let _ = tx.try_send(SessionOutput::Frame(farewell));

        processed.release();
        self.multiplexer.unregister(self.id).await;
        self.state.set_phase(SessionPhase::Closed);

        counter!(
            "livetail_tail_sessions_closed_total",
            "kind" => R::KIND.as_str(),
            "reason" => reason.as_str()
        )
        .increment(1);
        gauge!("livetail_tail_sessions_active").decrement(1.0);
        info!(session_id = %self.id, reason = reason.as_str(), "tail session closed");
    }

    async fn emit(
        &self,
        tx: &mpsc::Sender<SessionOutput>,
        frame: TailFrame,
    ) -> Result<(), Disconnected> {
        counter!("livetail_tail_frames_total", "class" => frame.delivery_class().as_str())
            .increment(1);
        self.send(tx, SessionOutput::Frame(frame)).await
    }

    async fn send(
        &self,
        tx: &mpsc::Sender<SessionOutput>,
        output: SessionOutput,
    ) -> Result<(), Disconnected> {
        tx.send(output).await.map_err(|_| Disconnected)?;
        self.state.touch();
        Ok(())
    }
}
