//! Tracks in-flight chat generations so they can be aborted remotely or
//! timed out, independently of the HTTP connection that started them.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    None,
    Cancelled,
    TimedOut,
    Completed,
}

impl StopReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Completed => "completed",
        }
    }
}

const ACTIVE: u8 = 0;
const CANCELLED: u8 = 1;
const TIMED_OUT: u8 = 2;
const COMPLETED: u8 = 3;

/// One generation. The first terminal transition wins.
#[derive(Debug)]
pub struct GenerationHandle {
    token: CancellationToken,
    state: AtomicU8,
    started_at: Instant,
}

impl GenerationHandle {
    fn new(timeout: Option<Duration>) -> Arc<Self> {
        let handle = Arc::new(Self {
            token: CancellationToken::new(),
            state: AtomicU8::new(ACTIVE),
            started_at: Instant::now(),
        });

        if let Some(timeout) = timeout.filter(|d| !d.is_zero()) {
            let weak = Arc::downgrade(&handle);
            let token = handle.token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => {
                        if let Some(handle) = weak.upgrade() {
                            handle.mark_timed_out();
                        }
                    }
                    () = token.cancelled() => {}
                }
            });
        }

        handle
    }

    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(ACTIVE, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn mark_cancelled(&self) -> bool {
        if !self.transition(CANCELLED) {
            return false;
        }
        self.token.cancel();
        counter!("livetail_generation_aborts_total").increment(1);
        histogram!("livetail_generation_abort_latency_ms")
            .record(self.started_at.elapsed().as_secs_f64() * 1000.0);
        true
    }

    pub fn mark_timed_out(&self) -> bool {
        if !self.transition(TIMED_OUT) {
            return false;
        }
        self.token.cancel();
        counter!("livetail_generation_timeouts_total").increment(1);
        true
    }

    /// Also releases the timeout watcher.
    pub fn mark_completed(&self) {
        if self.transition(COMPLETED) {
            self.token.cancel();
        }
    }

    #[must_use]
    pub fn stop_reason(&self) -> StopReason {
        match self.state.load(Ordering::SeqCst) {
            CANCELLED => StopReason::Cancelled,
            TIMED_OUT => StopReason::TimedOut,
            COMPLETED => StopReason::Completed,
            _ => StopReason::None,
        }
    }
}

/// Registry of generations keyed by conversation id.
#[derive(Debug)]
pub struct StreamSupervisor {
    generations: RwLock<HashMap<Uuid, Arc<GenerationHandle>>>,
    timeout: Option<Duration>,
}

impl StreamSupervisor {
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            generations: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a new generation for `conversation_id`, unless one is still
    /// running there.
    pub async fn start(&self, conversation_id: Uuid) -> Option<Arc<GenerationHandle>> {
        let mut guard = self.generations.write().await;
        if let Some(existing) = guard.get(&conversation_id) {
            if existing.stop_reason() == StopReason::None {
                return None;
            }
        }
        let handle = GenerationHandle::new(self.timeout);
        guard.insert(conversation_id, Arc::clone(&handle));
        Some(handle)
    }

    /// Drop the entry only if it still refers to `handle`.
    pub async fn finish(&self, conversation_id: Uuid, handle: &Arc<GenerationHandle>) {
        handle.mark_completed();
        let mut guard = self.generations.write().await;
        if guard
            .get(&conversation_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            guard.remove(&conversation_id);
        }
    }

    /// Idempotent remote abort. Repeated calls report the same reason.
    pub async fn cancel(&self, conversation_id: Uuid) -> StopReason {
        let handle = self.generations.read().await.get(&conversation_id).cloned();
        handle.map_or(StopReason::None, |handle| {
            if handle.mark_cancelled() {
                StopReason::Cancelled
            } else {
                handle.stop_reason()
            }
        })
    }

    pub async fn is_running(&self, conversation_id: Uuid) -> bool {
        self.generations
            .read()
            .await
            .get(&conversation_id)
            .is_some_and(|handle| handle.stop_reason() == StopReason::None)
    }
}

pub type SharedStreamSupervisor = Arc<StreamSupervisor>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let supervisor = StreamSupervisor::new(None);
        let conversation = Uuid::new_v4();
        let handle = supervisor.start(conversation).await.unwrap();

        assert_eq!(supervisor.cancel(conversation).await, StopReason::Cancelled);
        assert_eq!(supervisor.cancel(conversation).await, StopReason::Cancelled);
        assert!(handle.token().is_cancelled());
    }

    #[tokio::test]
    async fn unknown_conversation_has_nothing_to_stop() {
        let supervisor = StreamSupervisor::new(None);
        assert_eq!(supervisor.cancel(Uuid::new_v4()).await, StopReason::None);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_the_generation() {
        let supervisor = StreamSupervisor::new(Some(Duration::from_secs(5)));
        let conversation = Uuid::new_v4();
        let handle = supervisor.start(conversation).await.unwrap();

        handle.token().cancelled().await;

        assert_eq!(handle.stop_reason(), StopReason::TimedOut);
        assert_eq!(supervisor.cancel(conversation).await, StopReason::TimedOut);
    }

    #[tokio::test]
    async fn one_running_generation_per_conversation() {
        let supervisor = StreamSupervisor::new(None);
        let conversation = Uuid::new_v4();
        let first = supervisor.start(conversation).await.unwrap();
        assert!(supervisor.start(conversation).await.is_none());

        supervisor.finish(conversation, &first).await;
        assert!(!supervisor.is_running(conversation).await);
        assert!(supervisor.start(conversation).await.is_some());
    }

    #[tokio::test]
    async fn completion_after_cancel_keeps_cancelled() {
        let supervisor = StreamSupervisor::new(None);
        let conversation = Uuid::new_v4();
        let handle = supervisor.start(conversation).await.unwrap();

        supervisor.cancel(conversation).await;
        supervisor.finish(conversation, &handle).await;
        assert_eq!(handle.stop_reason(), StopReason::Cancelled);
    }
}
