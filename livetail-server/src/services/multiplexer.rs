use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::models::{TailFilter, TailFrame, TailKind};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::tail_session::{CloseReason, SessionControl, SessionPhase, SessionState};

/// Registry entry for one live tail session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    kind: TailKind,
    filter: TailFilter,
    created_at: DateTime<Utc>,
    control: mpsc::Sender<SessionControl>,
    state: Arc<SessionState>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: Uuid,
        kind: TailKind,
        filter: TailFilter,
        control: mpsc::Sender<SessionControl>,
        state: Arc<SessionState>,
    ) -> Self {
        Self {
            id,
            kind,
            filter,
            created_at: Utc::now(),
            control,
            state,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> TailKind {
        self.kind
    }

    #[must_use]
    pub fn filter(&self) -> &TailFilter {
        &self.filter
    }

    /// Ask the session to close. A no-op once it already has.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.control.try_send(SessionControl::Close(reason)).is_ok()
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            kind: self.kind,
            filter: self.filter.clone(),
            phase: self.state.phase(),
            created_at: self.created_at,
            last_activity: self.state.last_activity(),
        }
    }
}

/// Admin view of a registered session.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub kind: TailKind,
    pub filter: TailFilter,
    pub phase: SessionPhase,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Process-wide registry of live tail sessions, owned by the server and
/// injected through application state.
#[derive(Debug, Default)]
pub struct SessionMultiplexer {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
}

impl SessionMultiplexer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; returns false when the id was already registered.
    pub async fn register(&self, handle: SessionHandle) -> bool {
        let mut guard = self.sessions.write().await;
        if guard.contains_key(&handle.id) {
            return false;
        }
        debug!(session_id = %handle.id, kind = handle.kind.as_str(), "session registered");
        guard.insert(handle.id, handle);
        true
    }

    /// Unregistering an unknown or already closed session is a no-op.
    pub async fn unregister(&self, session_id: Uuid) -> bool {
        self.sessions.write().await.remove(&session_id).is_some()
    }

    /// Deliver `frame` to every session accepted by `predicate`; returns how
    /// many sessions took it.
    pub async fn broadcast<P>(&self, predicate: P, frame: &TailFrame) -> usize
    where
        P: Fn(&SessionHandle) -> bool,
    {
        let guard = self.sessions.read().await;
        let mut delivered = 0;
        for handle in guard.values().filter(|handle| predicate(handle)) {
            match handle
                .control
                .try_send(SessionControl::Broadcast(frame.clone()))
            {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = %handle.id, "control queue full; broadcast dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Close every registered session with `CloseReason::Shutdown`.
    pub async fn shutdown_all(&self) -> usize {
        let guard = self.sessions.read().await;
        guard
            .values()
            .filter(|handle| handle.close(CloseReason::Shutdown))
            .count()
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(SessionHandle::info)
            .collect();
        sessions.sort_by_key(|info| info.created_at);
        sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

pub type SharedMultiplexer = Arc<SessionMultiplexer>;
