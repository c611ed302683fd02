//! Process-wide map from conversation to its live client session.
//!
//! A conversation has at most one session. The handle is registered before
//! its task starts, so a second submit for the same conversation reattaches
//! instead of opening a duplicate stream. A handle whose task never started
//! or has finished no longer holds the slot.

use std::collections::HashMap;

use tokio::sync::{Mutex, mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::session::{ClientPhase, Command};

/// Cloneable reference to a running session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub(crate) session_id: Uuid,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) phase: watch::Receiver<ClientPhase>,
}

impl SessionHandle {
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    #[must_use]
    pub fn phase(&self) -> ClientPhase {
        *self.phase.borrow()
    }

    /// Still connecting: the transport is not open yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.phase(), ClientPhase::Idle | ClientPhase::Connecting)
    }

    fn is_open(&self) -> bool {
        !self.commands.is_closed()
    }
}

#[derive(Debug)]
pub enum Begin {
    /// Nothing was running; the offered handle now owns the slot.
    Open,
    Reattach(SessionHandle),
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    slots: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the conversation for `handle` unless another session is open.
    pub async fn begin(&self, conversation_id: Uuid, handle: SessionHandle) -> Begin {
        let mut guard = self.slots.lock().await;
        if let Some(existing) = guard.get(&conversation_id).filter(|h| h.is_open()) {
            return Begin::Reattach(existing.clone());
        }
        guard.insert(conversation_id, handle);
        Begin::Open
    }

    /// Remove the entry only if it still belongs to `session_id`.
    pub async fn release(&self, conversation_id: Uuid, session_id: Uuid) {
        let mut guard = self.slots.lock().await;
        if guard
            .get(&conversation_id)
            .is_some_and(|handle| handle.session_id == session_id)
        {
            guard.remove(&conversation_id);
            debug!(%conversation_id, %session_id, "session released");
        }
    }

    pub async fn handle(&self, conversation_id: Uuid) -> Option<SessionHandle> {
        self.slots
            .lock()
            .await
            .get(&conversation_id)
            .filter(|handle| handle.is_open())
            .cloned()
    }
}
