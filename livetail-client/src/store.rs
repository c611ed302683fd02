//! Per-conversation message cache shared by every view and session.
//!
//! Frames are applied idempotently: deltas and steps carry the server's
//! sequence index and anything at or below the last applied index is
//! ignored, so replaying a stream after reattaching never duplicates text.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::models::{Attachment, ChatFrame, MessageRole, MessageState, StepEvent};
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    pub message_id: Uuid,
    pub role: MessageRole,
    pub text: String,
    pub steps: Vec<StepEvent>,
    pub attachments: Vec<Attachment>,
    pub unfinished: bool,
    pub aborted: bool,
    /// Still carrying the client-generated id.
    pub placeholder: bool,
    pub created_at: DateTime<Utc>,
    applied_through: Option<u64>,
}

impl LocalMessage {
    fn new(message_id: Uuid, role: MessageRole, text: String, unfinished: bool) -> Self {
        Self {
            message_id,
            role,
            text,
            steps: Vec::new(),
            attachments: Vec::new(),
            unfinished,
            aborted: false,
            placeholder: true,
            created_at: Utc::now(),
            applied_through: None,
        }
    }

    fn accepts(&self, index: u64) -> bool {
        self.applied_through.is_none_or(|last| index > last)
    }

    /// Adopt the durable state, keeping the local index watermark.
    fn absorb(&mut self, durable: &MessageState) {
        self.message_id = durable.message_id;
        self.role = durable.role;
        self.text.clone_from(&durable.text);
        self.steps.clone_from(&durable.steps);
        self.attachments.clone_from(&durable.attachments);
        self.unfinished = durable.unfinished;
        self.aborted = durable.aborted;
        self.placeholder = false;
        self.created_at = durable.created_at;
    }
}

impl From<&MessageState> for LocalMessage {
    fn from(durable: &MessageState) -> Self {
        let mut message = Self::new(durable.message_id, durable.role, String::new(), false);
        message.absorb(durable);
        message
    }
}

/// Snapshot of one conversation as published to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationView {
    pub conversation_id: Uuid,
    pub messages: Vec<LocalMessage>,
    /// A submission is in flight.
    pub submitting: bool,
    pub error: Option<String>,
    pending_user: Option<Uuid>,
    pending_response: Option<Uuid>,
}

impl ConversationView {
    fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn message(&self, message_id: Uuid) -> Option<&LocalMessage> {
        self.messages
            .iter()
            .find(|message| message.message_id == message_id)
    }

    /// The most recent assistant message.
    #[must_use]
    pub fn latest_response(&self) -> Option<&LocalMessage> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant)
    }

    fn message_mut(&mut self, message_id: Uuid) -> Option<&mut LocalMessage> {
        self.messages
            .iter_mut()
            .find(|message| message.message_id == message_id)
    }

    fn rekey(&mut self, from: Uuid, to: Uuid) -> bool {
        if from == to {
            return self.message_mut(to).is_some_and(|message| {
                std::mem::replace(&mut message.placeholder, false)
            });
        }
        if self.message(to).is_some() {
            self.messages.retain(|message| message.message_id != from);
            return true;
        }
        match self.message_mut(from) {
            Some(message) => {
                message.message_id = to;
                message.placeholder = false;
                true
            }
            None => false,
        }
    }

    fn apply(&mut self, frame: &ChatFrame) -> bool {
        match frame {
            ChatFrame::Created {
                user_message_id,
                response_message_id,
                placeholder_response_id,
                ..
            } => {
                let mut changed = false;
                if let Some(pending) = self.pending_user.take() {
                    changed |= self.rekey(pending, *user_message_id);
                }
                self.pending_response = None;
                changed | self.rekey(*placeholder_response_id, *response_message_id)
            }
            ChatFrame::Sync {
                user_message_id,
                response_message_id,
                ..
            } => {
                let mut changed = false;
                if let Some(pending) = self.pending_user.take() {
                    changed |= self.rekey(pending, *user_message_id);
                }
                if let Some(pending) = self.pending_response.take() {
                    changed |= self.rekey(pending, *response_message_id);
                }
                changed
            }
            ChatFrame::Delta {
                message_id,
                index,
                text,
            } => match self.message_mut(*message_id) {
                Some(message) if message.accepts(*index) => {
                    message.text.push_str(text);
                    message.applied_through = Some(*index);
                    true
                }
                _ => false,
            },
            ChatFrame::Step {
                message_id,
                index,
                step,
            } => match self.message_mut(*message_id) {
                Some(message) if message.accepts(*index) => {
                    match message
                        .steps
                        .iter_mut()
                        .find(|existing| existing.step_id == step.step_id)
                    {
                        Some(existing) => existing.clone_from(step),
                        None => message.steps.push(step.clone()),
                    }
                    message.applied_through = Some(*index);
                    true
                }
                _ => false,
            },
            ChatFrame::Attachment {
                message_id,
                attachment,
            } => match self.message_mut(*message_id) {
                Some(message)
                    if !message
                        .attachments
                        .iter()
                        .any(|existing| existing.attachment_id == attachment.attachment_id) =>
                {
                    message.attachments.push(attachment.clone());
                    true
                }
                _ => false,
            },
            ChatFrame::Final {
                message, aborted, ..
            } => {
                match self.message_mut(message.message_id) {
                    Some(local) => local.absorb(message),
                    None => self.messages.push(LocalMessage::from(message)),
                }
                if let Some(local) = self.message_mut(message.message_id) {
                    local.aborted |= *aborted;
                }
                self.submitting = false;
                true
            }
            ChatFrame::Error { message } => {
                self.error = Some(message.clone());
                self.submitting = false;
                true
            }
        }
    }
}

/// Shared cache of conversations; every mutation notifies subscribers of
/// that conversation through a watch channel.
#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: Mutex<HashMap<Uuid, watch::Sender<ConversationView>>>,
}

impl MessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, conversation_id: Uuid, modify: F) -> bool
    where
        F: FnOnce(&mut ConversationView) -> bool,
    {
        let mut guard = self.conversations.lock().await;
        let sender = guard
            .entry(conversation_id)
            .or_insert_with(|| watch::Sender::new(ConversationView::new(conversation_id)));
        sender.send_if_modified(modify)
    }

    pub async fn subscribe(&self, conversation_id: Uuid) -> watch::Receiver<ConversationView> {
        let mut guard = self.conversations.lock().await;
        guard
            .entry(conversation_id)
            .or_insert_with(|| watch::Sender::new(ConversationView::new(conversation_id)))
            .subscribe()
    }

    pub async fn snapshot(&self, conversation_id: Uuid) -> Option<ConversationView> {
        self.conversations
            .lock()
            .await
            .get(&conversation_id)
            .map(|sender| sender.borrow().clone())
    }

    /// Record the user's message and an empty placeholder response, both
    /// under client-generated ids until the server assigns real ones.
    pub async fn begin_submission(
        &self,
        conversation_id: Uuid,
        client_message_id: Uuid,
        placeholder_response_id: Uuid,
        text: &str,
    ) {
        self.update(conversation_id, |view| {
            view.messages.push(LocalMessage::new(
                client_message_id,
                MessageRole::User,
                text.to_string(),
                false,
            ));
            view.messages.push(LocalMessage::new(
                placeholder_response_id,
                MessageRole::Assistant,
                String::new(),
                true,
            ));
            view.pending_user = Some(client_message_id);
            view.pending_response = Some(placeholder_response_id);
            view.submitting = true;
            view.error = None;
            true
        })
        .await;
    }

    /// Apply one stream frame; returns whether anything changed.
    pub async fn apply(&self, conversation_id: Uuid, frame: &ChatFrame) -> bool {
        self.update(conversation_id, |view| view.apply(frame)).await
    }

    /// Merge durable state fetched from the server. Returns `true` once the
    /// latest response is finished.
    pub async fn reconcile(&self, conversation_id: Uuid, durable: &[MessageState]) -> bool {
        let mut finished = false;
        self.update(conversation_id, |view| {
            let before = view.clone();
            let last_of = |role| {
                durable
                    .iter()
                    .rev()
                    .find(|state| state.role == role)
                    .map(|state| state.message_id)
            };
            let last_user = last_of(MessageRole::User);
            let last_response = last_of(MessageRole::Assistant);

            for state in durable {
                match view.message_mut(state.message_id) {
                    Some(local) => local.absorb(state),
                    None => {
                        // Only the newest exchange can still be under client ids.
                        let placeholder = match state.role {
                            MessageRole::User if last_user == Some(state.message_id) => {
                                view.pending_user
                            }
                            MessageRole::Assistant if last_response == Some(state.message_id) => {
                                view.pending_response
                            }
                            _ => None,
                        };
                        match placeholder.and_then(|id| view.message_mut(id)) {
                            Some(local) => local.absorb(state),
                            None => view.messages.push(LocalMessage::from(state)),
                        }
                        if placeholder.is_some() {
                            match state.role {
                                MessageRole::User => view.pending_user = None,
                                MessageRole::Assistant => view.pending_response = None,
                            }
                        }
                    }
                }
            }
            finished = view
                .latest_response()
                .is_some_and(|response| !response.unfinished);
            if finished {
                view.submitting = false;
            }
            *view != before
        })
        .await;
        finished
    }

    /// Close out the in-flight response locally after a cancel.
    pub async fn mark_aborted(&self, conversation_id: Uuid) {
        self.update(conversation_id, |view| {
            if let Some(response) = view
                .messages
                .iter_mut()
                .rev()
                .find(|message| message.role == MessageRole::Assistant && message.unfinished)
            {
                response.unfinished = false;
                response.aborted = true;
            }
            view.submitting = false;
            true
        })
        .await;
    }

    pub async fn fail(&self, conversation_id: Uuid, message: impl Into<String>) {
        let message = message.into();
        self.update(conversation_id, move |view| {
            view.error = Some(message);
            view.submitting = false;
            true
        })
        .await;
    }
}
