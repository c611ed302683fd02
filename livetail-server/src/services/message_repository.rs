use async_trait::async_trait;
use chrono::Utc;
use shared::models::{Attachment, MessageRole, MessageState, StepEvent};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("message {0} not found")]
    MessageNotFound(Uuid),
}

/// Durable message state consulted by recovering clients.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Store the user's message and an empty, unfinished response.
    async fn create_exchange(
        &self,
        conversation_id: Uuid,
        parent_message_id: Option<Uuid>,
        text: &str,
    ) -> Result<(MessageState, MessageState), RepositoryError>;

    async fn append_text(&self, message_id: Uuid, text: &str) -> Result<(), RepositoryError>;

    /// Replace the step with the same `step_id`, or append it.
    async fn upsert_step(&self, message_id: Uuid, step: StepEvent) -> Result<(), RepositoryError>;

    async fn add_attachment(
        &self,
        message_id: Uuid,
        attachment: Attachment,
    ) -> Result<(), RepositoryError>;

    async fn finish(&self, message_id: Uuid, aborted: bool)
    -> Result<MessageState, RepositoryError>;

    async fn list(&self, conversation_id: Uuid) -> Result<Vec<MessageState>, RepositoryError>;
}

#[derive(Debug, Default)]
pub struct InMemoryMessageRepository {
    messages: RwLock<Vec<MessageState>>,
}

impl InMemoryMessageRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn modify<F>(&self, message_id: Uuid, apply: F) -> Result<MessageState, RepositoryError>
    where
        F: FnOnce(&mut MessageState) + Send,
    {
        let mut guard = self.messages.write().await;
        let message = guard
            .iter_mut()
            .find(|message| message.message_id == message_id)
            .ok_or(RepositoryError::MessageNotFound(message_id))?;
        apply(message);
        message.updated_at = Utc::now();
        Ok(message.clone())
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn create_exchange(
        &self,
        conversation_id: Uuid,
        parent_message_id: Option<Uuid>,
        text: &str,
    ) -> Result<(MessageState, MessageState), RepositoryError> {
        let now = Utc::now();
        let user = MessageState {
            message_id: Uuid::new_v4(),
            conversation_id,
            parent_message_id,
            role: MessageRole::User,
            text: text.to_string(),
            steps: Vec::new(),
            attachments: Vec::new(),
            unfinished: false,
            aborted: false,
            created_at: now,
            updated_at: now,
        };
        let response = MessageState {
            message_id: Uuid::new_v4(),
            parent_message_id: Some(user.message_id),
            role: MessageRole::Assistant,
            text: String::new(),
            unfinished: true,
            ..user.clone()
        };

        let mut guard = self.messages.write().await;
        guard.push(user.clone());
        guard.push(response.clone());
        Ok((user, response))
    }

    async fn append_text(&self, message_id: Uuid, text: &str) -> Result<(), RepositoryError> {
        self.modify(message_id, |message| message.text.push_str(text))
            .await
            .map(drop)
    }

    async fn upsert_step(&self, message_id: Uuid, step: StepEvent) -> Result<(), RepositoryError> {
        self.modify(message_id, move |message| {
            match message
                .steps
                .iter_mut()
                .find(|existing| existing.step_id == step.step_id)
            {
                Some(existing) => *existing = step,
                None => message.steps.push(step),
            }
        })
        .await
        .map(drop)
    }

    async fn add_attachment(
        &self,
        message_id: Uuid,
        attachment: Attachment,
    ) -> Result<(), RepositoryError> {
        self.modify(message_id, move |message| message.attachments.push(attachment))
            .await
            .map(drop)
    }

    async fn finish(
        &self,
        message_id: Uuid,
        aborted: bool,
    ) -> Result<MessageState, RepositoryError> {
        self.modify(message_id, |message| {
            message.unfinished = false;
            message.aborted = aborted;
        })
        .await
    }

    async fn list(&self, conversation_id: Uuid) -> Result<Vec<MessageState>, RepositoryError> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}
