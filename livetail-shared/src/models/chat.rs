use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Request body for `POST /api/chat/stream`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct GenerationRequest {
    /// Existing conversation, or `None` to start a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<Uuid>,
    /// Client-generated id of the user's message, replaced on `created`.
    pub client_message_id: Uuid,
    /// Client-generated id of the placeholder response, replaced on `created`.
    pub placeholder_response_id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

/// A tool call or reasoning step folded into a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct StepEvent {
    pub step_id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Attachment {
    pub attachment_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Durable view of one message as stored by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct MessageState {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<Uuid>,
    pub role: MessageRole,
    pub text: String,
    #[serde(default)]
    pub steps: Vec<StepEvent>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Generation still in progress (or interrupted before `final`).
    pub unfinished: bool,
    #[serde(default)]
    pub aborted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageState {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !self.unfinished
    }
}

/// Frames on the chat generation stream, decoded once at the transport
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatFrame {
    /// Assigns definitive ids replacing the client-generated placeholders.
    Created {
        conversation_id: Uuid,
        user_message_id: Uuid,
        response_message_id: Uuid,
        placeholder_response_id: Uuid,
    },
    /// Reconciles local ids with the durable store mid-stream.
    Sync {
        conversation_id: Uuid,
        user_message_id: Uuid,
        response_message_id: Uuid,
    },
    Delta {
        message_id: Uuid,
        index: u64,
        text: String,
    },
    Step {
        message_id: Uuid,
        index: u64,
        step: StepEvent,
    },
    Attachment {
        message_id: Uuid,
        attachment: Attachment,
    },
    Final {
        conversation_id: Uuid,
        message: MessageState,
        #[serde(default)]
        aborted: bool,
    },
    Error {
        message: String,
    },
}

impl ChatFrame {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Sync { .. } => "sync",
            Self::Delta { .. } => "delta",
            Self::Step { .. } => "step",
            Self::Attachment { .. } => "attachment",
            Self::Final { .. } => "final",
            Self::Error { .. } => "error",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Final { .. } | Self::Error { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct AbortResponse {
    pub conversation_id: Uuid,
    /// `cancelled`, `timed_out`, `completed` or `none`.
    pub stop_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct MessagesResponse {
    pub conversation_id: Uuid,
    pub messages: Vec<MessageState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_are_discriminated_by_kind() {
        let frame = ChatFrame::Delta {
            message_id: Uuid::nil(),
            index: 3,
            text: "lo".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["kind"], "delta");
        assert_eq!(value["index"], 3);

        let decoded: ChatFrame = serde_json::from_value(json!({
            "kind": "error",
            "message": "model overloaded"
        }))
        .unwrap();
        assert!(decoded.is_terminal());
        assert_eq!(decoded.kind(), "error");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let decoded = serde_json::from_value::<ChatFrame>(json!({ "kind": "mystery" }));
        assert!(decoded.is_err());
    }
}
