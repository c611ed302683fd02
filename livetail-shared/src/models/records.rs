use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use utoipa::ToSchema;

use super::{
    filter::TailFilter,
    frames::{EventFrame, TailFrame},
};

/// Which collection a tail session follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TailKind {
    Logs,
    Conversations,
}

impl TailKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Logs => "logs",
            Self::Conversations => "conversations",
        }
    }

    /// Postgres NOTIFY channel carrying change events for this kind.
    #[must_use]
    pub const fn channel(self) -> &'static str {
        match self {
            Self::Logs => "livetail_logs",
            Self::Conversations => "livetail_conversations",
        }
    }
}

impl TryFrom<&str> for TailKind {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "logs" => Ok(Self::Logs),
            "conversations" => Ok(Self::Conversations),
            _ => Err("invalid tail kind"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Insert,
    Update,
}

/// A single insert/update notification delivered by a live change source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent<R> {
    pub operation: ChangeOperation,
    #[serde(rename = "record")]
    pub full_record: R,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_fields: Option<Vec<String>>,
}

impl<R> ChangeEvent<R> {
    pub fn insert(record: R) -> Self {
        Self {
            operation: ChangeOperation::Insert,
            full_record: record,
            changed_fields: None,
        }
    }

    pub fn update(record: R, changed_fields: Vec<String>) -> Self {
        Self {
            operation: ChangeOperation::Update,
            full_record: record,
            changed_fields: Some(changed_fields),
        }
    }
}

/// Behaviour shared by every record type a tail session can deliver.
pub trait TailRecord:
    Clone + std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const KIND: TailKind;

    fn id(&self) -> &str;

    /// Logical timestamp: creation time for inserts, update time afterwards.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Re-evaluates the session filter against a single record.
    fn matches(&self, filter: &TailFilter) -> bool;

    fn historical_frame(self) -> TailFrame;

    fn live_frame(self, operation: ChangeOperation) -> TailFrame;

    /// Identifier recorded in the processed-id set.
    ///
    /// Inserts dedup on the record id. Updates carry their timestamp so that
    /// distinct updates of one record pass while a re-delivery does not.
    fn dedup_key(&self, operation: ChangeOperation) -> String {
        match operation {
            ChangeOperation::Insert => self.id().to_string(),
            ChangeOperation::Update => {
                format!("{}@{}", self.id(), self.timestamp().timestamp_micros())
            }
        }
    }
}

/// One application log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub meta: Value,
}

impl TailRecord for LogRecord {
    const KIND: TailKind = TailKind::Logs;

    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn matches(&self, filter: &TailFilter) -> bool {
        let meta = if self.meta.is_null() {
            String::new()
        } else {
            self.meta.to_string()
        };
        filter.matches_any([self.message.as_str(), self.level.as_str(), meta.as_str()])
    }

    fn historical_frame(self) -> TailFrame {
        TailFrame::Event(EventFrame::HistoricalLog(self))
    }

    fn live_frame(self, _operation: ChangeOperation) -> TailFrame {
        TailFrame::Event(EventFrame::RealtimeLog(self))
    }
}

/// Summary row describing one chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(rename = "conversation_id")]
    pub id: String,
    pub title: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TailRecord for ConversationSummary {
    const KIND: TailKind = TailKind::Conversations;

    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn matches(&self, filter: &TailFilter) -> bool {
        if !filter.in_scope(&self.id) {
            return false;
        }
        filter.matches_any([
            self.title.as_str(),
            self.user.as_str(),
            self.id.as_str(),
            self.endpoint.as_deref().unwrap_or_default(),
            self.model.as_deref().unwrap_or_default(),
        ])
    }

    fn historical_frame(self) -> TailFrame {
        TailFrame::Event(EventFrame::HistoricalConversation(self))
    }

    fn live_frame(self, operation: ChangeOperation) -> TailFrame {
        match operation {
            ChangeOperation::Insert => TailFrame::Event(EventFrame::RealtimeConversation(self)),
            ChangeOperation::Update => TailFrame::Event(EventFrame::ConversationUpdate(self)),
        }
    }
}
