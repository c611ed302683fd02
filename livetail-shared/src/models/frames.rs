use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::records::{ConversationSummary, LogRecord};

/// Delivery class of a frame on the tail protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryClass {
    Historical,
    Realtime,
    Update,
    Heartbeat,
    Error,
    Control,
}

impl DeliveryClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Historical => "historical",
            Self::Realtime => "realtime",
            Self::Update => "update",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
            Self::Control => "control",
        }
    }
}

/// Protocol records discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Init { count: u64, total: u64 },
    HistoricalComplete,
    Heartbeat { timestamp: DateTime<Utc> },
    Flush { reason: String },
    SessionClosed { reason: String },
}

/// Data and notice records discriminated by `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventFrame {
    Error { message: String },
    Warning { message: String },
    HistoricalLog(LogRecord),
    RealtimeLog(LogRecord),
    HistoricalConversation(ConversationSummary),
    RealtimeConversation(ConversationSummary),
    ConversationUpdate(ConversationSummary),
}

/// One self-delimited record on the tail stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TailFrame {
    Control(ControlFrame),
    Event(EventFrame),
}

impl TailFrame {
    #[must_use]
    pub fn heartbeat(timestamp: DateTime<Utc>) -> Self {
        Self::Control(ControlFrame::Heartbeat { timestamp })
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Event(EventFrame::Warning {
            message: message.into(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Event(EventFrame::Error {
            message: message.into(),
        })
    }

    #[must_use]
    pub fn delivery_class(&self) -> DeliveryClass {
        match self {
            Self::Control(ControlFrame::Heartbeat { .. }) => DeliveryClass::Heartbeat,
            Self::Control(_) | Self::Event(EventFrame::Warning { .. }) => DeliveryClass::Control,
            Self::Event(EventFrame::Error { .. }) => DeliveryClass::Error,
            Self::Event(EventFrame::HistoricalLog(_) | EventFrame::HistoricalConversation(_)) => {
                DeliveryClass::Historical
            }
            Self::Event(EventFrame::RealtimeLog(_) | EventFrame::RealtimeConversation(_)) => {
                DeliveryClass::Realtime
            }
            Self::Event(EventFrame::ConversationUpdate(_)) => DeliveryClass::Update,
        }
    }

    /// Identifier of the carried record; control and notice frames have none.
    #[must_use]
    pub fn record_id(&self) -> Option<&str> {
        match self {
            Self::Event(EventFrame::HistoricalLog(record) | EventFrame::RealtimeLog(record)) => {
                Some(&record.id)
            }
            Self::Event(
                EventFrame::HistoricalConversation(record)
                | EventFrame::RealtimeConversation(record)
                | EventFrame::ConversationUpdate(record),
            ) => Some(&record.id),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_historical_complete(&self) -> bool {
        matches!(self, Self::Control(ControlFrame::HistoricalComplete))
    }
}
