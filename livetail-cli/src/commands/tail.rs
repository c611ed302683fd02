//! `livetail tail`: prints an admin tail until the server closes it for good.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use client::{HttpTransport, TailClient, credentials};
use shared::{
    config::client::ClientConfig,
    models::{ConversationSummary, ControlFrame, EventFrame, LogRecord, TailFrame, TailKind, TailQuery},
};
use tokio::sync::mpsc;

fn render_log(marker: char, record: &LogRecord) -> String {
    format!(
        "{marker} {} {:<5} {}",
        record.timestamp.to_rfc3339(),
        record.level.to_uppercase(),
        record.message
    )
}

fn render_conversation(marker: char, record: &ConversationSummary) -> String {
    format!(
        "{marker} {} {} \"{}\" by {} ({} messages)",
        record.updated_at.to_rfc3339(),
        record.id,
        record.title,
        record.user,
        record.message_count
    )
}

/// One line per frame; heartbeats print nothing.
pub fn render(frame: &TailFrame) -> Option<String> {
    let line = match frame {
        TailFrame::Control(control) => match control {
            ControlFrame::Init { count, total } => format!("-- {count} of {total} records"),
            ControlFrame::HistoricalComplete => "-- live".to_string(),
            ControlFrame::Heartbeat { .. } => return None,
            ControlFrame::Flush { reason } => format!("-- flushed: {reason}"),
            ControlFrame::SessionClosed { reason } => format!("-- session closed: {reason}"),
        },
        TailFrame::Event(event) => match event {
            EventFrame::Error { message } => format!("error: {message}"),
            EventFrame::Warning { message } => format!("warning: {message}"),
            EventFrame::HistoricalLog(record) => render_log(' ', record),
            EventFrame::RealtimeLog(record) => render_log('+', record),
            EventFrame::HistoricalConversation(record) => render_conversation(' ', record),
            EventFrame::RealtimeConversation(record) => render_conversation('+', record),
            EventFrame::ConversationUpdate(record) => render_conversation('~', record),
        },
    };
    Some(line)
}

pub async fn run_tail(
    kind: TailKind,
    query: TailQuery,
    reconnects: u32,
    client_config: Option<PathBuf>,
) -> Result<()> {
    let config = ClientConfig::load(client_config).context("failed to load client configuration")?;
    let transport = Arc::new(
        HttpTransport::new(config.server_url.clone(), credentials::from_config(&config))
            .context("failed to build HTTP client")?,
    );

    let mut tail = TailClient::new(transport, reconnects);
    let (tx, mut rx) = mpsc::channel(256);
    let follower = tokio::spawn(async move { tail.follow(kind, &query, tx).await });

    while let Some(frame) = rx.recv().await {
        if let Some(line) = render(&frame) {
            println!("{line}");
        }
    }

    follower
        .await
        .context("tail task failed")?
        .with_context(|| format!("{} tail ended with an error", kind.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn renders_records_with_delivery_markers() {
        let record = LogRecord {
            id: "7".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            level: "warn".into(),
            message: "disk almost full".into(),
            meta: json!({}),
        };
        assert_eq!(
            render(&TailFrame::Event(EventFrame::RealtimeLog(record))).unwrap(),
            "+ 2024-05-01T12:00:00+00:00 WARN  disk almost full"
        );
    }

    #[test]
    fn heartbeats_are_silent() {
        assert!(render(&TailFrame::heartbeat(Utc::now())).is_none());
        assert_eq!(
            render(&TailFrame::Control(ControlFrame::Init { count: 2, total: 9 })).unwrap(),
            "-- 2 of 9 records"
        );
    }
}
