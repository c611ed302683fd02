//! Incremental `text/event-stream` decoder.
//!
//! Bytes may arrive split at any point, including inside a UTF-8 sequence or
//! between `\r` and `\n`; nothing is decoded until a full line is buffered.

use std::time::Duration;

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<Duration>,
}

impl SseEvent {
    /// A retry hint with no payload.
    #[must_use]
    pub fn is_retry_only(&self) -> bool {
        self.retry.is_some() && self.data.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pending: SseEvent,
    data_lines: Vec<String>,
    has_fields: bool,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(event) = self.process_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Bytes buffered without a terminating newline.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.pending.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            "id" if !value.contains('\0') => self.pending.id = Some(value.to_string()),
            "retry" => match value.parse::<u64>() {
                Ok(ms) => self.pending.retry = Some(Duration::from_millis(ms)),
                Err(_) => return None,
            },
            _ => return None,
        }
        self.has_fields = true;
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if !std::mem::take(&mut self.has_fields) {
            return None;
        }
        let mut event = std::mem::take(&mut self.pending);
        event.data = std::mem::take(&mut self.data_lines).join("\n");
        Some(event)
    }
}
