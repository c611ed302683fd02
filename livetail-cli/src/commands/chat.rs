//! `livetail chat`: submit a prompt and print the reply as it streams.
//!
//! With `--detach-after` the command navigates away mid-stream, waits, and
//! reattaches to the same generation, printing whatever arrived meanwhile.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use client::{
    ChatClient, ChatSession, ClientPhase, ClientSettings, ConversationView, HttpTransport,
    Submission, credentials,
};
use shared::config::client::ClientConfig;
use tokio::time::{Instant, timeout_at};
use uuid::Uuid;

/// Prints only the part of the reply not yet shown.
#[derive(Debug, Default)]
pub struct ReplyPrinter {
    shown: String,
}

impl ReplyPrinter {
    /// Text to print for `view`, if any.
    pub fn advance(&mut self, view: &ConversationView) -> Option<String> {
        let text = &view.latest_response()?.text;
        if text == &self.shown {
            return None;
        }
        let output = match text.strip_prefix(self.shown.as_str()) {
            Some(suffix) => suffix.to_string(),
            // Replaced by authoritative state.
            None => format!("\n{text}"),
        };
        self.shown.clone_from(text);
        Some(output)
    }
}

fn show(printer: &mut ReplyPrinter, view: &ConversationView) {
    if let Some(output) = printer.advance(view) {
        print!("{output}");
    }
}

/// Print updates until the session ends or `until` passes.
async fn follow(session: &mut ChatSession, printer: &mut ReplyPrinter, until: Option<Instant>) {
    let mut phases = session.phases();
    loop {
        show(printer, &session.view());
        if session.phase() == ClientPhase::Terminal {
            return;
        }

        let next = async {
            tokio::select! {
                update = session.changed() => update.is_some(),
                ended = phases.wait_for(|phase| *phase == ClientPhase::Terminal) => ended.is_ok(),
            }
        };
        let progressed = match until {
            Some(deadline) => timeout_at(deadline, next).await.unwrap_or(false),
            None => next.await,
        };
        if !progressed {
            show(printer, &session.view());
            return;
        }
    }
}

fn finish(printer: &mut ReplyPrinter, view: &ConversationView) -> Result<()> {
    show(printer, view);
    println!();
    if let Some(error) = &view.error {
        bail!("generation failed: {error}");
    }
    if view.latest_response().is_some_and(|response| response.aborted) {
        eprintln!("-- reply was cancelled");
    }
    Ok(())
}

pub async fn run_chat(
    conversation: Option<Uuid>,
    text: String,
    detach_after: Option<Duration>,
    client_config: Option<PathBuf>,
) -> Result<()> {
    let config = ClientConfig::load(client_config).context("failed to load client configuration")?;
    let transport = Arc::new(
        HttpTransport::new(config.server_url.clone(), credentials::from_config(&config))
            .context("failed to build HTTP client")?,
    );
    let client = ChatClient::new(transport, ClientSettings::from(&config));

    let mut submission = Submission::new(text);
    if let Some(conversation) = conversation {
        submission = submission.in_conversation(conversation);
    }
    let mut session = client.submit(submission).await?;
    let conversation_id = session.conversation_id();
    eprintln!("-- conversation {conversation_id}");

    let mut printer = ReplyPrinter::default();
    if let Some(delay) = detach_after {
        follow(&mut session, &mut printer, Some(Instant::now() + delay)).await;
        if session.phase() == ClientPhase::Terminal {
            return finish(&mut printer, &session.view());
        }

        session.detach();
        eprintln!("\n-- detached; generation continues in the background");
        tokio::time::sleep(delay).await;

        match client.attach(conversation_id).await? {
            Some(reattached) => {
                eprintln!("-- reattached");
                session = reattached;
            }
            None => {
                let view = client
                    .store()
                    .snapshot(conversation_id)
                    .await
                    .unwrap_or_default();
                return finish(&mut printer, &view);
            }
        }
    }

    follow(&mut session, &mut printer, None).await;
    finish(&mut printer, &session.view())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use client::MessageStore;
    use shared::models::{MessageRole, MessageState};

    fn reply(conversation_id: Uuid, message_id: Uuid, text: &str) -> MessageState {
        MessageState {
            message_id,
            conversation_id,
            parent_message_id: None,
            role: MessageRole::Assistant,
            text: text.into(),
            steps: Vec::new(),
            attachments: Vec::new(),
            unfinished: true,
            aborted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn printer_emits_only_new_text() {
        let store = MessageStore::new();
        let conversation = Uuid::new_v4();
        let message = Uuid::new_v4();
        let mut printer = ReplyPrinter::default();
        assert!(printer.advance(&ConversationView::default()).is_none());

        for (text, expected) in [
            ("Hel", Some("Hel")),
            ("Hel", None),
            ("Hello", Some("lo")),
            ("Goodbye", Some("\nGoodbye")),
        ] {
            store
                .reconcile(conversation, &[reply(conversation, message, text)])
                .await;
            let view = store.snapshot(conversation).await.unwrap();
            assert_eq!(printer.advance(&view).as_deref(), expected);
        }
    }
}
