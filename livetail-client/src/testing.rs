//! Scripted transport for session tests.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use shared::models::{
    AbortResponse, ChatFrame, GenerationRequest, MessageRole, MessageState,
};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::{
    error::TransportError,
    transport::{ChatTransport, FrameStream},
};

type FrameResult = Result<ChatFrame, TransportError>;

#[derive(Debug)]
enum Scripted {
    Stream(mpsc::Receiver<FrameResult>),
    Fail(TransportError),
    /// The open never completes.
    Hang,
}

#[derive(Debug)]
pub(crate) struct FakeTransport {
    scripted: Mutex<VecDeque<Scripted>>,
    requests: watch::Sender<Vec<GenerationRequest>>,
    messages: Mutex<Vec<MessageState>>,
    opens: AtomicUsize,
    aborts: AtomicUsize,
    fetches: AtomicUsize,
    refreshes: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            requests: watch::Sender::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Queue a successful open; the returned sender feeds its frames.
    pub(crate) fn script_stream(&self) -> mpsc::Sender<FrameResult> {
        let (tx, rx) = mpsc::channel(32);
        self.scripted.lock().unwrap().push_back(Scripted::Stream(rx));
        tx
    }

    pub(crate) fn script_error(&self, error: TransportError) {
        self.scripted.lock().unwrap().push_back(Scripted::Fail(error));
    }

    pub(crate) fn script_hang(&self) {
        self.scripted.lock().unwrap().push_back(Scripted::Hang);
    }

    pub(crate) fn set_messages(&self, messages: Vec<MessageState>) {
        *self.messages.lock().unwrap() = messages;
    }

    /// The most recent generation request, once one has been made.
    pub(crate) async fn wait_for_request(&self) -> GenerationRequest {
        let mut receiver = self.requests.subscribe();
        let requests = receiver
            .wait_for(|requests| !requests.is_empty())
            .await
            .unwrap();
        requests.last().cloned().unwrap()
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn open(&self, request: &GenerationRequest) -> Result<FrameStream, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self.scripted.lock().unwrap().pop_front();
        let receiver = match next {
            Some(Scripted::Stream(receiver)) => receiver,
            Some(Scripted::Fail(error)) => return Err(error),
            Some(Scripted::Hang) => std::future::pending().await,
            None => return Err(TransportError::Connection("nothing scripted".into())),
        };
        self.requests
            .send_modify(|requests| requests.push(request.clone()));
        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    async fn abort(&self, conversation_id: Uuid) -> Result<AbortResponse, TransportError> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(AbortResponse {
            conversation_id,
            stop_reason: "cancelled".into(),
        })
    }

    async fn fetch_messages(
        &self,
        _conversation_id: Uuid,
    ) -> Result<Vec<MessageState>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.messages.lock().unwrap().clone())
    }

    async fn refresh_credentials(&self) -> Result<(), TransportError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An assistant message as the server would persist it.
pub(crate) fn durable(
    conversation_id: Uuid,
    message_id: Uuid,
    text: &str,
    unfinished: bool,
) -> MessageState {
    MessageState {
        message_id,
        conversation_id,
        parent_message_id: None,
        role: MessageRole::Assistant,
        text: text.into(),
        steps: Vec::new(),
        attachments: Vec::new(),
        unfinished,
        aborted: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
