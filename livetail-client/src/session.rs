//! Chat generation sessions that outlive the view that started them.
//!
//! Each submission runs in its own task which owns the transport. Views hold
//! a [`ChatSession`]; dropping or detaching it only moves the task to
//! `Backgrounding`, while [`ChatSession::cancel`] closes the transport and
//! asks the server to stop. A stream lost before its `final` frame falls
//! back to polling durable message state until the response finishes, the
//! poll ceiling passes, or the caller cancels.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use futures::StreamExt;
use shared::{
    config::client::ClientConfig,
    models::{GenerationRequest, MessageRole},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{ClientError, TransportError},
    registry::{Begin, SessionHandle, SessionRegistry},
    store::{ConversationView, MessageStore},
    transport::{ChatTransport, FrameStream},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Idle,
    Connecting,
    Streaming,
    /// Still streaming into the store with no view attached.
    Backgrounding,
    Cancelling,
    Recovering,
    Terminal,
}

impl ClientPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Backgrounding => "backgrounding",
            Self::Cancelling => "cancelling",
            Self::Recovering => "recovering",
            Self::Terminal => "terminal",
        }
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Attach,
    Detach,
    Cancel(oneshot::Sender<Result<String, ClientError>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    /// Unfinished responses older than this are not recovered.
    pub recovery_window: Duration,
    pub poll_interval: Duration,
    /// Recovery polling gives up after this long.
    pub poll_ceiling: Duration,
    pub max_auth_refreshes: u32,
}

impl From<&ClientConfig> for ClientSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            recovery_window: config.recovery_window(),
            poll_interval: config.poll_interval(),
            poll_ceiling: config.poll_ceiling(),
            max_auth_refreshes: config.max_auth_refreshes,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    /// `None` starts a new conversation.
    pub conversation_id: Option<Uuid>,
    pub parent_message_id: Option<Uuid>,
    pub text: String,
}

impl Submission {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            parent_message_id: None,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn in_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }
}

/// Run `op`, refreshing credentials on rejection up to `max_refreshes` times.
async fn authorized<T, F, Fut>(
    transport: &dyn ChatTransport,
    max_refreshes: u32,
    mut op: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut refreshes = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_unauthorized() => {
                if refreshes >= max_refreshes {
                    return Err(ClientError::CredentialsExhausted(refreshes));
                }
                refreshes += 1;
                debug!(refreshes, "credential rejected; refreshing");
                transport.refresh_credentials().await?;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Entry point for views: submits, reattaches and cancels generations.
#[derive(Clone)]
pub struct ChatClient {
    transport: Arc<dyn ChatTransport>,
    store: Arc<MessageStore>,
    registry: Arc<SessionRegistry>,
    settings: ClientSettings,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    pub fn new(transport: Arc<dyn ChatTransport>, settings: ClientSettings) -> Self {
        Self {
            transport,
            store: Arc::new(MessageStore::new()),
            registry: Arc::new(SessionRegistry::new()),
            settings,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Phase updates of the conversation's running session, if any.
    pub async fn phase(&self, conversation_id: Uuid) -> Option<watch::Receiver<ClientPhase>> {
        self.registry
            .handle(conversation_id)
            .await
            .map(|handle| handle.phase)
    }

    /// Start a generation. Submitting again while the conversation's session
    /// is still running attaches to it instead of opening a second stream.
    pub async fn submit(&self, submission: Submission) -> Result<ChatSession, ClientError> {
        let conversation_id = submission.conversation_id.unwrap_or_else(Uuid::new_v4);
        let (handle, driver) = self.prepare(conversation_id);
        if let Begin::Reattach(existing) = self.registry.begin(conversation_id, handle.clone()).await
        {
            return Ok(self.reattach(conversation_id, existing).await);
        }

        let request = GenerationRequest {
            conversation_id: Some(conversation_id),
            parent_message_id: submission.parent_message_id,
            client_message_id: Uuid::new_v4(),
            placeholder_response_id: Uuid::new_v4(),
            text: submission.text,
        };
        self.store
            .begin_submission(
                conversation_id,
                request.client_message_id,
                request.placeholder_response_id,
                &request.text,
            )
            .await;

        tokio::spawn(driver.run(Mode::Stream(request)));
        Ok(self.session(conversation_id, handle).await)
    }

    /// Reconnect a view to a conversation.
    ///
    /// Joins the running session when there is one. Otherwise the durable
    /// state is fetched into the store and, if the latest response is still
    /// unfinished and recently active, a recovering session polls it to
    /// completion. `None` means there is nothing left to follow.
    pub async fn attach(&self, conversation_id: Uuid) -> Result<Option<ChatSession>, ClientError> {
        if let Some(handle) = self.registry.handle(conversation_id).await {
            return Ok(Some(self.reattach(conversation_id, handle).await));
        }

        let transport = self.transport.as_ref();
        let messages = authorized(transport, self.settings.max_auth_refreshes, || {
            transport.fetch_messages(conversation_id)
        })
        .await?;
        if self.store.reconcile(conversation_id, &messages).await {
            return Ok(None);
        }

        let Some(response) = messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant && message.unfinished)
        else {
            return Ok(None);
        };
        let idle = (Utc::now() - response.updated_at).to_std().unwrap_or_default();
        if idle > self.settings.recovery_window {
            info!(%conversation_id, idle_secs = idle.as_secs(), "unfinished response abandoned");
            self.store
                .fail(conversation_id, "response was abandoned before finishing")
                .await;
            return Ok(None);
        }

        let (handle, driver) = self.prepare(conversation_id);
        if let Begin::Reattach(existing) = self.registry.begin(conversation_id, handle.clone()).await
        {
            return Ok(Some(self.reattach(conversation_id, existing).await));
        }
        tokio::spawn(driver.run(Mode::Recover));
        Ok(Some(self.session(conversation_id, handle).await))
    }

    /// Explicit stop. Reaches the running session if there is one, otherwise
    /// aborts on the server directly. Returns the server's stop reason.
    pub async fn cancel(&self, conversation_id: Uuid) -> Result<String, ClientError> {
        if let Some(handle) = self.registry.handle(conversation_id).await {
            let (reply, response) = oneshot::channel();
            if handle.commands.send(Command::Cancel(reply)).is_ok() {
                return response.await.map_err(|_| ClientError::Closed)?;
            }
        }

        let transport = self.transport.as_ref();
        let aborted = authorized(transport, self.settings.max_auth_refreshes, || {
            transport.abort(conversation_id)
        })
        .await?;
        self.store.mark_aborted(conversation_id).await;
        Ok(aborted.stop_reason)
    }

    /// A session handle and the unstarted driver behind it. If the driver is
    /// dropped without being spawned, the handle reads as closed.
    fn prepare(&self, conversation_id: Uuid) -> (SessionHandle, Driver) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (phase, phase_rx) = watch::channel(ClientPhase::Idle);
        let handle = SessionHandle {
            session_id: Uuid::new_v4(),
            commands,
            phase: phase_rx,
        };
        let driver = Driver {
            conversation_id,
            session_id: handle.session_id,
            transport: Arc::clone(&self.transport),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            settings: self.settings,
            phase,
            commands: receiver,
            viewers: 1,
            last_activity: Instant::now(),
            cancelled: None,
        };
        (handle, driver)
    }

    async fn reattach(&self, conversation_id: Uuid, handle: SessionHandle) -> ChatSession {
        debug!(
            %conversation_id,
            session_id = %handle.session_id,
            pending = handle.is_pending(),
            "reattaching view"
        );
        let _ = handle.commands.send(Command::Attach);
        self.session(conversation_id, handle).await
    }

    async fn session(&self, conversation_id: Uuid, handle: SessionHandle) -> ChatSession {
        ChatSession {
            conversation_id,
            view: self.store.subscribe(conversation_id).await,
            handle,
            attached: true,
        }
    }
}

/// A view's attachment to a running session.
///
/// Dropping it counts as navigating away: the generation keeps streaming
/// into the store.
#[derive(Debug)]
pub struct ChatSession {
    conversation_id: Uuid,
    handle: SessionHandle,
    view: watch::Receiver<ConversationView>,
    attached: bool,
}

impl ChatSession {
    #[must_use]
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.handle.session_id
    }

    #[must_use]
    pub fn phase(&self) -> ClientPhase {
        self.handle.phase()
    }

    #[must_use]
    pub fn view(&self) -> ConversationView {
        self.view.borrow().clone()
    }

    /// Phase updates, independent of this view's borrow.
    #[must_use]
    pub fn phases(&self) -> watch::Receiver<ClientPhase> {
        self.handle.phase.clone()
    }

    /// Next store update for this conversation.
    pub async fn changed(&mut self) -> Option<ConversationView> {
        self.view.changed().await.ok()?;
        Some(self.view.borrow_and_update().clone())
    }

    /// Wait until the session reaches `phase`. Returns `false` if the session
    /// ended without reaching it.
    pub async fn wait_for(&self, phase: ClientPhase) -> bool {
        let mut receiver = self.handle.phase.clone();
        receiver.wait_for(|current| *current == phase).await.is_ok()
    }

    /// Wait for the session to end and return the final view.
    pub async fn finished(&self) -> ConversationView {
        self.wait_for(ClientPhase::Terminal).await;
        self.view()
    }

    /// Stop the generation: closes the transport and aborts on the server.
    pub async fn cancel(mut self) -> Result<String, ClientError> {
        self.attached = false;
        let (reply, response) = oneshot::channel();
        self.handle
            .commands
            .send(Command::Cancel(reply))
            .map_err(|_| ClientError::NoSession(self.conversation_id))?;
        response.await.map_err(|_| ClientError::Closed)?
    }

    /// Navigate away without stopping the generation.
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if self.attached && self.handle.commands.send(Command::Detach).is_err() {
            debug!(conversation_id = %self.conversation_id, "session already ended");
        }
    }
}

#[derive(Debug)]
enum Mode {
    Stream(GenerationRequest),
    Recover,
}

type CancelReply = oneshot::Sender<Result<String, ClientError>>;

enum Exit {
    Finished,
    Lost,
    Cancel(CancelReply),
}

struct Driver {
    conversation_id: Uuid,
    session_id: Uuid,
    transport: Arc<dyn ChatTransport>,
    store: Arc<MessageStore>,
    registry: Arc<SessionRegistry>,
    settings: ClientSettings,
    phase: watch::Sender<ClientPhase>,
    commands: mpsc::UnboundedReceiver<Command>,
    viewers: usize,
    /// Last sign of progress: spawn, or the latest applied frame.
    last_activity: Instant,
    /// Answered once the session is released.
    cancelled: Option<(CancelReply, Result<String, ClientError>)>,
}

impl Driver {
    async fn run(mut self, mode: Mode) {
        match mode {
            Mode::Stream(request) => self.stream(request).await,
            Mode::Recover => self.recover().await,
        }
        self.registry
            .release(self.conversation_id, self.session_id)
            .await;
        self.set_phase(ClientPhase::Terminal);
        if let Some((reply, result)) = self.cancelled.take() {
            let _ = reply.send(result);
        }
        // Commands that raced the end of the session.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Cancel(reply) = command {
                let _ = reply.send(Err(ClientError::NoSession(self.conversation_id)));
            }
        }
    }

    fn set_phase(&self, phase: ClientPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(
                conversation_id = %self.conversation_id,
                from = previous.as_str(),
                to = phase.as_str(),
                "client phase"
            );
        }
    }

    fn attached_phase(&self) -> ClientPhase {
        if self.viewers == 0 {
            ClientPhase::Backgrounding
        } else {
            ClientPhase::Streaming
        }
    }

    async fn stream(&mut self, request: GenerationRequest) {
        self.set_phase(ClientPhase::Connecting);
        let transport = Arc::clone(&self.transport);
        let opened = {
            let opening = authorized(
                transport.as_ref(),
                self.settings.max_auth_refreshes,
                || transport.open(&request),
            );
            tokio::pin!(opening);
            loop {
                tokio::select! {
                    biased;
                    Some(command) = self.commands.recv() => match command {
                        Command::Cancel(reply) => break Err(reply),
                        other => self.track_viewers(&other),
                    },
                    opened = &mut opening => break Ok(opened),
                }
            }
        };

        let frames = match opened {
            // The pending open is dropped with its block.
            Err(reply) => return self.cancel(reply).await,
            Ok(Ok(frames)) => frames,
            Ok(Err(err)) => {
                warn!(conversation_id = %self.conversation_id, error = %err, "could not open generation stream");
                self.store.fail(self.conversation_id, err.to_string()).await;
                return;
            }
        };

        self.last_activity = Instant::now();
        self.set_phase(self.attached_phase());

        match self.pump(frames).await {
            Exit::Finished => {}
            Exit::Cancel(reply) => self.cancel(reply).await,
            Exit::Lost => self.recover().await,
        }
    }

    /// Apply frames until the stream ends. The transport is dropped on return.
    async fn pump(&mut self, mut frames: FrameStream) -> Exit {
        loop {
            tokio::select! {
                biased;
                Some(command) = self.commands.recv() => match command {
                    Command::Cancel(reply) => return Exit::Cancel(reply),
                    other => self.track_viewers(&other),
                },
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        let terminal = frame.is_terminal();
                        self.store.apply(self.conversation_id, &frame).await;
                        self.last_activity = Instant::now();
                        if terminal {
                            return Exit::Finished;
                        }
                    }
                    Some(Err(TransportError::Decode(message))) => {
                        warn!(conversation_id = %self.conversation_id, %message, "skipping malformed frame");
                    }
                    Some(Err(err)) => {
                        warn!(conversation_id = %self.conversation_id, error = %err, "generation stream lost");
                        return Exit::Lost;
                    }
                    None => {
                        debug!(conversation_id = %self.conversation_id, "stream closed before final frame");
                        return Exit::Lost;
                    }
                },
            }
        }
    }

    fn track_viewers(&mut self, command: &Command) {
        match command {
            Command::Attach => self.viewers += 1,
            Command::Detach => self.viewers = self.viewers.saturating_sub(1),
            Command::Cancel(_) => return,
        }
        let phase = *self.phase.borrow();
        if matches!(phase, ClientPhase::Streaming | ClientPhase::Backgrounding) {
            self.set_phase(self.attached_phase());
        }
    }

    async fn cancel(&mut self, reply: CancelReply) {
        self.set_phase(ClientPhase::Cancelling);
        let transport = self.transport.as_ref();
        let conversation_id = self.conversation_id;
        let result = authorized(transport, self.settings.max_auth_refreshes, || {
            transport.abort(conversation_id)
        })
        .await
        .map(|aborted| aborted.stop_reason);
        self.store.mark_aborted(conversation_id).await;
        info!(%conversation_id, "generation cancelled");
        self.cancelled = Some((reply, result));
    }

    /// Poll durable state until the response finishes. The ticker and the
    /// ceiling are locals, so every return path cancels them.
    async fn recover(&mut self) {
        if self.last_activity.elapsed() > self.settings.recovery_window {
            self.store
                .fail(self.conversation_id, "response was abandoned before finishing")
                .await;
            return;
        }
        self.set_phase(ClientPhase::Recovering);

        let ceiling = tokio::time::sleep(self.settings.poll_ceiling);
        tokio::pin!(ceiling);
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                Some(command) = self.commands.recv() => match command {
                    Command::Cancel(reply) => {
                        self.cancel(reply).await;
                        return;
                    }
                    other => self.track_viewers(&other),
                },
                () = &mut ceiling => {
                    warn!(conversation_id = %self.conversation_id, "recovery polling timed out");
                    self.store
                        .fail(self.conversation_id, "timed out waiting for the response to finish")
                        .await;
                    return;
                }
                _ = ticker.tick() => match self.poll().await {
                    Ok(true) => {
                        info!(conversation_id = %self.conversation_id, "recovered finished response");
                        return;
                    }
                    Ok(false) => {}
                    Err(err @ ClientError::CredentialsExhausted(_)) => {
                        self.store.fail(self.conversation_id, err.to_string()).await;
                        return;
                    }
                    Err(err) => {
                        debug!(conversation_id = %self.conversation_id, error = %err, "recovery poll failed");
                    }
                },
            }
        }
    }

    async fn poll(&self) -> Result<bool, ClientError> {
        let transport = self.transport.as_ref();
        let conversation_id = self.conversation_id;
        let messages = authorized(transport, self.settings.max_auth_refreshes, || {
            transport.fetch_messages(conversation_id)
        })
        .await?;
        Ok(self.store.reconcile(conversation_id, &messages).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, durable};
    use shared::models::ChatFrame;

    fn settings() -> ClientSettings {
        ClientSettings {
            recovery_window: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            poll_ceiling: Duration::from_secs(20),
            max_auth_refreshes: 1,
        }
    }

    fn client(transport: &Arc<FakeTransport>) -> ChatClient {
        ChatClient::new(Arc::clone(transport) as Arc<dyn ChatTransport>, settings())
    }

    fn created(request: &GenerationRequest, response: Uuid) -> ChatFrame {
        ChatFrame::Created {
            conversation_id: request.conversation_id.unwrap(),
            user_message_id: Uuid::new_v4(),
            response_message_id: response,
            placeholder_response_id: request.placeholder_response_id,
        }
    }

    fn delta(message_id: Uuid, index: u64, text: &str) -> ChatFrame {
        ChatFrame::Delta {
            message_id,
            index,
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn streams_into_store_until_final() {
        let transport = Arc::new(FakeTransport::new());
        let frames = transport.script_stream();
        let client = client(&transport);

        let session = client.submit(Submission::new("hello there")).await.unwrap();
        let conversation = session.conversation_id();
        let request = transport.wait_for_request().await;
        let response = Uuid::new_v4();

        frames.send(Ok(created(&request, response))).await.unwrap();
        frames.send(Ok(delta(response, 1, "hello "))).await.unwrap();
        frames.send(Ok(delta(response, 2, "there"))).await.unwrap();
        frames
            .send(Ok(ChatFrame::Final {
                conversation_id: conversation,
                message: durable(conversation, response, "hello there", false),
                aborted: false,
            }))
            .await
            .unwrap();

        let view = session.finished().await;
        assert_eq!(view.latest_response().unwrap().text, "hello there");
        assert!(!view.submitting);
        assert_eq!(session.phase(), ClientPhase::Terminal);
        assert!(client.phase(conversation).await.is_none());
    }

    #[tokio::test]
    async fn navigating_away_keeps_streaming_and_cancel_stops() {
        let transport = Arc::new(FakeTransport::new());
        let frames = transport.script_stream();
        let client = client(&transport);

        let session = client.submit(Submission::new("long answer")).await.unwrap();
        let conversation = session.conversation_id();
        let request = transport.wait_for_request().await;
        let response = Uuid::new_v4();
        frames.send(Ok(created(&request, response))).await.unwrap();
        assert!(session.wait_for(ClientPhase::Streaming).await);

        session.detach();
        let mut phase = client.phase(conversation).await.unwrap();
        phase
            .wait_for(|phase| *phase == ClientPhase::Backgrounding)
            .await
            .unwrap();

        // Still applying frames with nobody watching.
        let mut updates = client.store().subscribe(conversation).await;
        frames.send(Ok(delta(response, 1, "still "))).await.unwrap();
        updates
            .wait_for(|view| view.message(response).is_some_and(|m| m.text == "still "))
            .await
            .unwrap();
        assert_eq!(transport.aborts(), 0);

        let session = client.attach(conversation).await.unwrap().unwrap();
        assert!(session.wait_for(ClientPhase::Streaming).await);
        assert_eq!(transport.opens(), 1);

        assert_eq!(session.cancel().await.unwrap(), "cancelled");
        assert_eq!(transport.aborts(), 1);
        assert!(frames.is_closed());

        let view = client.store().snapshot(conversation).await.unwrap();
        let message = view.message(response).unwrap();
        assert!(message.aborted);
        assert_eq!(message.text, "still ");
        assert!(client.phase(conversation).await.is_none());
    }

    #[tokio::test]
    async fn resubmitting_a_running_conversation_reattaches() {
        let transport = Arc::new(FakeTransport::new());
        let _frames = transport.script_stream();
        let client = client(&transport);

        let first = client.submit(Submission::new("once")).await.unwrap();
        let conversation = first.conversation_id();
        let second = client
            .submit(Submission::new("once").in_conversation(conversation))
            .await
            .unwrap();

        assert_eq!(first.session_id(), second.session_id());
        transport.wait_for_request().await;
        assert_eq!(transport.opens(), 1);
        let view = client.store().snapshot(conversation).await.unwrap();
        assert_eq!(view.messages.len(), 2);
    }

    #[tokio::test]
    async fn rejected_credential_is_refreshed_once() {
        let transport = Arc::new(FakeTransport::new());
        transport.script_error(TransportError::Unauthorized("invalid_token".into()));
        let _frames = transport.script_stream();
        let client = client(&transport);

        let session = client.submit(Submission::new("hi")).await.unwrap();
        assert!(session.wait_for(ClientPhase::Streaming).await);
        assert_eq!(transport.refreshes(), 1);
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn repeated_rejection_ends_the_session() {
        let transport = Arc::new(FakeTransport::new());
        transport.script_error(TransportError::Unauthorized("invalid_token".into()));
        transport.script_error(TransportError::Unauthorized("invalid_token".into()));
        let client = client(&transport);

        let session = client.submit(Submission::new("hi")).await.unwrap();
        let view = session.finished().await;

        assert_eq!(transport.refreshes(), 1);
        assert!(view.error.unwrap().contains("refresh"));
        assert!(!view.submitting);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_stream_recovers_by_polling() {
        let transport = Arc::new(FakeTransport::new());
        let frames = transport.script_stream();
        let client = client(&transport);

        let session = client.submit(Submission::new("hi")).await.unwrap();
        let conversation = session.conversation_id();
        let request = transport.wait_for_request().await;
        let response = Uuid::new_v4();
        frames.send(Ok(created(&request, response))).await.unwrap();
        frames.send(Ok(delta(response, 1, "par"))).await.unwrap();
        transport.set_messages(vec![durable(conversation, response, "partial", true)]);
        drop(frames);

        assert!(session.wait_for(ClientPhase::Recovering).await);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(session.phase(), ClientPhase::Recovering);

        transport.set_messages(vec![durable(conversation, response, "partial answer", false)]);
        let view = session.finished().await;
        assert_eq!(view.message(response).unwrap().text, "partial answer");
        assert!(view.error.is_none());
        assert!(transport.fetches() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_lost_after_a_long_generation_still_recovers() {
        let transport = Arc::new(FakeTransport::new());
        let frames = transport.script_stream();
        let client = client(&transport);

        let session = client.submit(Submission::new("essay")).await.unwrap();
        let conversation = session.conversation_id();
        let request = transport.wait_for_request().await;
        let response = Uuid::new_v4();
        frames.send(Ok(created(&request, response))).await.unwrap();

        // Longer than the recovery window in total, steady progress throughout.
        for index in 1..=31 {
            frames.send(Ok(delta(response, index, "w "))).await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        transport.set_messages(vec![durable(conversation, response, "partial", true)]);
        drop(frames);

        assert!(session.wait_for(ClientPhase::Recovering).await);
        transport.set_messages(vec![durable(conversation, response, "complete", false)]);
        let view = session.finished().await;
        assert!(view.error.is_none(), "{:?}", view.error);
        assert_eq!(view.message(response).unwrap().text, "complete");
        assert!(transport.fetches() >= 1);
    }

    #[tokio::test]
    async fn cancel_while_connecting_drops_the_pending_open() {
        let transport = Arc::new(FakeTransport::new());
        transport.script_hang();
        let client = client(&transport);

        let session = client.submit(Submission::new("never opens")).await.unwrap();
        let conversation = session.conversation_id();
        assert!(session.wait_for(ClientPhase::Connecting).await);

        assert_eq!(session.cancel().await.unwrap(), "cancelled");
        assert_eq!(transport.aborts(), 1);
        assert!(client.phase(conversation).await.is_none());
        let view = client.store().snapshot(conversation).await.unwrap();
        assert!(!view.submitting);
    }

    #[tokio::test]
    async fn dropping_many_views_at_once_backgrounds() {
        let transport = Arc::new(FakeTransport::new());
        let _frames = transport.script_stream();
        let client = client(&transport);

        let first = client.submit(Submission::new("shared")).await.unwrap();
        let conversation = first.conversation_id();
        let mut views = vec![first];
        for _ in 0..32 {
            views.push(client.attach(conversation).await.unwrap().unwrap());
        }
        assert!(views[0].wait_for(ClientPhase::Streaming).await);

        let mut phase = client.phase(conversation).await.unwrap();
        drop(views);
        phase
            .wait_for(|phase| *phase == ClientPhase::Backgrounding)
            .await
            .unwrap();
        assert_eq!(transport.aborts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_gives_up_at_the_ceiling() {
        let transport = Arc::new(FakeTransport::new());
        let frames = transport.script_stream();
        let client = client(&transport);

        let session = client.submit(Submission::new("hi")).await.unwrap();
        let conversation = session.conversation_id();
        transport.wait_for_request().await;
        transport.set_messages(vec![durable(conversation, Uuid::new_v4(), "", true)]);
        drop(frames);

        let started = Instant::now();
        let view = session.finished().await;
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert!(view.error.unwrap().contains("timed out"));

        // Nothing keeps polling afterwards.
        let fetches = transport.fetches();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.fetches(), fetches);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_recovery_stops_polling() {
        let transport = Arc::new(FakeTransport::new());
        let frames = transport.script_stream();
        let client = client(&transport);

        let session = client.submit(Submission::new("hi")).await.unwrap();
        let conversation = session.conversation_id();
        transport.wait_for_request().await;
        transport.set_messages(vec![durable(conversation, Uuid::new_v4(), "", true)]);
        drop(frames);
        assert!(session.wait_for(ClientPhase::Recovering).await);

        assert_eq!(client.cancel(conversation).await.unwrap(), "cancelled");
        let fetches = transport.fetches();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.fetches(), fetches);
        assert_eq!(session.phase(), ClientPhase::Terminal);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_recovers_recent_unfinished_response() {
        let transport = Arc::new(FakeTransport::new());
        let client = client(&transport);
        let conversation = Uuid::new_v4();
        let response = Uuid::new_v4();
        transport.set_messages(vec![durable(conversation, response, "so far", true)]);

        let session = client.attach(conversation).await.unwrap().unwrap();
        assert!(session.wait_for(ClientPhase::Recovering).await);
        assert_eq!(session.view().message(response).unwrap().text, "so far");

        transport.set_messages(vec![durable(conversation, response, "so far, done", false)]);
        let view = session.finished().await;
        assert_eq!(view.message(response).unwrap().text, "so far, done");
    }

    #[tokio::test]
    async fn attach_ignores_stale_or_finished_responses() {
        let transport = Arc::new(FakeTransport::new());
        let client = client(&transport);
        let conversation = Uuid::new_v4();

        let mut stale = durable(conversation, Uuid::new_v4(), "old", true);
        stale.updated_at = Utc::now() - chrono::Duration::minutes(10);
        transport.set_messages(vec![stale]);
        assert!(client.attach(conversation).await.unwrap().is_none());
        let view = client.store().snapshot(conversation).await.unwrap();
        assert!(view.error.unwrap().contains("abandoned"));

        let other = Uuid::new_v4();
        transport.set_messages(vec![durable(other, Uuid::new_v4(), "done", false)]);
        assert!(client.attach(other).await.unwrap().is_none());
        assert_eq!(transport.opens(), 0);
    }
}
