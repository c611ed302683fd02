//! Drives one chat generation: persists progress, forwards `ChatFrame`s while
//! a client listens, and keeps going after the client detaches.

use std::sync::Arc;

use futures::StreamExt;
use metrics::counter;
use shared::models::{ChatFrame, GenerationRequest, MessagesResponse};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    generation::{GenerationError, GenerationEvent, GenerationStream, ResponseGenerator},
    message_repository::{MessageRepository, RepositoryError},
    stream_supervisor::{GenerationHandle, SharedStreamSupervisor, StopReason},
};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("a generation is already running for conversation {0}")]
    Busy(Uuid),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// Frames of a started generation plus the definitive conversation id.
#[derive(Debug)]
pub struct ChatStream {
    pub conversation_id: Uuid,
    pub frames: mpsc::Receiver<ChatFrame>,
}

#[derive(Clone)]
pub struct ChatService {
    generator: Arc<dyn ResponseGenerator>,
    repository: Arc<dyn MessageRepository>,
    supervisor: SharedStreamSupervisor,
    channel_capacity: usize,
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService")
            .field("model", &self.generator.model_name())
            .field("channel_capacity", &self.channel_capacity)
            .finish_non_exhaustive()
    }
}

impl ChatService {
    pub fn new(
        generator: Arc<dyn ResponseGenerator>,
        repository: Arc<dyn MessageRepository>,
        supervisor: SharedStreamSupervisor,
        channel_capacity: usize,
    ) -> Self {
        Self {
            generator,
            repository,
            supervisor,
            channel_capacity: channel_capacity.max(1),
        }
    }

    pub async fn start(&self, request: GenerationRequest) -> Result<ChatStream, ChatError> {
        let conversation_id = request.conversation_id.unwrap_or_else(Uuid::new_v4);
        let handle = self
            .supervisor
            .start(conversation_id)
            .await
            .ok_or(ChatError::Busy(conversation_id))?;

        let prepared = async {
            let stream = self.generator.generate(&request.text).await?;
            let exchange = self
                .repository
                .create_exchange(conversation_id, request.parent_message_id, &request.text)
                .await?;
            Ok::<_, ChatError>((stream, exchange))
        }
        .await;

        let (stream, (user, response)) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.supervisor.finish(conversation_id, &handle).await;
                return Err(err);
            }
        };

        let (tx, frames) = mpsc::channel(self.channel_capacity);
        let created = ChatFrame::Created {
            conversation_id,
            user_message_id: user.message_id,
            response_message_id: response.message_id,
            placeholder_response_id: request.placeholder_response_id,
        };
        // Capacity is at least one, so the acknowledgement always fits.
        let _ = tx.try_send(created);

        info!(%conversation_id, response_id = %response.message_id, model = self.generator.model_name(), "generation started");
        let run = GenerationRun {
            conversation_id,
            user_message_id: user.message_id,
            response_message_id: response.message_id,
            repository: Arc::clone(&self.repository),
            supervisor: Arc::clone(&self.supervisor),
            handle,
            sink: Some(tx),
        };
        tokio::spawn(run.drive(stream));

        Ok(ChatStream {
            conversation_id,
            frames,
        })
    }

    pub async fn abort(&self, conversation_id: Uuid) -> StopReason {
        let reason = self.supervisor.cancel(conversation_id).await;
        debug!(%conversation_id, reason = reason.as_str(), "abort requested");
        reason
    }

    pub async fn messages(&self, conversation_id: Uuid) -> Result<MessagesResponse, ChatError> {
        Ok(MessagesResponse {
            conversation_id,
            messages: self.repository.list(conversation_id).await?,
        })
    }
}

struct GenerationRun {
    conversation_id: Uuid,
    user_message_id: Uuid,
    response_message_id: Uuid,
    repository: Arc<dyn MessageRepository>,
    supervisor: SharedStreamSupervisor,
    handle: Arc<GenerationHandle>,
    sink: Option<mpsc::Sender<ChatFrame>>,
}

impl GenerationRun {
    async fn drive(mut self, mut stream: GenerationStream) {
        let token = self.handle.token();
        let mut index = 0_u64;
        let mut synced = false;
        let mut failure = None;

        loop {
            let event = tokio::select! {
                biased;
                () = token.cancelled() => break,
                event = stream.next() => event,
            };

            let result = match event {
                None => break,
                Some(Err(err)) => {
                    failure = Some(err.to_string());
                    break;
                }
                Some(Ok(event)) => self.apply(event, index).await,
            };
            if let Err(err) = result {
                failure = Some(err.to_string());
                break;
            }
            index += 1;

            if !synced {
                synced = true;
                self.forward(ChatFrame::Sync {
                    conversation_id: self.conversation_id,
                    user_message_id: self.user_message_id,
                    response_message_id: self.response_message_id,
                })
                .await;
            }
        }
        drop(stream);

        let aborted = matches!(
            self.handle.stop_reason(),
            StopReason::Cancelled | StopReason::TimedOut
        );
        self.supervisor
            .finish(self.conversation_id, &self.handle)
            .await;

        let finished = self.repository.finish(self.response_message_id, aborted).await;
        match (failure, finished) {
            (None, Ok(message)) => {
                info!(conversation_id = %self.conversation_id, aborted, "generation finished");
                self.forward(ChatFrame::Final {
                    conversation_id: self.conversation_id,
                    message,
                    aborted,
                })
                .await;
            }
            (Some(message), _) => {
                warn!(conversation_id = %self.conversation_id, error = %message, "generation failed");
                counter!("livetail_generation_failures_total").increment(1);
                self.forward(ChatFrame::Error { message }).await;
            }
            (None, Err(err)) => {
                error!(conversation_id = %self.conversation_id, error = %err, "could not finalize response");
                self.forward(ChatFrame::Error {
                    message: err.to_string(),
                })
                .await;
            }
        }
    }

    async fn apply(&mut self, event: GenerationEvent, index: u64) -> Result<(), RepositoryError> {
        let message_id = self.response_message_id;
        let frame = match event {
            GenerationEvent::Text(text) => {
                self.repository.append_text(message_id, &text).await?;
                ChatFrame::Delta {
                    message_id,
                    index,
                    text,
                }
            }
            GenerationEvent::Step(step) => {
                self.repository
                    .upsert_step(message_id, step.clone())
                    .await?;
                ChatFrame::Step {
                    message_id,
                    index,
                    step,
                }
            }
            GenerationEvent::Attachment(attachment) => {
                self.repository
                    .add_attachment(message_id, attachment.clone())
                    .await?;
                ChatFrame::Attachment {
                    message_id,
                    attachment,
                }
            }
        };
        self.forward(frame).await;
        Ok(())
    }

    /// Send to the listening client, if any. A departed client does not stop
    /// the generation.
    async fn forward(&mut self, frame: ChatFrame) {
        let Some(sink) = &self.sink else {
            return;
        };
        if sink.send(frame).await.is_err() {
            debug!(conversation_id = %self.conversation_id, "client detached; generation continues");
            self.sink = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        generation::EchoGenerator, message_repository::InMemoryMessageRepository,
        stream_supervisor::StreamSupervisor,
    };
    use std::time::Duration;

    fn service(delay: Duration) -> (ChatService, Arc<InMemoryMessageRepository>) {
        let repository = Arc::new(InMemoryMessageRepository::new());
        let service = ChatService::new(
            Arc::new(EchoGenerator::new(delay)),
            Arc::clone(&repository) as Arc<dyn MessageRepository>,
            Arc::new(StreamSupervisor::new(None)),
            8,
        );
        (service, repository)
    }

    fn request(conversation_id: Option<Uuid>, text: &str) -> GenerationRequest {
        GenerationRequest {
            conversation_id,
            parent_message_id: None,
            client_message_id: Uuid::new_v4(),
            placeholder_response_id: Uuid::new_v4(),
            text: text.into(),
        }
    }

    async fn collect(mut frames: mpsc::Receiver<ChatFrame>) -> Vec<ChatFrame> {
        let mut collected = Vec::new();
        while let Some(frame) = frames.recv().await {
            collected.push(frame);
        }
        collected
    }

    #[tokio::test]
    async fn full_generation_emits_created_deltas_and_final() {
        let (service, _) = service(Duration::ZERO);
        let request = request(None, "one two three");
        let placeholder = request.placeholder_response_id;
        let stream = service.start(request).await.unwrap();
        let frames = collect(stream.frames).await;

        assert!(matches!(
            &frames[0],
            ChatFrame::Created { placeholder_response_id, .. } if *placeholder_response_id == placeholder
        ));
        assert!(frames.iter().any(|frame| frame.kind() == "sync"));
        let deltas: Vec<_> = frames
            .iter()
            .filter_map(|frame| match frame {
                ChatFrame::Delta { index, text, .. } => Some((*index, text.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(deltas.len(), 3);
        assert!(deltas.windows(2).all(|pair| pair[0].0 < pair[1].0));

        match frames.last().unwrap() {
            ChatFrame::Final { message, aborted, .. } => {
                assert!(!aborted);
                assert_eq!(message.text, "one two three");
                assert!(message.is_finished());
            }
            other => panic!("expected final frame, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn generation_survives_client_detach() {
        let (service, repository) = service(Duration::from_millis(100));
        let stream = service
            .start(request(None, "keeps going after the listener leaves"))
            .await
            .unwrap();
        let conversation_id = stream.conversation_id;
        drop(stream.frames);

        tokio::time::sleep(Duration::from_secs(5)).await;

        let messages = repository.list(conversation_id).await.unwrap();
        let response = messages.last().unwrap();
        assert!(response.is_finished());
        assert_eq!(response.text, "keeps going after the listener leaves");
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_generation_and_marks_message() {
        let (service, repository) = service(Duration::from_millis(100));
        let stream = service
            .start(request(None, "a fairly long answer that will be cut"))
            .await
            .unwrap();
        let conversation_id = stream.conversation_id;

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(service.abort(conversation_id).await, StopReason::Cancelled);

        let frames = collect(stream.frames).await;
        assert!(matches!(
            frames.last(),
            Some(ChatFrame::Final { aborted: true, .. })
        ));
        // Nothing left to stop once the generation has wound down.
        assert_eq!(service.abort(conversation_id).await, StopReason::None);

        let stored = repository.list(conversation_id).await.unwrap();
        let response = stored.last().unwrap();
        assert!(response.aborted);
        assert!(response.text.len() < "a fairly long answer that will be cut".len());
    }

    #[tokio::test(start_paused = true)]
    async fn second_generation_in_same_conversation_is_busy() {
        let (service, _) = service(Duration::from_millis(100));
        let conversation = Uuid::new_v4();
        let _first = service.start(request(Some(conversation), "slow reply")).await.unwrap();

        assert!(matches!(
            service.start(request(Some(conversation), "again")).await,
            Err(ChatError::Busy(id)) if id == conversation
        ));
    }

    #[tokio::test]
    async fn empty_prompt_releases_the_conversation() {
        let (service, _) = service(Duration::ZERO);
        let conversation = Uuid::new_v4();
        assert!(service.start(request(Some(conversation), " ")).await.is_err());
        assert!(service.start(request(Some(conversation), "hi")).await.is_ok());
    }
}
