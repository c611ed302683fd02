use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use futures::Stream;
use shared::models::{Attachment, StepEvent, StepStatus};
use thiserror::Error;

/// One unit of output from a response generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Text(String),
    Step(StepEvent),
    Attachment(Attachment),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generator rejected the prompt: {0}")]
    Rejected(String),
    #[error("generation failed: {0}")]
    Failed(String),
}

pub type GenerationStream =
    Pin<Box<dyn Stream<Item = Result<GenerationEvent, GenerationError>> + Send>>;

/// Produces the assistant reply for a prompt as an incremental stream.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<GenerationStream, GenerationError>;

    fn model_name(&self) -> &str;
}

/// Development generator: echoes the prompt back word by word.
#[derive(Debug, Clone)]
pub struct EchoGenerator {
    chunk_delay: Duration,
}

impl EchoGenerator {
    #[must_use]
    pub fn new(chunk_delay: Duration) -> Self {
        Self { chunk_delay }
    }
}

fn compose_step(status: StepStatus) -> StepEvent {
    StepEvent {
        step_id: "compose".to_string(),
        name: "compose reply".to_string(),
        status,
        output: None,
    }
}

#[async_trait]
impl ResponseGenerator for EchoGenerator {
    async fn generate(&self, prompt: &str) -> Result<GenerationStream, GenerationError> {
        if prompt.trim().is_empty() {
            return Err(GenerationError::Rejected("prompt is empty".to_string()));
        }

        let words: Vec<String> = prompt
            .split_inclusive(char::is_whitespace)
            .map(str::to_string)
            .collect();
        let delay = self.chunk_delay;

        let stream = async_stream::stream! {
            yield Ok(GenerationEvent::Step(compose_step(StepStatus::Started)));
            for word in words {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(GenerationEvent::Text(word));
            }
            yield Ok(GenerationEvent::Step(compose_step(StepStatus::Completed)));
        };
        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn echo_streams_words_between_steps() {
        let generator = EchoGenerator::new(Duration::ZERO);
        let events: Vec<_> = generator
            .generate("hello brave world")
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(events.len(), 5);
        assert!(matches!(&events[0], GenerationEvent::Step(step) if step.status == StepStatus::Started));
        let text: String = events
            .iter()
            .filter_map(|event| match event {
                GenerationEvent::Text(chunk) => Some(chunk.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello brave world");
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let generator = EchoGenerator::new(Duration::ZERO);
        assert!(matches!(
            generator.generate("   ").await,
            Err(GenerationError::Rejected(_))
        ));
    }
}
