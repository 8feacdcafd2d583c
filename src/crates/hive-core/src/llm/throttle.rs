//! Concurrency cap for a shared completion model.
//!
//! The provider is shared by the queen, worker executions, and judges.
//! [`ThrottledModel`] wraps any model with a semaphore: concurrent calls are
//! allowed up to the configured max, and excess calls queue in FIFO order
//! (tokio's semaphore is fair). The permit is held for the full life of the
//! returned stream, not just the request setup.

use super::{CompletionModel, CompletionRequest, CompletionStream};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// A completion model with a cap on in-flight calls.
#[derive(Clone)]
pub struct ThrottledModel {
    inner: Arc<dyn CompletionModel>,
    semaphore: Arc<Semaphore>,
}

impl ThrottledModel {
    /// Wrap `inner`, allowing at most `max_concurrent` in-flight streams.
    pub fn new(inner: Arc<dyn CompletionModel>, max_concurrent: usize) -> Self {
        Self {
            inner,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[async_trait]
impl CompletionModel for ThrottledModel {
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Execution("model semaphore closed".to_string()))?;
        let inner = self.inner.stream(request).await?;

        let stream = async_stream::stream! {
            let _permit = permit;
            futures::pin_mut!(inner);
            while let Some(chunk) = inner.next().await {
                yield chunk;
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{ScriptedModel, ScriptedTurn};
    use crate::llm::{ChatMessage, CompletionChunk};

    #[tokio::test]
    async fn test_permit_held_for_stream_lifetime() {
        let model = ThrottledModel::new(
            Arc::new(ScriptedModel::new(vec![
                ScriptedTurn::text("one"),
                ScriptedTurn::text("two"),
            ])),
            1,
        );

        let request = CompletionRequest::new(vec![ChatMessage::user("hi")]);
        let mut first = model.stream(request.clone()).await.unwrap();
        assert_eq!(model.available(), 0);

        // Drain the first stream; the permit frees up afterwards.
        while let Some(chunk) = first.next().await {
            chunk.unwrap();
        }
        drop(first);
        assert_eq!(model.available(), 1);

        let mut second = model.stream(request).await.unwrap();
        let mut text = String::new();
        while let Some(chunk) = second.next().await {
            if let CompletionChunk::TextDelta(delta) = chunk.unwrap() {
                text.push_str(&delta);
            }
        }
        assert_eq!(text, "two");
    }

    #[tokio::test]
    async fn test_excess_calls_wait() {
        let model = ThrottledModel::new(Arc::new(ScriptedModel::always("x")), 1);
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")]);

        let held = model.stream(request.clone()).await.unwrap();
        let contender = {
            let model = model.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let mut stream = model.stream(request).await.unwrap();
                while let Some(chunk) = stream.next().await {
                    chunk.unwrap();
                }
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!contender.is_finished());

        drop(held);
        tokio::time::timeout(std::time::Duration::from_secs(1), contender)
            .await
            .expect("queued call ran after permit release")
            .unwrap();
    }
}
