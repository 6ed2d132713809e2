use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::CompletionError;
use crate::models::{Completion, CompletionJob, CompletionRequest};

// Prompt in, generated text out
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn ask(&self, request: CompletionRequest) -> Result<Completion, CompletionError>;
}

// Hands requests to the completion worker and waits for its answer
pub struct QueuedCompletion {
    queue: mpsc::Sender<CompletionJob>,
}

impl QueuedCompletion {
    pub fn new(queue: mpsc::Sender<CompletionJob>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl CompletionService for QueuedCompletion {
    async fn ask(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.queue
            .send(CompletionJob {
                request,
                response_tx,
            })
            .await
            .map_err(|_| CompletionError::QueueClosed)?;

        response_rx.await.map_err(|_| CompletionError::WorkerGone)?
    }
}
