//! In-process dispatch onto the tokio runtime.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::StageDispatcher;
use crate::error::{Error, Result};
use crate::orchestrator::Pipeline;
use crate::request::StageTask;

/// Sends tasks to a worker loop started by [`spawn_local_workers`].
#[derive(Debug, Clone)]
pub struct LocalDispatcher {
    sender: mpsc::UnboundedSender<StageTask>,
}

impl LocalDispatcher {
    /// Creates a dispatcher and the receiver its worker loop consumes.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StageTask>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl StageDispatcher for LocalDispatcher {
    async fn dispatch(&self, task: StageTask) -> Result<()> {
        self.sender
            .send(task)
            .map_err(|e| Error::dispatch(format!("local worker loop stopped; dropped {} task", e.0.stage())))
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Runs every received task as its own detached tokio task.
///
/// Task failures are logged and dropped, mirroring a fire-and-forget
/// invocation service. The loop ends once every sender is gone; abort the
/// returned handle to stop it earlier.
pub fn spawn_local_workers(
    pipeline: Arc<Pipeline>,
    mut receiver: mpsc::UnboundedReceiver<StageTask>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(task) = receiver.recv().await {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                let stage = task.stage();
                let request_id = task.request_id();
                if let Err(error) = pipeline.handle(task).await {
                    tracing::error!(
                        %stage,
                        request_id = %request_id,
                        error = %error,
                        "stage invocation failed"
                    );
                }
            });
        }
        tracing::debug!("local worker loop stopped");
    })
}
