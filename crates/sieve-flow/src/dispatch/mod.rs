//! Fire-and-forget stage dispatch.
//!
//! - [`StageDispatcher`]: hands a [`StageTask`] to some execution backend
//! - [`InMemoryStageQueue`]: records tasks for step-by-step tests
//! - [`LocalDispatcher`]: runs each task on its own tokio task
//!
//! A dispatcher only reports whether the hand-off succeeded. The invoked
//! stage's own result never flows back to the dispatching stage.

pub mod local;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::StageTask;

pub use local::{spawn_local_workers, LocalDispatcher};
pub use memory::InMemoryStageQueue;

/// Hands stage tasks to an execution backend.
#[async_trait]
pub trait StageDispatcher: Send + Sync + 'static {
    /// Dispatches one task without waiting for it to run.
    ///
    /// # Errors
    ///
    /// Returns `Error::Dispatch` if the backend refused the task.
    async fn dispatch(&self, task: StageTask) -> Result<()>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}
