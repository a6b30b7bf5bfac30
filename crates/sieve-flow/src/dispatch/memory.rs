//! In-memory stage queue for tests.
//!
//! Tasks are only recorded. A test pulls them with [`InMemoryStageQueue::take`]
//! and feeds them to the pipeline by hand, which makes interleavings
//! deterministic.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::StageDispatcher;
use crate::error::{Error, Result};
use crate::request::{Stage, StageTask};

/// Records dispatched tasks in FIFO order.
#[derive(Debug, Default)]
pub struct InMemoryStageQueue {
    queue: RwLock<VecDeque<StageTask>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::dispatch("stage queue lock poisoned")
}

impl InMemoryStageQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the oldest task.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<StageTask>> {
        let mut queue = self.queue.write().map_err(poison_err)?;
        let task = queue.pop_front();
        drop(queue);
        Ok(task)
    }

    /// Returns the oldest task without removing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn peek(&self) -> Result<Option<StageTask>> {
        let queue = self.queue.read().map_err(poison_err)?;
        Ok(queue.front().cloned())
    }

    /// Removes and returns every task.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<StageTask>> {
        let mut queue = self.queue.write().map_err(poison_err)?;
        let drained: Vec<_> = queue.drain(..).collect();
        drop(queue);
        Ok(drained)
    }

    /// Number of queued tasks for `stage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn count(&self, stage: Stage) -> Result<usize> {
        let queue = self.queue.read().map_err(poison_err)?;
        Ok(queue.iter().filter(|t| t.stage() == stage).count())
    }

    /// Number of queued tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let queue = self.queue.read().map_err(poison_err)?;
        Ok(queue.len())
    }

    /// Returns true if nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drops every queued task.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn clear(&self) -> Result<()> {
        let mut queue = self.queue.write().map_err(poison_err)?;
        queue.clear();
        drop(queue);
        Ok(())
    }
}

#[async_trait]
impl StageDispatcher for InMemoryStageQueue {
    async fn dispatch(&self, task: StageTask) -> Result<()> {
        let mut queue = self.queue.write().map_err(poison_err)?;
        queue.push_back(task);
        drop(queue);
        Ok(())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}
