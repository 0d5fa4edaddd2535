//! Bounded worker pool for handler invocations
//!
//! Every submitted task is spawned immediately but only runs once it holds one
//! of the pool's slots. When it finishes, normally or by panicking, it reports
//! a [`Completion`] on the channel the dispatcher reads from.

use super::correlator::TaskId;
use super::envelope::CommandEnvelope;
use super::handlers::Handler;
use cmdbroker_shared::CommandResult;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::AbortHandle;

/// Outcome of one task, sent back to the dispatcher
#[derive(Debug)]
pub struct Completion {
    pub task_id: TaskId,
    /// The handler's result, or a description of the fault that stopped it
    pub outcome: Result<CommandResult, String>,
}

pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
    completions: mpsc::UnboundedSender<Completion>,
}

impl WorkerPool {
    /// Create a pool with `size` slots and the receiver its completions arrive on
    pub fn new(size: usize) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let pool = Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
            completions,
        };
        (pool, completions_rx)
    }

    /// Run `handler` on `envelope` in a worker slot
    pub fn submit(&self, task_id: TaskId, handler: Arc<Handler>, envelope: CommandEnvelope) -> AbortHandle {
        self.spawn(task_id, async move { handler.process(&envelope).await })
    }

    /// Run an arbitrary unit of work in a worker slot
    pub fn spawn<F>(&self, task_id: TaskId, work: F) -> AbortHandle
    where
        F: Future<Output = CommandResult> + Send + 'static,
    {
        let slots = self.slots.clone();
        let completions = self.completions.clone();

        let task = tokio::spawn(async move {
            let outcome = match slots.acquire_owned().await {
                Ok(_permit) => AssertUnwindSafe(work)
                    .catch_unwind()
                    .await
                    .map_err(panic_message),
                Err(_) => Err("worker pool closed".to_string()),
            };
            // Receiver gone means the dispatcher has stopped; nobody to answer
            let _ = completions.send(Completion { task_id, outcome });
        });

        task.abort_handle()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently running a task
    pub fn busy(&self) -> usize {
        self.size - self.slots.available_permits()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}
