//! Task correlator: in-flight task id -> originating caller

use crate::transport::CallerAddress;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

/// Identifier assigned to each submitted request, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One outstanding request
#[derive(Debug)]
pub struct TaskRecord {
    pub caller: CallerAddress,
    pub command_type: String,
    pub submitted_at: Instant,
    handle: AbortHandle,
}

impl TaskRecord {
    pub fn new(caller: CallerAddress, command_type: impl Into<String>, handle: AbortHandle) -> Self {
        Self {
            caller,
            command_type: command_type.into(),
            submitted_at: Instant::now(),
            handle,
        }
    }

    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    /// Stop the running computation; its completion will never arrive
    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// A task that has been outstanding for longer than expected
#[derive(Debug, Clone, PartialEq)]
pub struct StalledTask {
    pub task_id: TaskId,
    pub caller: CallerAddress,
    pub command_type: String,
    pub age: Duration,
}

/// Table of outstanding tasks
///
/// Cloning yields another handle to the same table. Every operation takes the
/// table lock, so an insert and a take can never observe each other half-done.
#[derive(Debug, Clone, Default)]
pub struct TaskCorrelator {
    tasks: Arc<Mutex<HashMap<TaskId, TaskRecord>>>,
}

impl TaskCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new task. Returns false, leaving the table unchanged, if the id
    /// is already outstanding.
    pub async fn insert(&self, task_id: TaskId, record: TaskRecord) -> bool {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task_id) {
            return false;
        }
        tasks.insert(task_id, record);
        true
    }

    /// Remove and return a task. Only the first call for an id gets the record.
    pub async fn take(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.tasks.lock().await.remove(&task_id)
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    /// Tasks outstanding for at least `threshold`, oldest first
    pub async fn stalled(&self, threshold: Duration) -> Vec<StalledTask> {
        let tasks = self.tasks.lock().await;
        let mut stalled: Vec<StalledTask> = tasks
            .iter()
            .filter(|(_, record)| record.age() >= threshold)
            .map(|(task_id, record)| StalledTask {
                task_id: *task_id,
                caller: record.caller,
                command_type: record.command_type.clone(),
                age: record.age(),
            })
            .collect();
        stalled.sort_by(|a, b| b.age.cmp(&a.age));
        stalled
    }

    /// Remove every outstanding task
    pub async fn drain(&self) -> Vec<(TaskId, TaskRecord)> {
        self.tasks.lock().await.drain().collect()
    }
}
