use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::lock_or_recover;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCommand {
    Replicate,
    Delete,
}

/// One unit of work for a data node. Without `block` a delete covers every block of the file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub command: TaskCommand,
    #[serde(rename = "name")]
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<u64>,
}

impl Task {
    pub fn delete_file(file_id: impl Into<String>) -> Self {
        Self {
            command: TaskCommand::Delete,
            file_id: file_id.into(),
            block: None,
            ids: Vec::new(),
        }
    }

    pub fn delete_block(file_id: impl Into<String>, block: u32) -> Self {
        Self {
            command: TaskCommand::Delete,
            file_id: file_id.into(),
            block: Some(block),
            ids: Vec::new(),
        }
    }

    pub fn replicate_block(file_id: impl Into<String>, block: u32, targets: Vec<u64>) -> Self {
        Self {
            command: TaskCommand::Replicate,
            file_id: file_id.into(),
            block: Some(block),
            ids: targets,
        }
    }
}

/// Pending tasks per numeric node id, FIFO per node. No server-side bound.
#[derive(Default)]
pub struct TaskQueue {
    queues: Mutex<HashMap<u64, VecDeque<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<u64, VecDeque<Task>>> {
        lock_or_recover(&self.queues, "task queue")
    }

    pub fn push(&self, node: u64, task: Task) {
        let mut queues = self.queues();
        debug!("task queue: push to node {}: {:?}", node, task);
        queues.entry(node).or_default().push_back(task);
    }

    /// Fan the same task out to every node in `nodes`.
    pub fn push_to_all(&self, nodes: &[u64], task: &Task) {
        let mut queues = self.queues();
        for node in nodes {
            queues.entry(*node).or_default().push_back(task.clone());
        }
    }

    pub fn pop(&self, node: u64) -> Option<Task> {
        let mut queues = self.queues();
        let queue = queues.get_mut(&node)?;
        let task = queue.pop_front();
        if queue.is_empty() {
            queues.remove(&node);
        }
        task
    }

    pub fn pending(&self, node: u64) -> usize {
        self.queues().get(&node).map(|q| q.len()).unwrap_or(0)
    }

    pub fn snapshot(&self, node: u64) -> Vec<Task> {
        self.queues()
            .get(&node)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn total_pending(&self) -> usize {
        self.queues().values().map(|q| q.len()).sum()
    }
}
