//! Shared identifiers and the task manifest broadcast at startup.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Index into the task manifest.
pub type TaskId = u64;
/// Unique identifier for a worker agent.
pub type WorkerId = u64;

/// Opaque input reference handed to the task executor (a path, a URL, a key).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef(pub String);

impl TaskRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable, ordered list of input references; task `i` is `references[i]`.
///
/// Established once by the coordinator and broadcast to every worker before
/// dispatch begins. Cloning shares the underlying list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskManifest {
    references: Arc<[TaskRef]>,
}

impl TaskManifest {
    /// Build a manifest from references in task-id order.
    pub fn new(references: impl IntoIterator<Item = TaskRef>) -> Self {
        Self {
            references: references.into_iter().collect(),
        }
    }

    /// Synthetic manifest of `count` references named `task-000000`, `task-000001`, ...
    pub fn synthetic(count: usize) -> Self {
        Self::new((0..count).map(|id| TaskRef::new(format!("task-{id:06}"))))
    }

    /// Total task count carried alongside the references in the broadcast.
    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Look up the input reference for a task id.
    pub fn get(&self, task: TaskId) -> Option<&TaskRef> {
        usize::try_from(task)
            .ok()
            .and_then(|index| self.references.get(index))
    }

    /// Task ids in manifest order.
    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        (0..self.references.len()).map(|index| index as TaskId)
    }
}
