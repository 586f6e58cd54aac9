//! FIFO of pending task ids owned by the coordinator's control loop.
//!
//! The queue has exactly one mutator, so it carries no lock. Requeued tasks go
//! to the tail behind everything that has never been attempted.

use std::collections::VecDeque;

use crate::types::TaskId;

/// Ordered sequence of task ids awaiting dispatch.
#[derive(Debug, Default)]
pub struct TaskQueue {
    pending: VecDeque<TaskId>,
    requeued: u64,
}

impl TaskQueue {
    /// Create an empty task queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the queue with task ids in order.
    pub fn from_ids(ids: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            pending: ids.into_iter().collect(),
            requeued: 0,
        }
    }

    /// Pop the head task, if any.
    pub fn pop(&mut self) -> Option<TaskId> {
        self.pending.pop_front()
    }

    /// Put an unfinished task back at the tail.
    pub fn requeue(&mut self, task: TaskId) {
        debug_assert!(
            !self.pending.contains(&task),
            "task {task} requeued while already pending"
        );
        self.pending.push_back(task);
        self.requeued += 1;
    }

    /// Number of tasks waiting to be dispatched.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.pending.contains(&task)
    }

    /// Total requeues over the queue's lifetime.
    pub fn requeued(&self) -> u64 {
        self.requeued
    }

    /// Snapshot of pending ids, head first.
    pub fn pending(&self) -> Vec<TaskId> {
        self.pending.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_seed_order() {
        let mut queue = TaskQueue::from_ids(0..4);
        let popped: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn requeue_appends_at_tail() {
        let mut queue = TaskQueue::from_ids(0..3);
        let head = queue.pop().expect("head task");
        // The requeued task goes behind tasks never attempted.
        queue.requeue(head);
        assert_eq!(queue.pending(), vec![1, 2, 0]);
        assert_eq!(queue.requeued(), 1);
    }

    #[test]
    fn pop_on_empty_queue_is_none() {
        let mut queue = TaskQueue::new();
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn contains_tracks_membership() {
        let mut queue = TaskQueue::from_ids([7, 9]);
        assert!(queue.contains(7));
        queue.pop();
        assert!(!queue.contains(7));
        assert!(queue.contains(9));
    }
}
