//! Arena of task nodes backing the executor.
//!
//! Nodes are addressed by index and never removed while a run is alive, so a
//! `TaskId` stays valid for the lifetime of its tree.

use std::sync::Arc;

use chartpack_core::error::PackError;
use parking_lot::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

/// Index of a node inside a [`TaskTree`].
pub type TaskId = usize;

/// Lifecycle of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Registered, not yet scheduled.
    Created,
    /// Waiting for a free worker slot.
    Acquiring,
    /// Body is executing and holds a slot.
    Running,
    /// Slot released while the task waits for its descendants.
    WaitingOnChildren,
    /// Body returned and every child completed. Terminal.
    Completed,
}

struct TaskNode {
    children: Vec<TaskId>,
    state: TaskState,
    slot: Option<OwnedSemaphorePermit>,
    /// Own error until completion, merged subtree error afterwards.
    error: Option<PackError>,
    done: watch::Sender<bool>,
}

/// Shared task tree plus the worker slot pool.
pub(crate) struct TaskTree {
    nodes: Mutex<Vec<TaskNode>>,
    pool: Arc<Semaphore>,
}

impl TaskTree {
    pub(crate) fn new(concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(Vec::new()),
            pool: Arc::new(Semaphore::new(concurrency.max(1))),
        })
    }

    /// Register a new node, linking it under `parent` when given.
    pub(crate) fn insert(&self, parent: Option<TaskId>) -> TaskId {
        let (done, _) = watch::channel(false);
        let mut nodes = self.nodes.lock();
        let id = nodes.len();
        nodes.push(TaskNode {
            children: Vec::new(),
            state: TaskState::Created,
            slot: None,
            error: None,
            done,
        });
        if let Some(parent) = parent {
            nodes[parent].children.push(id);
        }
        id
    }

    pub(crate) fn state(&self, id: TaskId) -> TaskState {
        self.nodes.lock()[id].state
    }

    pub(crate) fn set_state(&self, id: TaskId, state: TaskState) {
        self.nodes.lock()[id].state = state;
    }

    pub(crate) fn children(&self, id: TaskId) -> Vec<TaskId> {
        self.nodes.lock()[id].children.clone()
    }

    pub(crate) fn subscribe(&self, id: TaskId) -> watch::Receiver<bool> {
        self.nodes.lock()[id].done.subscribe()
    }

    /// Block until a worker slot is free and attach it to the node.
    pub(crate) async fn acquire(&self, id: TaskId) -> Result<(), PackError> {
        self.set_state(id, TaskState::Acquiring);

        let permit = Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .map_err(|e| PackError::TaskError(format!("worker pool closed: {}", e)))?;

        let mut nodes = self.nodes.lock();
        nodes[id].slot = Some(permit);
        nodes[id].state = TaskState::Running;
        Ok(())
    }

    /// Return the node's slot to the pool. Releasing twice is a no-op.
    pub(crate) fn release(&self, id: TaskId) {
        let permit = self.nodes.lock()[id].slot.take();
        drop(permit);
    }

    pub(crate) fn record_error(&self, id: TaskId, error: PackError) {
        let mut nodes = self.nodes.lock();
        let node = &mut nodes[id];
        node.error = PackError::merge(node.error.take().into_iter().chain(Some(error)));
    }

    /// Mark a node terminal, folding its children's errors into its own.
    ///
    /// Callers must only invoke this once every child reached `Completed`.
    pub(crate) fn complete(&self, id: TaskId) {
        let mut nodes = self.nodes.lock();

        let children = std::mem::take(&mut nodes[id].children);
        let mut errors: Vec<PackError> = nodes[id].error.take().into_iter().collect();
        for child in &children {
            debug_assert_eq!(nodes[*child].state, TaskState::Completed);
            if let Some(error) = nodes[*child].error.take() {
                errors.push(error);
            }
        }

        let node = &mut nodes[id];
        node.children = children;
        node.error = PackError::merge(errors);
        node.slot = None;
        node.state = TaskState::Completed;
        node.done.send_replace(true);
    }

    pub(crate) fn take_error(&self, id: TaskId) -> Option<PackError> {
        self.nodes.lock()[id].error.take()
    }

    #[cfg(test)]
    pub(crate) fn available_slots(&self) -> usize {
        self.pool.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let tree = TaskTree::new(2);
        let id = tree.insert(None);

        tree.acquire(id).await.unwrap();
        assert_eq!(tree.available_slots(), 1);
        assert_eq!(tree.state(id), TaskState::Running);

        tree.release(id);
        tree.release(id);
        assert_eq!(tree.available_slots(), 2);
    }

    #[test]
    fn test_complete_merges_child_errors() {
        let tree = TaskTree::new(1);
        let root = tree.insert(None);
        let a = tree.insert(Some(root));
        let b = tree.insert(Some(root));

        tree.record_error(a, PackError::NotFound("a".to_string()));
        tree.complete(a);
        tree.complete(b);
        tree.record_error(root, PackError::NotFound("root".to_string()));
        tree.complete(root);

        assert_eq!(tree.state(root), TaskState::Completed);
        assert_eq!(tree.children(root), vec![a, b]);
        let error = tree.take_error(root).unwrap();
        assert_eq!(error.count(), 2);
    }

    #[test]
    fn test_complete_signals_subscribers() {
        let tree = TaskTree::new(1);
        let id = tree.insert(None);
        let rx = tree.subscribe(id);
        assert!(!*rx.borrow());

        tree.complete(id);
        assert!(*rx.borrow());
    }
}
