//! Structured concurrency executor.
//!
//! A run owns a tree of tasks that share a fixed pool of worker slots. Any
//! task may spawn children with [`TaskHandle::run_async`]; the run finishes
//! only when the root and every descendant finished, and returns the merged
//! error of the whole tree.
//!
//! ```text
//!   run(limit, root)
//!     └── root ── run_async ──► child ── run_async ──► grandchild
//!                               │
//!                               └── wait_for_children()  (slot released)
//! ```
//!
//! Failures are fail-open: an error never cancels siblings or descendants,
//! it is recorded on its node and merged upward once the subtree completed.

mod tree;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chartpack_core::error::{PackError, Result};
use futures::FutureExt;

use tree::{TaskId, TaskState, TaskTree};

/// Run `body` as the root of a new task tree.
///
/// At most `concurrency` task bodies execute at any instant, no matter how
/// many tasks exist. Resolves once every task terminated.
pub async fn run<F, Fut>(concurrency: usize, body: F) -> Result<()>
where
    F: FnOnce(TaskHandle) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let tree = TaskTree::new(concurrency);
    let root = tree.insert(None);

    execute(Arc::clone(&tree), root, body).await;

    match tree.take_error(root) {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Handle given to every task body.
///
/// Not `Clone`: a handle belongs to exactly one running task.
pub struct TaskHandle {
    tree: Arc<TaskTree>,
    id: TaskId,
}

impl TaskHandle {
    /// Register a child of the current task and schedule it.
    ///
    /// Returns immediately; the child starts once a worker slot is free.
    pub fn run_async<F, Fut>(&self, body: F)
    where
        F: FnOnce(TaskHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let child = self.tree.insert(Some(self.id));
        tokio::spawn(execute(Arc::clone(&self.tree), child, body));
    }

    /// Wait until every child spawned so far, and their descendants, completed.
    ///
    /// The task's worker slot is handed back while waiting so that children
    /// can run even when the pool is smaller than the number of live tasks.
    /// Children's errors are not returned here; they surface from [`run`].
    pub async fn wait_for_children(&self) {
        self.tree.release(self.id);
        self.tree.set_state(self.id, TaskState::WaitingOnChildren);

        await_children(&self.tree, self.id).await;

        self.reacquire().await;
    }

    /// Sleep for `duration` without holding a worker slot.
    pub async fn wait(&self, duration: Duration) {
        self.suspend(tokio::time::sleep(duration)).await;
    }

    /// Await `future` without holding a worker slot.
    ///
    /// Use this for anything that depends on progress made by other tasks
    /// of the same run, otherwise a small pool can deadlock.
    pub async fn suspend<F: Future>(&self, future: F) -> F::Output {
        self.tree.release(self.id);
        let output = future.await;
        self.reacquire().await;
        output
    }

    async fn reacquire(&self) {
        if let Err(e) = self.tree.acquire(self.id).await {
            self.tree.record_error(self.id, e);
        }
    }
}

async fn execute<F, Fut>(tree: Arc<TaskTree>, id: TaskId, body: F)
where
    F: FnOnce(TaskHandle) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    match tree.acquire(id).await {
        Ok(()) => {
            let handle = TaskHandle {
                tree: Arc::clone(&tree),
                id,
            };
            let outcome = AssertUnwindSafe(async move { body(handle).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tree.record_error(id, e),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(task = id, panic = %message, "Task panicked");
                    tree.record_error(id, PackError::TaskError(format!("task panicked: {}", message)));
                }
            }
        }
        Err(e) => tree.record_error(id, e),
    }

    tree.release(id);
    tree.set_state(id, TaskState::WaitingOnChildren);
    await_children(&tree, id).await;
    tree.complete(id);
}

async fn await_children(tree: &TaskTree, id: TaskId) {
    let mut waited = 0;
    loop {
        let children = tree.children(id);
        if children.len() == waited {
            break;
        }

        for child in &children[waited..] {
            let mut done = tree.subscribe(*child);
            // The sender lives in the arena for the whole run.
            let _ = done.wait_for(|finished| *finished).await;
        }
        waited = children.len();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
