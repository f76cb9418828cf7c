// Per-task bookkeeping shared between the pipeline and the task's runner

use simflow_core::Task;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Live state of one submitted task
///
/// The watch channel always holds the latest snapshot; waiters subscribe and
/// wake on every change. All writes go through `update`, which only notifies
/// when the closure reports a change.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    state: watch::Sender<Task>,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub(crate) fn new(task: Task) -> Self {
        let (state, _) = watch::channel(task);
        Self {
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> Task {
        self.state.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Task> {
        self.state.subscribe()
    }

    /// Apply a mutation; returns whether the task changed
    pub(crate) fn update(&self, f: impl FnOnce(&mut Task) -> bool) -> bool {
        self.state.send_if_modified(f)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simflow_core::{TaskSpec, TaskStatus};

    #[tokio::test]
    async fn test_update_notifies_subscribers() {
        let handle = TaskHandle::new(Task::new(TaskSpec::new("fenics", "fem_solve.py")));
        let mut rx = handle.subscribe();

        assert!(handle.update(|t| t.mark_running()));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().status, TaskStatus::Running);
    }

    #[test]
    fn test_rejected_update_does_not_notify() {
        let handle = TaskHandle::new(Task::new(TaskSpec::new("fenics", "fem_solve.py")));
        handle.update(|t| t.cancel("stop"));
        let rx = handle.subscribe();

        assert!(!handle.update(|t| t.mark_running()));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(handle.snapshot().status, TaskStatus::Cancelled);
    }
}
