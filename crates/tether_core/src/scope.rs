use crate::promise::{Promise, Settlement};
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;

struct ScopeState {
    active: bool,
    tasks: Vec<AbortHandle>,
}

/// Cancellation scope owned by one module.
///
/// Suspending calls run inside the scope of their module. Once the scope is
/// cancelled, in-flight work is aborted and nothing is delivered to its
/// promise; settlement and cancellation are serialized on the same lock.
#[derive(Clone)]
pub struct ModuleScope {
    module: Arc<str>,
    state: Arc<Mutex<ScopeState>>,
}

impl ModuleScope {
    pub fn new(module: &str) -> Self {
        Self {
            module: Arc::from(module),
            state: Arc::new(Mutex::new(ScopeState {
                active: true,
                tasks: Vec::new(),
            })),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Number of tracked tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.lock()
            .tasks
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Track a running task. Returns `false`, leaving the task untracked, if
    /// the scope was already cancelled.
    pub(crate) fn track(&self, task: AbortHandle) -> bool {
        let mut state = self.lock();
        if !state.active {
            return false;
        }
        state.tasks.retain(|task| !task.is_finished());
        state.tasks.push(task);
        true
    }

    /// Settle `promise` unless the scope has been cancelled.
    pub(crate) fn settle_if_active(&self, promise: &Promise, outcome: Settlement) -> bool {
        let state = self.lock();
        if !state.active {
            tracing::debug!(module = %self.module, "scope cancelled; dropping completion");
            return false;
        }
        promise.settle(outcome)
    }

    /// Abort every in-flight task. Idempotent; returns how many tasks were
    /// still running.
    pub fn cancel(&self) -> usize {
        let tasks = {
            let mut state = self.lock();
            if !state.active {
                return 0;
            }
            state.active = false;
            std::mem::take(&mut state.tasks)
        };
        let running = tasks.iter().filter(|task| !task.is_finished()).count();
        for task in tasks {
            task.abort();
        }
        tracing::debug!(module = %self.module, running, "module scope cancelled");
        running
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancelled_scope_drops_completions() {
        let scope = ModuleScope::new("Demo");
        let (promise, receiver) = Promise::channel();
        scope.cancel();

        assert!(!scope.settle_if_active(&promise, Ok(1.into())));
        assert!(!promise.is_settled());
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn cancel_aborts_tracked_tasks() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let scope = ModuleScope::new("Demo");
        let task = runtime.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(scope.track(task.abort_handle()));
        assert_eq!(scope.in_flight(), 1);

        assert_eq!(scope.cancel(), 1);
        let joined = runtime.block_on(task);
        assert!(joined.unwrap_err().is_cancelled());

        assert_eq!(scope.cancel(), 0);
        let late = runtime.spawn(async {});
        assert!(!scope.track(late.abort_handle()));
    }
}
