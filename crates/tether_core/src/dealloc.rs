use crate::error::panic_message;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Action = Box<dyn FnOnce() + Send>;

struct CleanupAction {
    label: String,
    action: Mutex<Option<Action>>,
}

impl CleanupAction {
    /// Run the action unless it already ran.
    fn fire(&self) -> bool {
        let action = self
            .action
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(action) = action else {
            return false;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
            tracing::error!(
                action = %self.label,
                "cleanup action failed: {}",
                panic_message(payload.as_ref())
            );
        }
        true
    }
}

/// Handle to a registered cleanup action.
#[derive(Clone)]
pub struct CleanupHandle {
    action: Arc<CleanupAction>,
}

impl CleanupHandle {
    /// Run the action early. The deallocator will skip it later.
    pub fn run_now(&self) -> bool {
        self.action.fire()
    }

    pub fn has_run(&self) -> bool {
        self.action
            .action
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    pub fn label(&self) -> &str {
        &self.action.label
    }
}

/// Ordered teardown of everything a runtime owns.
///
/// Actions run once, in reverse registration order, so later resources are
/// torn down before the ones they were built on.
pub struct Deallocator {
    actions: Mutex<Vec<Arc<CleanupAction>>>,
    deallocated: AtomicBool,
}

impl Deallocator {
    pub fn new() -> Self {
        Self {
            actions: Mutex::new(Vec::new()),
            deallocated: AtomicBool::new(false),
        }
    }

    /// Register a cleanup action. Actions registered after deallocation run
    /// immediately.
    pub fn register<F>(&self, label: &str, action: F) -> CleanupHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let action = Arc::new(CleanupAction {
            label: label.to_string(),
            action: Mutex::new(Some(Box::new(action))),
        });
        let handle = CleanupHandle {
            action: action.clone(),
        };
        {
            let mut actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
            if !self.deallocated.load(Ordering::Acquire) {
                actions.push(action);
                return handle;
            }
        }
        tracing::debug!(action = label, "late cleanup action runs immediately");
        action.fire();
        handle
    }

    /// Run every pending action. Only the first call does anything; returns
    /// the number of actions that ran.
    pub fn deallocate(&self) -> usize {
        let actions = {
            let mut actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
            if self.deallocated.swap(true, Ordering::AcqRel) {
                return 0;
            }
            std::mem::take(&mut *actions)
        };
        let mut ran = 0;
        for action in actions.iter().rev() {
            if action.fire() {
                tracing::trace!(action = %action.label, "cleanup action ran");
                ran += 1;
            }
        }
        ran
    }

    pub fn is_deallocated(&self) -> bool {
        self.deallocated.load(Ordering::Acquire)
    }

    /// Actions still waiting to run.
    pub fn pending(&self) -> usize {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|action| {
                action
                    .action
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_some()
            })
            .count()
    }
}

impl Default for Deallocator {
    fn default() -> Self {
        Self::new()
    }
}
