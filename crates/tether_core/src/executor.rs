use crate::error::{BridgeError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::{Builder, Handle, Runtime as TokioRuntime};
use tokio::task::JoinHandle;

struct ExecutorInner {
    handle: Handle,
    runtime: Mutex<Option<TokioRuntime>>,
    stopped: AtomicBool,
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        let runtime = self.runtime.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(runtime) = runtime {
            // Safe to call from inside a worker of this very runtime.
            runtime.shutdown_background();
        }
    }
}

/// Shared worker pool running scheduled-async and suspending calls.
#[derive(Clone)]
pub struct BackgroundExecutor {
    inner: Arc<ExecutorInner>,
}

impl BackgroundExecutor {
    pub fn new(threads: usize, thread_name: &str) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name(format!("{thread_name}-bg"))
            .enable_all()
            .build()?;
        tracing::debug!(threads = threads.max(1), "background executor started");
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                handle: runtime.handle().clone(),
                runtime: Mutex::new(Some(runtime)),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::Acquire)
    }

    /// Run blocking work on the pool.
    pub fn spawn_blocking<F>(&self, work: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_running()?;
        Ok(self.inner.handle.spawn_blocking(work))
    }

    /// Poll `future` to completion on the pool.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.ensure_running()?;
        Ok(self.inner.handle.spawn(future))
    }

    /// Stop accepting work and tear the pool down without waiting for
    /// running tasks.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let runtime = self
            .inner
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        tracing::debug!("background executor stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BridgeError::context_lost("background executor has shut down"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn blocking_work_runs_off_thread() {
        let executor = BackgroundExecutor::new(1, "test").unwrap();
        let caller = std::thread::current().id();
        let (sender, receiver) = mpsc::channel();
        executor
            .spawn_blocking(move || {
                let _ = sender.send(std::thread::current().id());
            })
            .unwrap();
        let worker = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(worker, caller);
    }

    #[test]
    fn shut_down_executor_rejects_work() {
        let executor = BackgroundExecutor::new(1, "test").unwrap();
        executor.shutdown();
        executor.shutdown();
        assert!(!executor.is_running());
        let error = executor.spawn(async {}).unwrap_err();
        assert_eq!(error.code(), "ERR_CONTEXT_LOST");
    }
}
