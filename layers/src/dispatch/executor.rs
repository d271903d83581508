//! Task Executors
//!
//! Execution contexts slot tasks can be submitted to.

use crate::LayerError;
use interfaces::TaskExecutor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::trace;

/// Runs the task on the calling thread before returning
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) -> bool {
        task();
        true
    }
}

/// Runs tasks on the blocking thread pool of a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
    pending: Arc<AtomicUsize>,
    max_pending: Option<usize>,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle, pending: Arc::new(AtomicUsize::new(0)), max_pending: None }
    }

    /// Executor on the runtime the caller runs in
    pub fn current() -> Result<Self, LayerError> {
        let handle = Handle::try_current()
            .map_err(|e| LayerError::InvalidState(format!("no tokio runtime: {}", e)))?;
        Ok(Self::new(handle))
    }

    /// Refuse submissions while `max_pending` tasks are queued or running
    pub fn with_queue_limit(mut self, max_pending: usize) -> Self {
        self.max_pending = Some(max_pending);
        self
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl TaskExecutor for TokioExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) -> bool {
        let queued = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if self.max_pending.is_some_and(|max| queued > max) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            trace!("Executor refused task, {} pending", queued - 1);
            return false;
        }
        let pending = self.pending.clone();
        drop(self.handle.spawn_blocking(move || {
            task();
            pending.fetch_sub(1, Ordering::AcqRel);
        }));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_inline_executor_runs_immediately() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        assert!(InlineExecutor.execute(Box::new(move || flag.store(true, Ordering::SeqCst))));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_current_outside_runtime_fails() {
        assert!(TokioExecutor::current().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_executor_queue_limit() {
        let executor = TokioExecutor::current().unwrap().with_queue_limit(1);
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        assert!(executor.execute(Box::new(move || {
            let _ = rx.recv();
        })));
        assert!(!executor.execute(Box::new(|| {})));
        tx.send(()).unwrap();

        for _ in 0..100 {
            if executor.pending() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(executor.pending(), 0);
        assert!(executor.execute(Box::new(|| {})));
    }
}
