//! Structured fan-out of independent tasks.
//!
//! A [`TaskGroup`] runs every spawned future on the tokio runtime and joins
//! them according to its [`FailureMode`]:
//!
//! - [`FailureMode::FailFast`]: the first error aborts the remaining tasks and
//!   is returned. Used when the caller must see all-or-nothing.
//! - [`FailureMode::Collect`]: every task runs to completion; all errors are
//!   gathered into one [`ControllerError::Multiple`]. Used when each task's
//!   outcome is independent.

use std::future::Future;

use tokio::task::JoinSet;

use crate::error::{ControllerError, Result};
use crate::supervisor::panic_to_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    FailFast,
    Collect,
}

pub struct TaskGroup<T> {
    mode: FailureMode,
    context: &'static str,
    tasks: JoinSet<Result<T>>,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new(context: &'static str, mode: FailureMode) -> Self {
        Self {
            mode,
            context,
            tasks: JoinSet::new(),
        }
    }

    pub fn fail_fast(context: &'static str) -> Self {
        Self::new(context, FailureMode::FailFast)
    }

    pub fn collect(context: &'static str) -> Self {
        Self::new(context, FailureMode::Collect)
    }

    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.tasks.spawn(fut);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the group. Results come back in completion order.
    pub async fn wait(mut self) -> Result<Vec<T>> {
        let mut values = Vec::with_capacity(self.tasks.len());
        let mut errors = Vec::new();

        let context = self.context;
        while let Some(joined) = self.tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(panic_to_error(context, e)));
            match outcome {
                Ok(v) => values.push(v),
                Err(e) if self.mode == FailureMode::FailFast => {
                    self.tasks.abort_all();
                    return Err(e);
                }
                Err(e) => errors.push(e),
            }
        }

        ControllerError::from_many(errors)?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn collect_runs_everything_and_aggregates() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::collect("test");
        for i in 0..5u32 {
            let done = done.clone();
            group.spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
                if i % 2 == 0 {
                    Err(ControllerError::Internal(format!("task {}", i)))
                } else {
                    Ok(i)
                }
            });
        }

        match group.wait().await {
            Err(ControllerError::Multiple(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected aggregated errors, got {:?}", other),
        }
        assert_eq!(done.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn fail_fast_aborts_siblings() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::fail_fast("test");

        group.spawn(async { Err::<(), _>(ControllerError::Internal("boom".into())) });
        for _ in 0..3 {
            let finished = finished.clone();
            group.spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let err = group.wait().await.unwrap_err();
        assert!(matches!(err, ControllerError::Internal(_)));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_task_is_reported_as_error() {
        let mut group: TaskGroup<()> = TaskGroup::collect("fanout");
        group.spawn(async {
            if true {
                panic!("bad message");
            }
            Ok(())
        });
        group.spawn(async { Ok(()) });

        let err = group.wait().await.unwrap_err();
        match err {
            ControllerError::Panic { context, message } => {
                assert_eq!(context, "fanout");
                assert_eq!(message, "bad message");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
