//! Interruptible task executor.
//!
//! Remote filesystem clients can hang indefinitely on a dead node. Every
//! bridged call is therefore spawned as its own task and raced against a
//! deadline; on timeout the task is aborted, which tears it down at its next
//! suspension point and releases whatever resource (socket, client handle) it
//! was holding within a bounded extra delay. A semaphore bounds the worker
//! fan-out so a flood of stat calls cannot starve the runtime.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::warn;

/// Result of one executed unit of work.
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    /// The deadline elapsed; the work was aborted.
    Timeout,
    /// The work itself returned an error (or panicked).
    Failure(io::Error),
}

impl<T> Outcome<T> {
    /// Whether this outcome should be retried under the bridge's schedule.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Ok(_))
    }
}

/// Deadline-enforcing executor shared by all bridges of one registry.
pub struct TaskExecutor {
    permits: Arc<Semaphore>,
}

impl TaskExecutor {
    /// Executor running at most `max_workers` units of work concurrently.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    /// Run `work` with an absolute deadline of `timeout` from now.
    ///
    /// The work future is spawned so that a timeout can forcibly abort it
    /// rather than merely dropping the result; the caller never observes a
    /// partially-executed success.
    pub async fn run<T, F>(&self, work: F, timeout: Duration) -> Outcome<T>
    where
        F: Future<Output = io::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            // The semaphore is never closed; this arm exists to avoid an
            // unwrap in non-test code.
            return Outcome::Failure(io::Error::other("executor is shut down"));
        };

        let mut handle = tokio::spawn(work);
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(value))) => Outcome::Ok(value),
            Ok(Ok(Err(e))) => Outcome::Failure(e),
            Ok(Err(join_err)) => {
                warn!(error = ?join_err, "executor work unit panicked or was aborted");
                Outcome::Failure(io::Error::other(join_err.to_string()))
            }
            Err(_elapsed) => {
                handle.abort();
                Outcome::Timeout
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn completes_fast_work() {
        let exec = TaskExecutor::new(4);
        let outcome = exec
            .run(async { Ok::<_, io::Error>(41 + 1) }, Duration::from_secs(1))
            .await;
        assert!(matches!(outcome, Outcome::Ok(42)));
    }

    #[tokio::test]
    async fn reports_failure_verbatim() {
        let exec = TaskExecutor::new(4);
        let outcome = exec
            .run(
                async { Err::<(), _>(io::Error::other("boom")) },
                Duration::from_secs(1),
            )
            .await;
        match outcome {
            Outcome::Failure(e) => assert_eq!(e.to_string(), "boom"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn times_out_and_aborts_hung_work() {
        let exec = TaskExecutor::new(4);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let outcome = exec
            .run(
                async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_millis(20),
            )
            .await;

        assert!(matches!(outcome, Outcome::Timeout));
        // Give the aborted task a moment; it must never complete.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!finished.load(Ordering::SeqCst), "aborted work must not run to completion");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fan_out_is_bounded() {
        let exec = Arc::new(TaskExecutor::new(1));
        let first = Arc::clone(&exec);

        // Occupy the single permit for a while.
        let blocker = tokio::spawn(async move {
            first
                .run(
                    async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(())
                    },
                    Duration::from_secs(1),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let start = std::time::Instant::now();
        let outcome = exec
            .run(async { Ok::<_, io::Error>(()) }, Duration::from_secs(1))
            .await;
        assert!(matches!(outcome, Outcome::Ok(())));
        assert!(
            start.elapsed() >= Duration::from_millis(50),
            "second unit should have waited for the permit"
        );
        blocker.await.unwrap();
    }
}
