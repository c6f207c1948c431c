//! Timeout/retry-enforcing wrapper around remote filesystem primitives.
//!
//! Every remote call is synthesized into a work unit and run through the
//! [`TaskExecutor`](crate::exec::TaskExecutor); a hung namenode costs the
//! caller at most `retries * (timeout + backoff)` instead of a stuck query
//! thread. Results are compound values — the bridge never returns `Err`
//! across its API boundary, and the status field is authoritative: callers
//! must not interpret `value` for non-OK statuses.
//!
//! Retry schedule: `fs_retries` attempts, each bounded by `fs_timeout_base`;
//! the delay before retry `k` is `2 * k * fs_backoff_base` with `k` counted
//! from zero (arithmetic-multiple backoff — the first retry fires without a
//! delay). Retries happen only on timeout or failure; a successful negative
//! answer (e.g. `exists == false`) is terminal.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error};

use crate::config::FsTuning;
use crate::error::CacheError;
use crate::exec::{Outcome, TaskExecutor};
use crate::fs::{
    BlockLocation, DescriptorKey, FilesystemDescriptor, ObjectStatus, RemoteConnector,
    RemoteFilesystem,
};
use crate::meta::{Existence, MetaCache};

/// Terminal status of a bridged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Ok,
    Timeout,
    Failure,
    NotRun,
}

/// Compound result of a bridged operation.
#[derive(Debug)]
pub struct BridgeResult<T> {
    pub status: BridgeStatus,
    pub value: Option<T>,
    pub error: Option<String>,
}

impl<T> BridgeResult<T> {
    fn ok(value: T) -> Self {
        Self {
            status: BridgeStatus::Ok,
            value: Some(value),
            error: None,
        }
    }

    fn not_run() -> Self {
        Self {
            status: BridgeStatus::NotRun,
            value: None,
            error: None,
        }
    }

    /// Convert into a `Result`, mapping non-OK statuses onto the cache error
    /// kinds the upper layers surface.
    pub fn into_result(self) -> Result<T, CacheError> {
        match self.status {
            BridgeStatus::Ok => self.value.ok_or_else(|| {
                CacheError::RemoteIo("bridge reported OK without a value".to_owned())
            }),
            BridgeStatus::Timeout => Err(CacheError::Timeout(
                self.error.unwrap_or_else(|| "remote call timed out".to_owned()),
            )),
            BridgeStatus::Failure | BridgeStatus::NotRun => Err(CacheError::RemoteIo(
                self.error.unwrap_or_else(|| "remote call failed".to_owned()),
            )),
        }
    }
}

/// Retry/timeout wrapper bound to one descriptor's tuning.
pub struct FsBridge {
    exec: Arc<TaskExecutor>,
    meta: Arc<MetaCache>,
    tuning: FsTuning,
}

impl std::fmt::Debug for FsBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsBridge")
            .field("tuning", &self.tuning)
            .finish_non_exhaustive()
    }
}

impl FsBridge {
    #[must_use]
    pub fn new(exec: Arc<TaskExecutor>, meta: Arc<MetaCache>, tuning: FsTuning) -> Self {
        Self { exec, meta, tuning }
    }

    /// Shared metadata cache this bridge records outcomes into.
    #[must_use]
    pub fn meta(&self) -> &Arc<MetaCache> {
        &self.meta
    }

    /// Run `make_work` under the retry schedule. `make_work` is invoked once
    /// per attempt so each attempt gets a fresh future.
    pub async fn run_with_retry<T, F, Fut>(&self, op: &'static str, make_work: F) -> BridgeResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::io::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut result = BridgeResult::not_run();
        let mut retries = self.tuning.fs_retries;
        let mut countdown: u32 = 0;

        loop {
            match self.exec.run(make_work(), self.tuning.timeout()).await {
                Outcome::Ok(value) => {
                    result = BridgeResult::ok(value);
                    break;
                }
                Outcome::Timeout => {
                    error!(op, timeout = ?self.tuning.timeout(), "remote call timed out");
                    result = BridgeResult {
                        status: BridgeStatus::Timeout,
                        value: None,
                        error: Some(format!("{op} exceeded {:?}", self.tuning.timeout())),
                    };
                }
                Outcome::Failure(e) => {
                    error!(op, error = ?e, "remote call failed");
                    result = BridgeResult {
                        status: BridgeStatus::Failure,
                        value: None,
                        error: Some(e.to_string()),
                    };
                }
            }

            retries = retries.saturating_sub(1);
            if retries == 0 {
                break;
            }
            // First retry goes out immediately (countdown starts at zero);
            // later ones back off by arithmetic multiples of the base delay.
            let delay = self.tuning.backoff_base() * (2 * countdown);
            countdown += 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            debug!(op, attempt = countdown, "retrying remote call");
        }

        result
    }

    /// `exists`, cached. With `force` the cache is bypassed (but still
    /// refreshed by the outcome).
    pub async fn exists(
        &self,
        fs: &Arc<dyn RemoteFilesystem>,
        key: &DescriptorKey,
        path: &str,
        force: bool,
    ) -> BridgeResult<bool> {
        if !force {
            match self.meta.existence(key, path) {
                Existence::Exists => return BridgeResult::ok(true),
                Existence::DoesNotExist => return BridgeResult::ok(false),
                Existence::Unknown => {}
            }
        }

        let result = {
            let fs = Arc::clone(fs);
            let path = path.to_owned();
            self.run_with_retry("FileSystem.exists", move || {
                let fs = Arc::clone(&fs);
                let path = path.clone();
                async move { fs.exists(&path).await }
            })
            .await
        };

        match (result.status, result.value) {
            (BridgeStatus::Ok, Some(exists)) => {
                self.meta.record_existence(key, path, exists);
                BridgeResult::ok(exists)
            }
            (status, value) => {
                self.meta.record_failure(key, path);
                BridgeResult {
                    status,
                    value,
                    error: result.error,
                }
            }
        }
    }

    /// `listStatus`, cached whole per directory.
    pub async fn list_status(
        &self,
        fs: &Arc<dyn RemoteFilesystem>,
        key: &DescriptorKey,
        path: &str,
        force: bool,
    ) -> BridgeResult<Vec<ObjectStatus>> {
        if !force && let Some(listing) = self.meta.dir_listing(key, path) {
            return BridgeResult::ok(listing);
        }

        let result = {
            let fs = Arc::clone(fs);
            let path = path.to_owned();
            self.run_with_retry("FileSystem.listStatus", move || {
                let fs = Arc::clone(&fs);
                let path = path.clone();
                async move { fs.list_status(&path).await }
            })
            .await
        };

        match result.status {
            BridgeStatus::Ok => {
                if let Some(listing) = &result.value {
                    self.meta.record_listing(key, path, listing);
                }
                result
            }
            _ => {
                self.meta.record_failure(key, path);
                result
            }
        }
    }

    /// `getFileStatus`, served from the parent directory's cached children
    /// when possible.
    pub async fn file_status(
        &self,
        fs: &Arc<dyn RemoteFilesystem>,
        key: &DescriptorKey,
        path: &str,
        force: bool,
    ) -> BridgeResult<ObjectStatus> {
        if !force && let Some(status) = self.meta.file_status(key, path) {
            return BridgeResult::ok(status);
        }

        let result = {
            let fs = Arc::clone(fs);
            let path = path.to_owned();
            self.run_with_retry("FileSystem.getFileStatus", move || {
                let fs = Arc::clone(&fs);
                let path = path.clone();
                async move { fs.file_status(&path).await }
            })
            .await
        };

        match result.status {
            BridgeStatus::Ok => {
                if let Some(status) = &result.value {
                    self.meta.record_status(key, path, status);
                }
                result
            }
            _ => {
                self.meta.record_failure(key, path);
                result
            }
        }
    }

    /// `getFileBlockLocations` (with disk ids where the backend reports
    /// them). Read-through: block placement shifts under rebalancing, so the
    /// metadata cache is not consulted.
    pub async fn block_locations(
        &self,
        fs: &Arc<dyn RemoteFilesystem>,
        path: &str,
        start: u64,
        len: u64,
    ) -> BridgeResult<Vec<BlockLocation>> {
        let fs = Arc::clone(fs);
        let path = path.to_owned();
        self.run_with_retry("FileSystem.getFileBlockLocations", move || {
            let fs = Arc::clone(&fs);
            let path = path.clone();
            async move { fs.block_locations(&path, start, len).await }
        })
        .await
    }

    /// Dial a descriptor into a live session (`Path.getFileSystem`), caching
    /// the session under `(config key, path)`.
    pub async fn connect(
        &self,
        connector: &Arc<dyn RemoteConnector>,
        descriptor: &FilesystemDescriptor,
        path: &str,
    ) -> BridgeResult<Arc<dyn RemoteFilesystem>> {
        let config_key = descriptor.uri();
        if let Some(session) = self.meta.filesystem(&config_key, path) {
            return BridgeResult::ok(session);
        }

        let result = {
            let connector = Arc::clone(connector);
            let descriptor = descriptor.clone();
            self.run_with_retry("Path.getFileSystem", move || {
                let connector = Arc::clone(&connector);
                let descriptor = descriptor.clone();
                async move { connector.dial(&descriptor).await }
            })
            .await
        };

        if let (BridgeStatus::Ok, Some(session)) = (result.status, &result.value) {
            self.meta.add_filesystem(&config_key, path, Arc::clone(session));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    fn bridge(timeout_ms: u64, retries: u32, backoff_ms: u64) -> FsBridge {
        FsBridge::new(
            Arc::new(TaskExecutor::new(8)),
            Arc::new(MetaCache::new()),
            FsTuning {
                fs_timeout_base_ms: timeout_ms,
                fs_retries: retries,
                fs_backoff_base_ms: backoff_ms,
            },
        )
    }

    #[tokio::test]
    async fn ok_on_first_attempt() {
        let b = bridge(1_000, 5, 10);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result = b
            .run_with_retry("test.op", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, io::Error>(7) }
            })
            .await;
        assert_eq!(result.status, BridgeStatus::Ok);
        assert_eq!(result.value, Some(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_only_up_to_the_budget() {
        let b = bridge(1_000, 3, 0);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result = b
            .run_with_retry("test.op", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(io::Error::other("nope")) }
            })
            .await;
        assert_eq!(result.status, BridgeStatus::Failure);
        assert_eq!(attempts.load(Ordering::SeqCst), 3, "three attempts for retries=3");
    }

    #[tokio::test]
    async fn recovers_midway() {
        let b = bridge(1_000, 5, 0);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result = b
            .run_with_retry("test.op", move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(io::Error::other("transient"))
                    } else {
                        Ok(99)
                    }
                }
            })
            .await;
        assert_eq!(result.status, BridgeStatus::Ok);
        assert_eq!(result.value, Some(99));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_is_terminal_within_the_budget() {
        // timeout=50ms, retries=2, backoff=10ms:
        // attempts cost 2 * 50ms, backoff before retry 1 is 0 (countdown
        // starts at zero), so the whole call lands well under a second.
        let b = bridge(50, 2, 10);
        let start = Instant::now();
        let result = b
            .run_with_retry("test.op", || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, io::Error>(())
            })
            .await;
        assert_eq!(result.status, BridgeStatus::Timeout);
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "bridge must bound a hung remote call"
        );
    }
}
