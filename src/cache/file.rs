//! The unit of cache residency.
//!
//! A [`ManagedFile`] ties a remote origin to a local path and carries the
//! state machine every other cache component coordinates through. State
//! transitions are published on a watch channel, which gives waiters a
//! deadline-capable subscription and gives readers release/acquire ordering
//! against the bytes a producer wrote before flipping to `Ready`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::CacheError;
use crate::fs::FilesystemDescriptor;

/// Lifecycle state of a managed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Inserted into the index, producer not yet elected.
    New,
    /// A producer is transferring the remote bytes.
    Downloading,
    /// Local bytes are complete and readable.
    Ready,
    /// Selected for eviction; serves existing readers, physical deletion is
    /// deferred until the pin count reaches zero.
    Evicting,
    /// The producer failed; retry is gated by a cooldown deadline.
    Failed,
    /// Unlinked from the index; terminal.
    Deleted,
}

/// How a file came to exist in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationNature {
    /// Materialized from a remote object.
    Physical,
    /// Produced locally by a CREATE-TABLE-AS-SELECT writer; uploaded to its
    /// registered remote sink on close.
    CreateFromSelect,
}

/// Remote identity of a cacheable artifact (the fingerprint, minus the local
/// root it is materialized under).
#[derive(Debug, Clone)]
pub struct RemoteOrigin {
    pub descriptor: FilesystemDescriptor,
    pub remote_path: String,
    /// Optional transform command; participates in identity.
    pub transform: Option<String>,
}

#[derive(Debug)]
struct FailureInfo {
    message: String,
    retry_after: Instant,
}

/// A file under cache management.
#[derive(Debug)]
pub struct ManagedFile {
    local_path: PathBuf,
    origin: RemoteOrigin,
    nature: CreationNature,

    /// Size in bytes; only meaningful in states >= Ready.
    size: AtomicU64,
    /// Live scan handles referencing the file. Non-zero pins the file.
    pins: AtomicU32,
    /// The remote side is believed to have changed; next open re-downloads.
    dirty: AtomicBool,
    /// Monotonic access counter value of the last touch; drives eviction
    /// order. Ticks are totally ordered (one process-wide counter), never
    /// wall-clock.
    last_access: AtomicU64,
    /// Callers currently blocked on a state transition.
    waiters: AtomicU32,

    state: watch::Sender<FileState>,
    failure: Mutex<Option<FailureInfo>>,
}

impl ManagedFile {
    #[must_use]
    pub fn new(local_path: PathBuf, origin: RemoteOrigin, nature: CreationNature) -> Self {
        let (state, _) = watch::channel(FileState::New);
        Self {
            local_path,
            origin,
            nature,
            size: AtomicU64::new(0),
            pins: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            last_access: AtomicU64::new(0),
            waiters: AtomicU32::new(0),
            state,
            failure: Mutex::new(None),
        }
    }

    /// A file re-admitted from disk at startup: already `Ready` with a known
    /// size.
    #[must_use]
    pub fn restored(local_path: PathBuf, origin: RemoteOrigin, size: u64) -> Self {
        let file = Self::new(local_path, origin, CreationNature::Physical);
        file.size.store(size, Ordering::Relaxed);
        let _ = file.state.send_replace(FileState::Ready);
        file
    }

    #[must_use]
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    #[must_use]
    pub fn origin(&self) -> &RemoteOrigin {
        &self.origin
    }

    #[must_use]
    pub fn nature(&self) -> CreationNature {
        self.nature
    }

    #[must_use]
    pub fn state(&self) -> FileState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_access_tick(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Record an access at `tick`.
    pub fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    #[must_use]
    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    /// Pin the file against physical deletion for the guard's lifetime.
    #[must_use]
    pub fn pin(self: &Arc<Self>) -> PinGuard {
        self.pins.fetch_add(1, Ordering::AcqRel);
        PinGuard {
            file: Arc::clone(self),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn waiter_count(&self) -> u32 {
        self.waiters.load(Ordering::Acquire)
    }

    /// Elect this caller as the producer: `New -> Downloading`. Exactly one
    /// concurrent caller wins.
    pub fn try_claim_producer(&self) -> bool {
        let mut claimed = false;
        self.state.send_if_modified(|state| {
            if *state == FileState::New {
                *state = FileState::Downloading;
                claimed = true;
                true
            } else {
                false
            }
        });
        claimed
    }

    /// Producer success: record the final size and publish `Ready`. The
    /// `send_replace` is the release edge readers acquire through.
    pub fn complete_ready(&self, size: u64) {
        self.size.store(size, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        if let Ok(mut failure) = self.failure.lock() {
            *failure = None;
        }
        let _ = self.state.send_replace(FileState::Ready);
    }

    /// Producer failure: publish `Failed` with a retry cooldown; all waiters
    /// wake and observe the message.
    pub fn mark_failed(&self, message: impl Into<String>, cooldown: Duration) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(FailureInfo {
                message: message.into(),
                retry_after: Instant::now() + cooldown,
            });
        }
        let _ = self.state.send_replace(FileState::Failed);
    }

    /// The message of the last failure, if the file is in `Failed`.
    #[must_use]
    pub fn failure_message(&self) -> Option<String> {
        self.failure
            .lock()
            .ok()
            .and_then(|f| f.as_ref().map(|i| i.message.clone()))
    }

    /// Whether the failure cooldown has elapsed.
    #[must_use]
    pub fn failure_expired(&self) -> bool {
        self.failure
            .lock()
            .ok()
            .and_then(|f| f.as_ref().map(|i| Instant::now() >= i.retry_after))
            .unwrap_or(true)
    }

    /// `Failed -> New`, permitted only after the cooldown. The winning caller
    /// proceeds to claim producership.
    pub fn try_reset_failed(&self) -> bool {
        if !self.failure_expired() {
            return false;
        }
        let mut reset = false;
        self.state.send_if_modified(|state| {
            if *state == FileState::Failed {
                *state = FileState::New;
                reset = true;
                true
            } else {
                false
            }
        });
        reset
    }

    /// `Ready -> New` for a dirty file about to be re-downloaded. Fails if
    /// the file is pinned (a reader still holds the old bytes).
    pub fn try_reset_for_refresh(&self) -> bool {
        if self.is_pinned() {
            return false;
        }
        let mut reset = false;
        self.state.send_if_modified(|state| {
            if *state == FileState::Ready {
                *state = FileState::New;
                reset = true;
                true
            } else {
                false
            }
        });
        reset
    }

    /// `Ready -> Evicting`. Returns false if the file was not `Ready`.
    pub fn mark_evicting(&self) -> bool {
        let mut marked = false;
        self.state.send_if_modified(|state| {
            if *state == FileState::Ready {
                *state = FileState::Evicting;
                marked = true;
                true
            } else {
                false
            }
        });
        marked
    }

    /// Terminal transition.
    pub fn mark_deleted(&self) {
        let _ = self.state.send_replace(FileState::Deleted);
    }

    /// Block until the file leaves `New`/`Downloading`, with a deadline.
    ///
    /// Cancellation-safe: dropping the returned future observes state without
    /// mutating it, so the producer keeps running for the remaining waiters.
    pub async fn await_settled(&self, deadline: Duration) -> Result<FileState, CacheError> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let _guard = WaiterGuard(&self.waiters);

        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let current = *rx.borrow_and_update();
                if !matches!(current, FileState::New | FileState::Downloading) {
                    return Ok(current);
                }
                if rx.changed().await.is_err() {
                    // Sender dropped: the file was torn down under us.
                    return Ok(FileState::Deleted);
                }
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(settled) => settled,
            Err(_elapsed) => Err(CacheError::Timeout(format!(
                "download of {} did not settle within {deadline:?}",
                self.local_path.display()
            ))),
        }
    }
}

impl ManagedFile {
    /// Block until the file reaches `Deleted`, with a deadline. Used when a
    /// caller needs an `Evicting` slot to clear before re-creating the file.
    pub async fn await_deleted(&self, deadline: Duration) -> Result<(), CacheError> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == FileState::Deleted {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(deadline, wait).await.map_err(|_| {
            CacheError::Timeout(format!(
                "eviction of {} did not complete within {deadline:?}",
                self.local_path.display()
            ))
        })
    }
}

struct WaiterGuard<'a>(&'a AtomicU32);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Drop guard keeping a [`ManagedFile`] pinned.
pub struct PinGuard {
    file: Arc<ManagedFile>,
}

impl PinGuard {
    #[must_use]
    pub fn file(&self) -> &Arc<ManagedFile> {
        &self.file
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.file.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsType;

    fn origin() -> RemoteOrigin {
        RemoteOrigin {
            descriptor: FilesystemDescriptor::new(FsType::Hdfs, "nn1", 8020),
            remote_path: "/a/b".to_owned(),
            transform: None,
        }
    }

    fn file() -> Arc<ManagedFile> {
        Arc::new(ManagedFile::new(
            PathBuf::from("/cache/hdfs/nn1_8020/a/b"),
            origin(),
            CreationNature::Physical,
        ))
    }

    #[test]
    fn exactly_one_producer_wins() {
        let f = file();
        assert!(f.try_claim_producer());
        assert!(!f.try_claim_producer(), "second claim must lose");
        assert_eq!(f.state(), FileState::Downloading);
    }

    #[tokio::test]
    async fn waiters_wake_on_ready() {
        let f = file();
        assert!(f.try_claim_producer());

        let waiter = {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.await_settled(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        f.complete_ready(123);
        let settled = waiter.await.unwrap().unwrap();
        assert_eq!(settled, FileState::Ready);
        assert_eq!(f.size(), 123);
    }

    #[tokio::test]
    async fn waiters_wake_on_failure_and_see_the_message() {
        let f = file();
        assert!(f.try_claim_producer());

        let waiter = {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.await_settled(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        f.mark_failed("namenode exploded", Duration::from_secs(60));
        let settled = waiter.await.unwrap().unwrap();
        assert_eq!(settled, FileState::Failed);
        assert_eq!(f.failure_message().as_deref(), Some("namenode exploded"));
        assert!(!f.failure_expired(), "cooldown should still be running");
        assert!(!f.try_reset_failed(), "reset must be gated by the cooldown");
    }

    #[tokio::test]
    async fn failed_reset_after_cooldown() {
        let f = file();
        assert!(f.try_claim_producer());
        f.mark_failed("transient", Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.try_reset_failed());
        assert_eq!(f.state(), FileState::New);
    }

    #[tokio::test]
    async fn await_settled_times_out() {
        let f = file();
        assert!(f.try_claim_producer());
        let err = f.await_settled(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));
    }

    #[test]
    fn pin_guard_pins_and_unpins() {
        let f = file();
        assert!(!f.is_pinned());
        let guard = f.pin();
        assert!(f.is_pinned());
        drop(guard);
        assert!(!f.is_pinned());
    }

    #[test]
    fn evicting_requires_ready() {
        let f = file();
        assert!(!f.mark_evicting(), "New file cannot transition to Evicting");
        assert!(f.try_claim_producer());
        f.complete_ready(10);
        assert!(f.mark_evicting());
        assert_eq!(f.state(), FileState::Evicting);
    }

    #[test]
    fn refresh_reset_respects_pins() {
        let f = file();
        assert!(f.try_claim_producer());
        f.complete_ready(10);
        f.mark_dirty();

        let guard = f.pin();
        assert!(!f.try_reset_for_refresh(), "pinned file must not reset");
        drop(guard);
        assert!(f.try_reset_for_refresh());
    }
}
