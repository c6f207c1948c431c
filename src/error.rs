//! Error kinds surfaced by the cache layer.

use std::path::PathBuf;

use thiserror::Error;

/// Errors crossing the cache API boundary.
///
/// Bridge-level operations never surface errors through `Result` — they return
/// compound [`BridgeResult`](crate::bridge::BridgeResult) values instead. Everything
/// above the bridge (loader, registry, mediator) propagates one of these.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Cache root missing or unwritable, unknown filesystem type, bad limits.
    #[error("configuration error: {0}")]
    Config(String),

    /// The remote filesystem could not be dialed after retries.
    #[error("filesystem \"{0}\" is not reachable")]
    NotReachable(String),

    /// An upstream operation exceeded its budget.
    #[error("remote operation timed out: {0}")]
    Timeout(String),

    /// The upstream filesystem reported an I/O failure.
    #[error("remote i/o failure: {0}")]
    RemoteIo(String),

    /// Admission failed and the caller opted out of over-commit.
    #[error("cache capacity exceeded while admitting {}", .0.display())]
    CapacityExceeded(PathBuf),

    /// Operation on a closed or released handle.
    #[error("operation on a closed or released file handle")]
    InvalidHandle,

    /// The caller asked to abort a wait.
    #[error("wait cancelled by caller")]
    Cancelled,

    /// Local filesystem failure inside the cache working area.
    #[error("local cache i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Collapse an error into the message the loader republishes to waiters.
    #[must_use]
    pub fn republish_message(&self) -> String {
        self.to_string()
    }
}
