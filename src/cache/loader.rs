//! Single-flight download coordination.
//!
//! For every cache miss exactly one caller — the producer — performs the
//! transfer; everyone else parks on the file's state channel until the
//! producer publishes a terminal state. Downloads land in a `.part` sibling
//! and are renamed into place on success, so a failed transfer never leaves a
//! partial file under the final name.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info, warn};

use crate::bridge::FsBridge;
use crate::cache::engine::{CacheEngine, PARTIAL_SUFFIX};
use crate::cache::file::{CreationNature, FileState, ManagedFile, RemoteOrigin};
use crate::error::CacheError;
use crate::fs::{OpenFlags, RemoteFile};
use crate::pool::{ConnectionPool, Lease};

/// Copy buffer for remote-to-local transfers.
const TRANSFER_BUFFER_SIZE: usize = 1 << 20;

/// A registered CREATE-FROM-SELECT pair: the remote sink a locally written
/// file must be uploaded into when its handle closes.
pub struct CfsPair {
    pub remote: Box<dyn RemoteFile>,
    pub lease: Lease,
}

/// The `.part` sibling a producer writes into.
pub(crate) fn partial_path(local: &Path) -> PathBuf {
    let mut name = local
        .file_name()
        .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
    name.push_str(PARTIAL_SUFFIX);
    local.with_file_name(name)
}

/// Ensures at-most-one producer per fingerprint.
pub struct SingleFlightLoader {
    engine: Arc<CacheEngine>,
    /// Cooldown stamped onto `Failed` files.
    cooldown: Duration,
    /// How long a waiter may park on a downloading file before giving up.
    wait_budget: Duration,
    /// CREATE-FROM-SELECT side table, keyed by local handle id. Guarded by
    /// its own mutex, deliberately decoupled from the cache index lock.
    cfs: Mutex<FxHashMap<u64, CfsPair>>,
}

impl SingleFlightLoader {
    #[must_use]
    pub fn new(engine: Arc<CacheEngine>, cooldown: Duration, wait_budget: Duration) -> Self {
        Self {
            engine,
            cooldown,
            wait_budget,
            cfs: Mutex::new(FxHashMap::default()),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    /// Resolve `origin` to a `Ready` managed file, downloading it if needed.
    ///
    /// Concurrent calls for the same fingerprint coalesce: one producer runs,
    /// the rest wait on the state channel. A `Failed` file inside its
    /// cooldown surfaces the producer's error without a new download; after
    /// the cooldown the next caller is elected producer again.
    pub async fn get_or_fetch(
        &self,
        origin: &RemoteOrigin,
        local: &Path,
        pool: &ConnectionPool,
        bridge: &FsBridge,
    ) -> Result<Arc<ManagedFile>, CacheError> {
        loop {
            let (file, _admitted) =
                self.engine
                    .add(local.to_path_buf(), origin.clone(), CreationNature::Physical);

            // A dirty file whose readers have drained is reset and re-fetched.
            if file.state() == FileState::Ready
                && file.is_dirty()
                && file.try_reset_for_refresh()
            {
                info!(path = %local.display(), "remote side changed, re-downloading");
                self.engine.unaccount_for_refresh(&file);
            }

            match file.state() {
                FileState::Ready => return Ok(file),

                FileState::New => {
                    if file.try_claim_producer() {
                        self.produce(&file, pool, bridge).await?;
                        return Ok(file);
                    }
                    // Lost the election; park with everyone else.
                    self.join_download(&file).await?;
                }

                FileState::Downloading => {
                    self.join_download(&file).await?;
                }

                FileState::Failed => {
                    if file.try_reset_failed() {
                        // Cooldown over and we won the reset; loop back into
                        // the `New` arm to claim producership.
                        continue;
                    }
                    if file.state() == FileState::Failed {
                        return Err(CacheError::RemoteIo(file.failure_message().unwrap_or_else(
                            || "download failed; retry is cooling down".to_owned(),
                        )));
                    }
                    // Someone else moved the file on; re-evaluate.
                }

                FileState::Evicting => {
                    // The previous incarnation is on its way out; wait for the
                    // slot to clear, then retry with a fresh file.
                    file.await_deleted(self.wait_budget).await?;
                }

                FileState::Deleted => {
                    // Husk in the index; `add` replaces it on the next pass.
                }
            }
        }
    }

    /// Wait for an in-flight download and interpret its terminal state.
    /// Returns `Ok(())` when the caller should re-run the lookup loop (the
    /// `Ready` fast path is taken there).
    async fn join_download(&self, file: &Arc<ManagedFile>) -> Result<(), CacheError> {
        match file.await_settled(self.wait_budget).await? {
            FileState::Ready | FileState::Deleted => Ok(()),
            FileState::Failed => Err(CacheError::RemoteIo(
                file.failure_message()
                    .unwrap_or_else(|| "download failed".to_owned()),
            )),
            // Evicting or a racing reset; loop and re-evaluate.
            _ => Ok(()),
        }
    }

    /// Run the transfer as the elected producer.
    async fn produce(
        &self,
        file: &Arc<ManagedFile>,
        pool: &ConnectionPool,
        bridge: &FsBridge,
    ) -> Result<(), CacheError> {
        let mut guard = ProducerGuard {
            engine: Arc::clone(&self.engine),
            file: Arc::clone(file),
            cooldown: self.cooldown,
            armed: true,
        };

        let result = self.transfer(file, pool, bridge).await;
        guard.armed = false;
        drop(guard);

        match result {
            Ok(size) => {
                info!(
                    path = %file.local_path().display(),
                    size,
                    "download complete"
                );
                self.engine.admit_ready(file, size, true).await
            }
            Err(e) => {
                warn!(
                    path = %file.local_path().display(),
                    error = %e,
                    "download failed"
                );
                let _ = tokio::fs::remove_file(partial_path(file.local_path())).await;
                file.mark_failed(e.republish_message(), self.cooldown);
                Err(e)
            }
        }
    }

    /// The transfer itself: remote stream -> `.part` sibling -> rename.
    async fn transfer(
        &self,
        file: &Arc<ManagedFile>,
        pool: &ConnectionPool,
        bridge: &FsBridge,
    ) -> Result<u64, CacheError> {
        let origin = file.origin();
        let mut lease = pool.acquire(bridge).await?;

        let mut stream = match lease
            .filesystem()
            .open(&origin.remote_path, OpenFlags::READ, 0, 0, 0)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                lease.poison();
                return Err(CacheError::RemoteIo(e.to_string()));
            }
        };

        let local = file.local_path();
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = partial_path(local);
        let mut sink = tokio::fs::File::create(&tmp).await?;

        let mut buffer = vec![0u8; TRANSFER_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = match stream.read(&mut buffer).await {
                Ok(n) => n,
                Err(e) => {
                    lease.poison();
                    let _ = stream.close().await;
                    return Err(CacheError::RemoteIo(e.to_string()));
                }
            };
            if n == 0 {
                break;
            }
            sink.write_all(&buffer[..n]).await?;
            total += n as u64;
        }
        let _ = stream.close().await;

        sink.flush().await?;
        sink.sync_all().await?;
        drop(sink);
        // The rename is the commit point: readers never observe a partial
        // file under the final name.
        tokio::fs::rename(&tmp, local).await?;
        debug!(path = %local.display(), bytes = total, "transfer committed");
        Ok(total)
    }

    // -- CREATE-FROM-SELECT side table ---------------------------------------

    /// Associate the remote sink of a CREATE-TABLE-AS-SELECT output with the
    /// local handle writing it.
    pub fn register_cfs(&self, handle_id: u64, pair: CfsPair) {
        let mut table = match self.cfs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.insert(handle_id, pair);
    }

    /// Detach and return the pair registered for `handle_id`. The second call
    /// for the same handle returns `None`.
    pub fn unregister_cfs(&self, handle_id: u64) -> Option<CfsPair> {
        let mut table = match self.cfs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.remove(&handle_id)
    }
}

/// Drop guard for a cancelled producer.
///
/// If the producing future is dropped before it reaches a terminal
/// transition, the file must not stay `Downloading` forever: with no waiter
/// attached it is deleted outright, otherwise the waiters are woken with a
/// failure they can retry after the cooldown.
struct ProducerGuard {
    engine: Arc<CacheEngine>,
    file: Arc<ManagedFile>,
    cooldown: Duration,
    armed: bool,
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        if !self.armed || self.file.state() != FileState::Downloading {
            return;
        }
        if self.file.waiter_count() == 0 {
            self.file.mark_deleted();
            let engine = Arc::clone(&self.engine);
            let file = Arc::clone(&self.file);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = tokio::fs::remove_file(partial_path(file.local_path())).await;
                    engine.remove(&file.local_path().to_path_buf(), false).await;
                });
            }
        } else {
            self.file
                .mark_failed("producer cancelled before completion", self.cooldown);
        }
    }
}
