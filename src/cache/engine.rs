//! Size-bounded admission/eviction over managed files.
//!
//! One mutex guards the index — a [`LinkedHashMap`] in access order (front is
//! least recently used) plus the byte total. Lookups touch; admission of a
//! `Ready` transition reconciles accounting and makes room synchronously;
//! a periodic background sweep finishes deferred evictions. The map is only
//! ever locked for bounded map surgery, never across an await.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hashlink::LinkedHashMap;
use tracing::{debug, info, warn};

use crate::cache::file::{CreationNature, FileState, ManagedFile, RemoteOrigin};
use crate::error::CacheError;
use crate::fs::FilesystemDescriptor;
use crate::namespace;

/// Marker file guarding against pointing the cache at a foreign directory.
///
/// Changing this breaks recognition of existing cache directories.
const CACHE_MARKER_FILE: &str = ".dfs_cache";

/// Suffix of in-flight download artifacts. Never admitted to the index;
/// leftovers are swept on startup.
pub(crate) const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug)]
struct Index {
    /// Access-ordered map; front is the eviction candidate.
    map: LinkedHashMap<PathBuf, Arc<ManagedFile>>,
    /// Bytes accounted to files in `Ready` (evictees leave the total when
    /// they are marked, not when the unlink lands).
    total_bytes: u64,
}

/// The cache engine: index, accounting, and eviction policy.
#[derive(Debug)]
pub struct CacheEngine {
    root: PathBuf,
    hard_limit: u64,
    index: Mutex<Index>,
    /// Monotonic access counter; drives the eviction order (never wall-clock).
    tick: AtomicU64,
    /// Set when admission had to overshoot the hard limit because the
    /// feasible eviction set was too small.
    overshoot: AtomicBool,
}

impl CacheEngine {
    /// Open (or re-open) the engine over `root`.
    ///
    /// The directory is created if missing. A non-empty directory is accepted
    /// only if it carries the cache marker from a previous run, in which case
    /// its contents are enumerated and re-admitted as `Ready` files.
    pub async fn open(root: PathBuf, hard_limit: u64) -> Result<Arc<Self>, CacheError> {
        if hard_limit == 0 {
            return Err(CacheError::Config(
                "cache size hard limit must be positive".to_owned(),
            ));
        }

        match tokio::fs::metadata(&root).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(CacheError::Config(format!(
                    "cache root {} is not a directory",
                    root.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&root).await?;
            }
            Err(e) => return Err(e.into()),
        }

        let marker = root.join(CACHE_MARKER_FILE);
        let marker_exists = tokio::fs::try_exists(&marker).await?;
        if !marker_exists {
            let mut entries = tokio::fs::read_dir(&root).await?;
            if entries.next_entry().await?.is_some() {
                return Err(CacheError::Config(format!(
                    "cache root {} contains data from another application",
                    root.display()
                )));
            }
        }
        // Creating the marker doubles as the writability probe.
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&marker)
            .await
            .map_err(|e| {
                CacheError::Config(format!("cache root {} is not writable: {e}", root.display()))
            })?;

        let engine = Arc::new(Self {
            root,
            hard_limit,
            index: Mutex::new(Index {
                map: LinkedHashMap::new(),
                total_bytes: 0,
            }),
            tick: AtomicU64::new(0),
            overshoot: AtomicBool::new(false),
        });
        engine.enumerate_existing().await?;
        Ok(engine)
    }

    /// Walk the cache root and re-admit every file whose path parses back to
    /// a remote origin. Partial downloads and stray files are dropped.
    async fn enumerate_existing(&self) -> Result<(), CacheError> {
        let mut pending = vec![self.root.clone()];
        let mut admitted = 0usize;

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.file_name().is_some_and(|n| n == CACHE_MARKER_FILE) {
                    continue;
                }
                if path
                    .extension()
                    .is_some_and(|e| e.to_string_lossy() == PARTIAL_SUFFIX.trim_start_matches('.'))
                {
                    debug!(path = %path.display(), "dropping leftover partial download");
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
                let Some(restored) = namespace::restore(&self.root, &path) else {
                    warn!(path = %path.display(), "stray file under cache root, ignoring");
                    continue;
                };
                let origin = RemoteOrigin {
                    descriptor: FilesystemDescriptor::new(
                        restored.fs_type,
                        restored.host,
                        restored.port,
                    ),
                    remote_path: restored.remote_path,
                    transform: None,
                };
                let file = Arc::new(ManagedFile::restored(path.clone(), origin, meta.len()));
                file.touch(self.next_tick());
                let mut index = self.lock_index();
                index.total_bytes += meta.len();
                index.map.insert(path, file);
                admitted += 1;
            }
        }

        if admitted > 0 {
            info!(files = admitted, "re-admitted cache contents from disk");
        }
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn hard_limit(&self) -> u64 {
        self.hard_limit
    }

    /// Bytes currently accounted to resident files.
    #[must_use]
    pub fn occupancy(&self) -> u64 {
        self.lock_index().total_bytes
    }

    /// Number of indexed files (any state).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_index().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether admission ever had to exceed the hard limit.
    #[must_use]
    pub fn over_committed(&self) -> bool {
        self.overshoot.load(Ordering::Relaxed)
    }

    fn lock_index(&self) -> MutexGuard<'_, Index> {
        match self.index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Next value of the monotonic access counter.
    pub fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// O(1) lookup with an access touch.
    #[must_use]
    pub fn find(&self, local: &Path) -> Option<Arc<ManagedFile>> {
        let mut index = self.lock_index();
        // Refresh access order the way the LRU tracker does: pull the entry
        // out and re-insert it at the back.
        let file = index.map.remove(local)?;
        index.map.insert(local.to_path_buf(), Arc::clone(&file));
        file.touch(self.next_tick());
        Some(file)
    }

    /// Insert a file in state `New` if the path is absent (or only present as
    /// a `Deleted` husk). Returns the winning file either way; the second
    /// element is `true` for the caller that inserted it.
    pub fn add(
        &self,
        local: PathBuf,
        origin: RemoteOrigin,
        nature: CreationNature,
    ) -> (Arc<ManagedFile>, bool) {
        let mut index = self.lock_index();
        if let Some(existing) = index.map.get(&local) {
            if existing.state() != FileState::Deleted {
                let existing = Arc::clone(existing);
                drop(index);
                existing.touch(self.next_tick());
                return (existing, false);
            }
            // A deleted husk may be replaced in place.
            index.map.remove(&local);
        }
        let file = Arc::new(ManagedFile::new(local.clone(), origin, nature));
        file.touch(self.next_tick());
        index.map.insert(local, Arc::clone(&file));
        (file, true)
    }

    /// Account a completed download and make room under the hard limit.
    ///
    /// Publishes `Ready` before eviction runs, so the new file is visible to
    /// readers even while older files are being turned out. If the feasible
    /// eviction set cannot free enough space and `allow_overcommit` is set,
    /// admission succeeds anyway and the overshoot is marked; otherwise the
    /// file is removed again and [`CacheError::CapacityExceeded`] is returned.
    pub async fn admit_ready(
        &self,
        file: &Arc<ManagedFile>,
        size: u64,
        allow_overcommit: bool,
    ) -> Result<(), CacheError> {
        file.complete_ready(size);

        let victims = {
            let mut index = self.lock_index();
            index.total_bytes += size;
            // Move the newly admitted file to the back so the make-room pass
            // cannot pick it as its own victim.
            if let Some(entry) = index.map.remove(file.local_path()) {
                let key = entry.local_path().to_path_buf();
                index.map.insert(key, entry);
            }
            file.touch(self.next_tick());
            self.collect_victims(&mut index, Some(file))
        };

        let over = self.occupancy() > self.hard_limit;
        if over {
            if allow_overcommit {
                self.overshoot.store(true, Ordering::Relaxed);
                warn!(
                    occupancy = self.occupancy(),
                    limit = self.hard_limit,
                    "cache overshot its hard limit; feasible eviction set was too small"
                );
            } else {
                self.discard(file).await;
                return Err(CacheError::CapacityExceeded(
                    file.local_path().to_path_buf(),
                ));
            }
        }

        for victim in victims {
            self.finish_eviction(&victim).await;
        }
        Ok(())
    }

    /// Select eviction victims in ascending access-tick order until the total
    /// fits the hard limit. Pinned files and files still downloading are
    /// skipped. Victims are marked `Evicting` and leave the accounting here;
    /// the physical unlink happens in [`finish_eviction`](Self::finish_eviction).
    fn collect_victims(
        &self,
        index: &mut Index,
        admitted: Option<&Arc<ManagedFile>>,
    ) -> Vec<Arc<ManagedFile>> {
        if index.total_bytes <= self.hard_limit {
            return Vec::new();
        }
        let mut victims = Vec::new();
        let mut freed = 0u64;
        // Front-to-back walk is ascending recency; ties cannot happen because
        // ticks come from one counter. The file whose admission triggered
        // this pass is never its own victim.
        for (_, candidate) in index.map.iter() {
            if index.total_bytes.saturating_sub(freed) <= self.hard_limit {
                break;
            }
            if candidate.state() != FileState::Ready
                || candidate.is_pinned()
                || admitted.is_some_and(|a| Arc::ptr_eq(candidate, a))
            {
                continue;
            }
            freed += candidate.size();
            victims.push(Arc::clone(candidate));
        }
        for victim in &victims {
            if victim.mark_evicting() {
                index.total_bytes = index.total_bytes.saturating_sub(victim.size());
                debug!(path = %victim.local_path().display(), "selected for eviction");
            }
        }
        victims
    }

    /// Complete an eviction: unlink once the file is unpinned, then drop the
    /// index entry. A still-pinned file stays `Evicting` and is retried by
    /// the sweep. Unlink failures are non-fatal for the same reason.
    pub async fn finish_eviction(&self, file: &Arc<ManagedFile>) {
        if file.is_pinned() {
            return;
        }
        match tokio::fs::remove_file(file.local_path()).await {
            Ok(()) => {}
            // Already gone is as good as deleted.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    path = %file.local_path().display(),
                    error = ?e,
                    "eviction unlink failed; will retry on the next sweep"
                );
                return;
            }
        }
        file.mark_deleted();
        let mut index = self.lock_index();
        // Only remove the husk if the slot still belongs to this file; a new
        // incarnation may already have taken the path.
        if index
            .map
            .get(file.local_path())
            .is_some_and(|current| Arc::ptr_eq(current, file))
        {
            index.map.remove(file.local_path());
        }
    }

    /// Drop a file that failed strict admission: unaccount, unlink, forget.
    async fn discard(&self, file: &Arc<ManagedFile>) {
        {
            let mut index = self.lock_index();
            index.total_bytes = index.total_bytes.saturating_sub(file.size());
            if index
                .map
                .get(file.local_path())
                .is_some_and(|current| Arc::ptr_eq(current, file))
            {
                index.map.remove(file.local_path());
            }
        }
        file.mark_deleted();
        let _ = tokio::fs::remove_file(file.local_path()).await;
    }

    /// Unaccount a `Ready` file that is about to be re-downloaded.
    pub fn unaccount_for_refresh(&self, file: &Arc<ManagedFile>) {
        let mut index = self.lock_index();
        index.total_bytes = index.total_bytes.saturating_sub(file.size());
    }

    /// Remove a file from the cache.
    ///
    /// With `physical` the on-disk bytes go too (deferred while pinned, per
    /// the pinning invariant); otherwise the file is only unlinked from the
    /// index and the local artifact is left behind.
    pub async fn remove(&self, local: &Path, physical: bool) -> bool {
        let file = {
            let mut index = self.lock_index();
            let Some(file) = index.map.get(local).map(Arc::clone) else {
                return false;
            };
            match file.state() {
                FileState::Ready => {
                    file.mark_evicting();
                    index.total_bytes = index.total_bytes.saturating_sub(file.size());
                }
                FileState::Evicting | FileState::Deleted => {}
                // Never accounted; nothing to subtract.
                FileState::New | FileState::Downloading | FileState::Failed => {
                    file.mark_deleted();
                }
            }
            if !physical {
                index.map.remove(local);
            }
            file
        };

        if physical {
            self.finish_eviction(&file).await;
        } else {
            file.mark_deleted();
        }
        true
    }

    /// Best-effort bulk removal of every cached file under `local_prefix`.
    pub async fn delete_path(&self, local_prefix: &Path) -> bool {
        let targets: Vec<PathBuf> = {
            let index = self.lock_index();
            index
                .map
                .iter()
                .filter(|(path, _)| path.starts_with(local_prefix))
                .map(|(path, _)| path.clone())
                .collect()
        };
        let mut any = false;
        for path in targets {
            any |= self.remove(&path, true).await;
        }
        if any {
            let _ = tokio::fs::remove_dir_all(local_prefix).await;
        }
        any
    }

    /// One sweep pass: finish deferred evictions whose pins have drained,
    /// re-apply the size bound in case an admission had to overshoot, and
    /// collect deleted husks.
    pub async fn sweep(&self) {
        let work: Vec<Arc<ManagedFile>> = {
            let mut index = self.lock_index();
            let mut work: Vec<Arc<ManagedFile>> = index
                .map
                .iter()
                .filter(|(_, f)| f.state() == FileState::Evicting)
                .map(|(_, f)| Arc::clone(f))
                .collect();
            work.extend(self.collect_victims(&mut index, None));
            work
        };
        for file in work {
            self.finish_eviction(&file).await;
        }

        let mut index = self.lock_index();
        index.map.retain(|_, f| f.state() != FileState::Deleted);
    }

    /// Spawn the periodic sweeper. The task runs until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, timeslice: Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timeslice);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.sweep().await;
            }
        })
    }
}
