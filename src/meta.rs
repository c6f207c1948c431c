//! In-memory cache of remote filesystem object metadata.
//!
//! Two keyed maps: `(config key, path) -> dialed filesystem` and
//! `(descriptor, path) -> sync state + statuses`. Stat data for a single file
//! is stored as child metadata on its parent directory's entry; a directory
//! listing is stored on the directory entry itself. Entries live for the
//! process lifetime unless explicitly invalidated — the bridge overwrites
//! them on every terminal outcome.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::fs::{DescriptorKey, ObjectStatus, RemoteFilesystem};

/// Terminal synchronization state of a cached object entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Remote metadata was fetched successfully.
    SyncOk,
    /// The last remote fetch for this key timed out or failed; queries must
    /// go back to the remote side (`force` semantics).
    SyncFailure,
    /// Existence probe answered "present".
    Exists,
    /// Existence probe answered "absent".
    DoesNotExist,
}

/// Tri-state answer of an existence query against the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    Exists,
    DoesNotExist,
    /// Nothing cached, or the last sync failed.
    Unknown,
}

#[derive(Default)]
struct ObjectEntry {
    state: Option<SyncState>,
    /// Status of the object itself (meaningful for directories and for files
    /// queried at the filesystem root).
    status: Option<ObjectStatus>,
    /// Children statuses keyed by child path. Filled by `list_status` and by
    /// single-file stats recorded against this (parent) entry.
    children: FxHashMap<String, ObjectStatus>,
    /// Whether `children` is a complete directory listing, as opposed to an
    /// accumulation of individual stats.
    listed: bool,
}

/// Parent directory of `path`, or `None` at the root.
fn parent_of(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        if trimmed.len() > 1 { Some("/") } else { None }
    } else {
        Some(&trimmed[..idx])
    }
}

/// Process-lifetime metadata cache shared by all bridges.
pub struct MetaCache {
    filesystems: scc::HashMap<(String, String), Arc<dyn RemoteFilesystem>>,
    objects: scc::HashMap<(DescriptorKey, String), ObjectEntry>,
}

impl MetaCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            filesystems: scc::HashMap::new(),
            objects: scc::HashMap::new(),
        }
    }

    // -- dialed-filesystem map ------------------------------------------------

    /// Cache a dialed filesystem under `(config_key, path)`.
    pub fn add_filesystem(
        &self,
        config_key: &str,
        path: &str,
        filesystem: Arc<dyn RemoteFilesystem>,
    ) {
        let _ = self
            .filesystems
            .insert((config_key.to_owned(), path.to_owned()), filesystem);
    }

    /// Look up a previously dialed filesystem.
    #[must_use]
    pub fn filesystem(&self, config_key: &str, path: &str) -> Option<Arc<dyn RemoteFilesystem>> {
        self.filesystems
            .read(&(config_key.to_owned(), path.to_owned()), |_, v| Arc::clone(v))
    }

    /// Whether a filesystem is cached for `(config_key, path)`.
    #[must_use]
    pub fn contains_filesystem(&self, config_key: &str, path: &str) -> bool {
        self.filesystems
            .read(&(config_key.to_owned(), path.to_owned()), |_, _| ())
            .is_some()
    }

    /// Drop the filesystem cached under `(config_key, path)`. Returns whether
    /// an entry was removed. Keyed by path, not by configuration.
    pub fn remove_filesystem(&self, config_key: &str, path: &str) -> bool {
        self.filesystems
            .remove(&(config_key.to_owned(), path.to_owned()))
            .is_some()
    }

    // -- object metadata map --------------------------------------------------

    /// Run `mutate` against the entry for `map_key`, inserting an empty entry
    /// first when none exists. Loops on the insert/update race instead of
    /// relying on an entry API, the same way the file-cache map is driven.
    fn with_entry<R>(
        &self,
        map_key: (DescriptorKey, String),
        mut mutate: impl FnMut(&mut ObjectEntry) -> R,
    ) -> R {
        loop {
            if let Some(result) = self.objects.update(&map_key, |_, e| mutate(e)) {
                return result;
            }
            // Vacant; admit an empty entry and retry. Losing the insert race
            // is fine — the winner's entry is updated on the next pass.
            let _ = self.objects.insert(map_key.clone(), ObjectEntry::default());
        }
    }

    /// Record a complete directory listing for `path`.
    pub fn record_listing(&self, key: &DescriptorKey, path: &str, listing: &[ObjectStatus]) {
        self.with_entry((key.clone(), path.to_owned()), |entry| {
            entry.state = Some(SyncState::SyncOk);
            entry.children = listing
                .iter()
                .map(|s| (s.path.clone(), s.clone()))
                .collect();
            entry.listed = true;
        });
    }

    /// Record a single object's status. The stat lands on the parent
    /// directory's entry as child metadata; root-level objects keep it on
    /// their own entry.
    pub fn record_status(&self, key: &DescriptorKey, path: &str, status: &ObjectStatus) {
        match parent_of(path) {
            Some(parent) => {
                self.with_entry((key.clone(), parent.to_owned()), |entry| {
                    entry.children.insert(path.to_owned(), status.clone());
                });
            }
            None => {
                self.with_entry((key.clone(), path.to_owned()), |entry| {
                    entry.status = Some(status.clone());
                    entry.state = Some(SyncState::SyncOk);
                });
            }
        }
    }

    /// Record the terminal outcome of an existence probe.
    pub fn record_existence(&self, key: &DescriptorKey, path: &str, exists: bool) {
        self.with_entry((key.clone(), path.to_owned()), |entry| {
            entry.state = Some(if exists {
                SyncState::Exists
            } else {
                SyncState::DoesNotExist
            });
        });
    }

    /// Record a terminal sync failure for `path`. Subsequent lookups return
    /// nothing so callers fall through to the remote side.
    pub fn record_failure(&self, key: &DescriptorKey, path: &str) {
        self.with_entry((key.clone(), path.to_owned()), |entry| {
            entry.state = Some(SyncState::SyncFailure);
            entry.children.clear();
            entry.listed = false;
        });
    }

    /// Cached status of a single object, served from its parent's entry.
    #[must_use]
    pub fn file_status(&self, key: &DescriptorKey, path: &str) -> Option<ObjectStatus> {
        match parent_of(path) {
            Some(parent) => self
                .objects
                .read(&(key.clone(), parent.to_owned()), |_, e| {
                    if e.state == Some(SyncState::SyncFailure) {
                        return None;
                    }
                    e.children.get(path).cloned()
                })
                .flatten(),
            None => self
                .objects
                .read(&(key.clone(), path.to_owned()), |_, e| {
                    if e.state == Some(SyncState::SyncFailure) {
                        return None;
                    }
                    e.status.clone()
                })
                .flatten(),
        }
    }

    /// Cached complete listing of a directory, if one was recorded.
    #[must_use]
    pub fn dir_listing(&self, key: &DescriptorKey, path: &str) -> Option<Vec<ObjectStatus>> {
        self.objects
            .read(&(key.clone(), path.to_owned()), |_, e| {
                if e.listed && e.state != Some(SyncState::SyncFailure) {
                    Some(e.children.values().cloned().collect())
                } else {
                    None
                }
            })
            .flatten()
    }

    /// Tri-state existence answer for `path`.
    #[must_use]
    pub fn existence(&self, key: &DescriptorKey, path: &str) -> Existence {
        let direct = self
            .objects
            .read(&(key.clone(), path.to_owned()), |_, e| e.state);
        match direct {
            Some(Some(SyncState::Exists)) => return Existence::Exists,
            Some(Some(SyncState::DoesNotExist)) => return Existence::DoesNotExist,
            Some(Some(SyncState::SyncFailure)) => return Existence::Unknown,
            _ => {}
        }
        // A cached stat on the parent also answers the question.
        if self.file_status(key, path).is_some() {
            return Existence::Exists;
        }
        Existence::Unknown
    }

    /// Drop all cached metadata for `path` (and its child slot on the parent).
    pub fn invalidate(&self, key: &DescriptorKey, path: &str) {
        let _ = self.objects.remove(&(key.clone(), path.to_owned()));
        if let Some(parent) = parent_of(path) {
            self.objects
                .update(&(key.clone(), parent.to_owned()), |_, e| {
                    e.children.remove(path);
                    e.listed = false;
                });
        }
    }
}

impl Default for MetaCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FsType, ObjectKind};

    fn key() -> DescriptorKey {
        DescriptorKey {
            fs_type: FsType::Hdfs,
            host: "nn1".to_owned(),
        }
    }

    fn status(path: &str, size: u64) -> ObjectStatus {
        ObjectStatus {
            path: path.to_owned(),
            kind: ObjectKind::File,
            size,
            block_size: 4096,
            replication: 3,
            modified_secs: 0,
            owner: "hdfs".to_owned(),
            group: "hadoop".to_owned(),
            permissions: 0o644,
        }
    }

    #[test]
    fn parent_resolution() {
        assert_eq!(parent_of("/a/b/c"), Some("/a/b"));
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/"), None);
    }

    #[test]
    fn listing_serves_child_stats() {
        let meta = MetaCache::new();
        let listing = vec![status("/dir/a", 1), status("/dir/b", 2)];
        meta.record_listing(&key(), "/dir", &listing);

        let got = meta.file_status(&key(), "/dir/b").expect("child stat");
        assert_eq!(got.size, 2);
        assert_eq!(
            meta.dir_listing(&key(), "/dir").map(|l| l.len()),
            Some(2),
            "listing should be cached whole"
        );
    }

    #[test]
    fn existence_is_tristate() {
        let meta = MetaCache::new();
        assert_eq!(meta.existence(&key(), "/x"), Existence::Unknown);

        meta.record_existence(&key(), "/x", true);
        assert_eq!(meta.existence(&key(), "/x"), Existence::Exists);

        meta.record_existence(&key(), "/x", false);
        assert_eq!(meta.existence(&key(), "/x"), Existence::DoesNotExist);
    }

    #[test]
    fn failure_poisons_the_entry() {
        let meta = MetaCache::new();
        meta.record_listing(&key(), "/dir", &[status("/dir/a", 1)]);
        meta.record_failure(&key(), "/dir");

        assert!(meta.dir_listing(&key(), "/dir").is_none());
        assert!(meta.file_status(&key(), "/dir/a").is_none());
    }

    #[test]
    fn invalidate_clears_child_slot() {
        let meta = MetaCache::new();
        meta.record_listing(&key(), "/dir", &[status("/dir/a", 1)]);
        meta.invalidate(&key(), "/dir/a");

        assert!(meta.file_status(&key(), "/dir/a").is_none());
        assert!(
            meta.dir_listing(&key(), "/dir").is_none(),
            "listing is no longer complete after a child invalidation"
        );
    }

    #[test]
    fn filesystem_map_is_keyed_by_path() {
        let meta = MetaCache::new();
        let fs: Arc<dyn RemoteFilesystem> = Arc::new(crate::fs::local::LocalFs::new());
        meta.add_filesystem("hdfs://nn1:8020", "/warehouse", fs);

        assert!(meta.contains_filesystem("hdfs://nn1:8020", "/warehouse"));
        assert!(!meta.contains_filesystem("hdfs://nn1:8020", "/other"));
        assert!(meta.remove_filesystem("hdfs://nn1:8020", "/warehouse"));
        assert!(!meta.remove_filesystem("hdfs://nn1:8020", "/warehouse"));
    }
}
