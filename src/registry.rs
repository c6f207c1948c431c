//! Cache registry: the entry point tying every component together.
//!
//! One registry is constructed per embedding engine object — explicitly, not
//! as a module-level singleton, so initialization order is the caller's and
//! re-initialization amounts to constructing a fresh registry. It owns the
//! eviction engine, the loader, the shared executor and metadata cache, and
//! the routing map from descriptor identity to its bound adapter.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::info;

use crate::bridge::FsBridge;
use crate::cache::{
    CacheEngine, CfsPair, CreationNature, ManagedFile, RemoteOrigin, SingleFlightLoader,
};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::exec::TaskExecutor;
use crate::fs::local::LocalConnector;
use crate::fs::tachyon::TachyonConnector;
use crate::fs::{DescriptorKey, FilesystemDescriptor, FsType, RemoteConnector};
use crate::meta::MetaCache;
use crate::namespace;
use crate::pool::{ConnectionPool, Lease};

/// A descriptor bound to its pool and per-descriptor bridge tuning.
#[derive(Debug)]
pub struct DescriptorAdapter {
    descriptor: FilesystemDescriptor,
    pool: ConnectionPool,
    bridge: FsBridge,
}

impl DescriptorAdapter {
    /// The resolved descriptor this adapter serves.
    #[must_use]
    pub fn descriptor(&self) -> &FilesystemDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn bridge(&self) -> &FsBridge {
        &self.bridge
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Lease a pooled connection to this descriptor's filesystem.
    pub async fn lease(&self) -> Result<Lease, CacheError> {
        self.pool.acquire(&self.bridge).await
    }
}

/// Builder for [`CacheRegistry`]; backends are plugged in here.
pub struct CacheRegistryBuilder {
    config: CacheConfig,
    connectors: FxHashMap<FsType, Arc<dyn RemoteConnector>>,
}

impl CacheRegistryBuilder {
    /// Register the connector dialing descriptors of `fs_type`.
    #[must_use]
    pub fn connector(mut self, fs_type: FsType, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connectors.insert(fs_type, connector);
        self
    }

    /// Validate the configuration, open the cache root, and start the
    /// background sweeper.
    pub async fn build(mut self) -> Result<Arc<CacheRegistry>, CacheError> {
        if self.config.cache_mem_limit_percent > 100 {
            return Err(CacheError::Config(
                "cache_mem_limit_percent must be <= 100".to_owned(),
            ));
        }
        if let Some(default_name) = &self.config.fs_default_name
            && FilesystemDescriptor::from_uri(default_name).is_none()
        {
            return Err(CacheError::Config(format!(
                "fs_default_name \"{default_name}\" is not a filesystem URI"
            )));
        }

        // The local filesystem is always dialable.
        self.connectors
            .entry(FsType::Local)
            .or_insert_with(|| Arc::new(LocalConnector::new()));

        let engine = CacheEngine::open(
            self.config.cache_root.clone(),
            self.config.size_hard_limit(),
        )
        .await?;

        let loader = SingleFlightLoader::new(
            Arc::clone(&engine),
            self.config.failure_cooldown(),
            download_wait_budget(&self.config),
        );

        let sweeper = engine.spawn_sweeper(self.config.eviction_timeslice());
        info!(
            root = %self.config.cache_root.display(),
            limit = self.config.size_hard_limit(),
            "cache registry initialized"
        );

        Ok(Arc::new(CacheRegistry {
            exec: Arc::new(TaskExecutor::new(self.config.fs_executor_workers)),
            meta: Arc::new(MetaCache::new()),
            engine,
            loader,
            adapters: scc::HashMap::new(),
            connectors: self.connectors,
            sweeper: Mutex::new(Some(sweeper)),
            config: self.config,
        }))
    }
}

/// How long a waiter may park on someone else's download: the producer's
/// worst-case bridge schedule plus slack for the disk write.
fn download_wait_budget(config: &CacheConfig) -> Duration {
    let tuning = config.fs_tuning;
    let attempts = u64::from(tuning.fs_retries.max(1));
    let backoff_units = attempts * attempts.saturating_sub(1); // sum of 2k, k in 0..attempts-1
    Duration::from_millis(
        tuning.fs_timeout_base_ms * attempts + tuning.fs_backoff_base_ms * backoff_units,
    ) + Duration::from_secs(60)
}

/// Process-wide cache facade.
pub struct CacheRegistry {
    config: CacheConfig,
    exec: Arc<TaskExecutor>,
    meta: Arc<MetaCache>,
    engine: Arc<CacheEngine>,
    loader: SingleFlightLoader,
    /// Routing map: descriptor identity -> bound adapter.
    adapters: scc::HashMap<DescriptorKey, Arc<DescriptorAdapter>>,
    connectors: FxHashMap<FsType, Arc<dyn RemoteConnector>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CacheRegistry {
    /// Start building a registry over `config`.
    #[must_use]
    pub fn builder(config: CacheConfig) -> CacheRegistryBuilder {
        CacheRegistryBuilder {
            config,
            connectors: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    #[must_use]
    pub fn meta(&self) -> &Arc<MetaCache> {
        &self.meta
    }

    /// Resolve a `default` descriptor against `fs_default_name`, leaving
    /// concrete descriptors untouched.
    fn resolve(&self, descriptor: &FilesystemDescriptor) -> Result<FilesystemDescriptor, CacheError> {
        if !descriptor.needs_resolution() {
            return Ok(descriptor.clone());
        }
        let Some(default_name) = &self.config.fs_default_name else {
            return Err(CacheError::Config(
                "descriptor requires resolution but fs_default_name is not set".to_owned(),
            ));
        };
        let mut resolved = FilesystemDescriptor::from_uri(default_name).ok_or_else(|| {
            CacheError::Config(format!(
                "fs_default_name \"{default_name}\" is not a filesystem URI"
            ))
        })?;
        resolved.credentials = descriptor.credentials.clone();
        resolved.credentials_key = descriptor.credentials_key.clone();
        Ok(resolved)
    }

    /// Register a filesystem descriptor, creating its bound adapter. Repeat
    /// registration for the same `(fs_type, host)` identity is a no-op.
    /// Returns the (possibly resolved) descriptor actually registered.
    pub fn configure_filesystem(
        &self,
        descriptor: &FilesystemDescriptor,
    ) -> Result<FilesystemDescriptor, CacheError> {
        let resolved = self.resolve(descriptor)?;
        let key = resolved.key();
        if self.adapters.read(&key, |_, _| ()).is_some() {
            return Ok(resolved);
        }

        let connector = self
            .connectors
            .get(&resolved.fs_type)
            .cloned()
            .ok_or_else(|| {
                CacheError::Config(format!(
                    "no connector registered for filesystem type \"{}\"",
                    resolved.fs_type
                ))
            })?;
        // Tachyon descriptors get the drain-on-open decoration.
        let connector: Arc<dyn RemoteConnector> = if resolved.fs_type == FsType::Tachyon {
            Arc::new(TachyonConnector::wrap(connector))
        } else {
            connector
        };

        let tuning = self.config.tuning_for(&resolved);
        let adapter = Arc::new(DescriptorAdapter {
            descriptor: resolved.clone(),
            pool: ConnectionPool::new(resolved.clone(), connector),
            bridge: FsBridge::new(Arc::clone(&self.exec), Arc::clone(&self.meta), tuning),
        });
        // A racing insert for the same key keeps the winner; both callers
        // observe a configured filesystem either way.
        let _ = self.adapters.insert(key, adapter);
        info!(descriptor = %resolved, "filesystem configured");
        Ok(resolved)
    }

    /// The bound adapter for a descriptor.
    pub fn adapter(
        &self,
        descriptor: &FilesystemDescriptor,
    ) -> Result<Arc<DescriptorAdapter>, CacheError> {
        let resolved = self.resolve(descriptor)?;
        self.adapters
            .read(&resolved.key(), |_, a| Arc::clone(a))
            .ok_or_else(|| {
                CacheError::Config(format!("filesystem \"{resolved}\" is not configured"))
            })
    }

    /// Local cache path of `(descriptor, remote_path, transform)`.
    pub fn local_path(
        &self,
        descriptor: &FilesystemDescriptor,
        remote_path: &str,
        transform: Option<&str>,
    ) -> Result<PathBuf, CacheError> {
        let resolved = self.resolve(descriptor)?;
        Ok(namespace::local_path(
            self.engine.root(),
            &resolved,
            remote_path,
            transform,
        ))
    }

    /// Look up a cached file without going remote. Touches access order.
    pub fn find_file(
        &self,
        descriptor: &FilesystemDescriptor,
        remote_path: &str,
        transform: Option<&str>,
    ) -> Result<Option<Arc<ManagedFile>>, CacheError> {
        let local = self.local_path(descriptor, remote_path, transform)?;
        Ok(self.engine.find(&local))
    }

    /// Insert a file in state `New` without fetching (the loser of the
    /// insert race observes `false`).
    pub fn add_file(
        &self,
        descriptor: &FilesystemDescriptor,
        remote_path: &str,
        transform: Option<&str>,
        nature: CreationNature,
    ) -> Result<(Arc<ManagedFile>, bool), CacheError> {
        let resolved = self.resolve(descriptor)?;
        let local = namespace::local_path(self.engine.root(), &resolved, remote_path, transform);
        let origin = RemoteOrigin {
            descriptor: resolved,
            remote_path: remote_path.to_owned(),
            transform: transform.map(str::to_owned),
        };
        Ok(self.engine.add(local, origin, nature))
    }

    /// Resolve to a `Ready` managed file, downloading through the
    /// single-flight loader on a miss.
    pub async fn open_cached(
        &self,
        descriptor: &FilesystemDescriptor,
        remote_path: &str,
        transform: Option<&str>,
    ) -> Result<Arc<ManagedFile>, CacheError> {
        let adapter = self.adapter(descriptor)?;
        let local = namespace::local_path(
            self.engine.root(),
            adapter.descriptor(),
            remote_path,
            transform,
        );
        let origin = RemoteOrigin {
            descriptor: adapter.descriptor().clone(),
            remote_path: remote_path.to_owned(),
            transform: transform.map(str::to_owned),
        };
        self.loader
            .get_or_fetch(&origin, &local, adapter.pool(), adapter.bridge())
            .await
    }

    /// Remove a single file from the cache. With `physical`, the on-disk
    /// bytes are deleted (deferred while pinned).
    pub async fn delete_file(
        &self,
        descriptor: &FilesystemDescriptor,
        remote_path: &str,
        transform: Option<&str>,
        physical: bool,
    ) -> Result<bool, CacheError> {
        let resolved = self.resolve(descriptor)?;
        let local = namespace::local_path(self.engine.root(), &resolved, remote_path, transform);
        self.meta.invalidate(&resolved.key(), remote_path);
        Ok(self.engine.remove(&local, physical).await)
    }

    /// Best-effort bulk removal of every cached file under a remote prefix.
    pub async fn delete_path(
        &self,
        descriptor: &FilesystemDescriptor,
        remote_prefix: &str,
    ) -> Result<bool, CacheError> {
        let resolved = self.resolve(descriptor)?;
        let local = namespace::local_path(self.engine.root(), &resolved, remote_prefix, None);
        self.meta.invalidate(&resolved.key(), remote_prefix);
        Ok(self.engine.delete_path(&local).await)
    }

    /// Mark a cached file dirty: the remote side is believed to have changed
    /// and the next open re-downloads it.
    pub fn mark_dirty(
        &self,
        descriptor: &FilesystemDescriptor,
        remote_path: &str,
        transform: Option<&str>,
    ) -> Result<bool, CacheError> {
        let resolved = self.resolve(descriptor)?;
        self.meta.invalidate(&resolved.key(), remote_path);
        let local = namespace::local_path(self.engine.root(), &resolved, remote_path, transform);
        match self.engine.find(&local) {
            Some(file) => {
                file.mark_dirty();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -- CREATE-FROM-SELECT registration -------------------------------------

    /// Register the remote sink for a locally written CTAS output.
    pub fn register_create_from_select(&self, handle_id: u64, pair: CfsPair) {
        self.loader.register_cfs(handle_id, pair);
    }

    /// Detach the pair registered under `handle_id`; `None` the second time.
    pub fn unregister_create_from_select(&self, handle_id: u64) -> Option<CfsPair> {
        self.loader.unregister_cfs(handle_id)
    }
}

impl Drop for CacheRegistry {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock()
            && let Some(handle) = sweeper.take()
        {
            handle.abort();
        }
    }
}
