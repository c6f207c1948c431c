//! Shared test fixtures: an in-memory remote filesystem with operation
//! counters, and helpers to stand up a registry over a scratch cache root.
#![allow(dead_code, clippy::unwrap_used, missing_docs)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use dfs_cache::config::CacheConfig;
use dfs_cache::fs::{
    BlockLocation, FilesystemDescriptor, FsType, ObjectKind, ObjectStatus, OpenFlags,
    RemoteConnector, RemoteFile, RemoteFilesystem,
};
use dfs_cache::registry::CacheRegistry;

/// Route cache logs into the test output when `RUST_LOG` asks for them.
pub fn trace_init() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct MockState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    open_count: AtomicU32,
    read_bytes: AtomicU64,
    exists_calls: AtomicU32,
    stat_calls: AtomicU32,
    list_calls: AtomicU32,
    /// Per-operation artificial latency; set to hours to simulate a hang.
    delay: Mutex<Option<Duration>>,
    /// Countdown of opens that fail with an I/O error.
    fail_opens: AtomicU32,
}

impl MockState {
    async fn maybe_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn status_of(&self, path: &str, data: &[u8]) -> ObjectStatus {
        ObjectStatus {
            path: path.to_owned(),
            kind: ObjectKind::File,
            size: data.len() as u64,
            block_size: 4096,
            replication: 3,
            modified_secs: 1_700_000_000,
            owner: "hdfs".to_owned(),
            group: "hadoop".to_owned(),
            permissions: 0o644,
        }
    }
}

/// In-memory "remote" filesystem with per-operation counters. Cheap to clone;
/// clones share state, which is how tests observe what the cache did.
#[derive(Clone, Default)]
pub struct MockRemoteFs {
    state: Arc<MockState>,
}

impl MockRemoteFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, bytes: &[u8]) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_owned(), bytes.to_vec());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.state.files.lock().unwrap().get(path).cloned()
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.state.delay.lock().unwrap() = delay;
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.state.fail_opens.store(count, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> u32 {
        self.state.open_count.load(Ordering::SeqCst)
    }

    pub fn read_bytes(&self) -> u64 {
        self.state.read_bytes.load(Ordering::SeqCst)
    }

    pub fn exists_calls(&self) -> u32 {
        self.state.exists_calls.load(Ordering::SeqCst)
    }

    pub fn stat_calls(&self) -> u32 {
        self.state.stat_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> u32 {
        self.state.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteFilesystem for MockRemoteFs {
    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        _buf_size: u32,
        _replication: i16,
        _block_size: u64,
    ) -> io::Result<Box<dyn RemoteFile>> {
        self.state.open_count.fetch_add(1, Ordering::SeqCst);
        self.state.maybe_delay().await;
        if self
            .state
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::other("injected open failure"));
        }
        if flags.is_write() {
            return Ok(Box::new(MockFile {
                state: Arc::clone(&self.state),
                path: path.to_owned(),
                data: Vec::new(),
                pos: 0,
                write_mode: true,
            }));
        }
        let data = self
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_owned()))?;
        Ok(Box::new(MockFile {
            state: Arc::clone(&self.state),
            path: path.to_owned(),
            data,
            pos: 0,
            write_mode: false,
        }))
    }

    async fn exists(&self, path: &str) -> io::Result<bool> {
        self.state.exists_calls.fetch_add(1, Ordering::SeqCst);
        self.state.maybe_delay().await;
        Ok(self.state.files.lock().unwrap().contains_key(path))
    }

    async fn file_status(&self, path: &str) -> io::Result<ObjectStatus> {
        self.state.stat_calls.fetch_add(1, Ordering::SeqCst);
        self.state.maybe_delay().await;
        let files = self.state.files.lock().unwrap();
        let data = files
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_owned()))?;
        Ok(self.state.status_of(path, data))
    }

    async fn list_status(&self, path: &str) -> io::Result<Vec<ObjectStatus>> {
        self.state.list_calls.fetch_add(1, Ordering::SeqCst);
        self.state.maybe_delay().await;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let files = self.state.files.lock().unwrap();
        let mut listing: Vec<ObjectStatus> = files
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix) && !p[prefix.len()..].contains('/'))
            .map(|(p, d)| self.state.status_of(p, d))
            .collect();
        listing.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listing)
    }

    async fn block_locations(
        &self,
        path: &str,
        start: u64,
        len: u64,
    ) -> io::Result<Vec<BlockLocation>> {
        self.state.maybe_delay().await;
        let size = self
            .get(path)
            .map(|d| d.len() as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_owned()))?;
        let end = size.min(start.saturating_add(len));
        Ok(vec![BlockLocation {
            hosts: vec!["dn1".to_owned(), "dn2".to_owned()],
            offset: start,
            length: end.saturating_sub(start),
            disk_ids: vec!["disk-0".to_owned()],
        }])
    }

    async fn create_directory(&self, _path: &str) -> io::Result<()> {
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let mut files = self.state.files.lock().unwrap();
        match files.remove(from) {
            Some(data) => {
                files.insert(to.to_owned(), data);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, from.to_owned())),
        }
    }

    async fn delete(&self, path: &str, recursive: bool) -> io::Result<()> {
        let mut files = self.state.files.lock().unwrap();
        if recursive {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            files.retain(|p, _| p != path && !p.starts_with(&prefix));
            Ok(())
        } else if files.remove(path).is_some() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, path.to_owned()))
        }
    }

    async fn copy(&self, from: &str, to: &str) -> io::Result<()> {
        let mut files = self.state.files.lock().unwrap();
        match files.get(from).cloned() {
            Some(data) => {
                files.insert(to.to_owned(), data);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, from.to_owned())),
        }
    }

    async fn chown(
        &self,
        _path: &str,
        _owner: Option<&str>,
        _group: Option<&str>,
    ) -> io::Result<()> {
        Ok(())
    }

    async fn chmod(&self, _path: &str, _mode: u16) -> io::Result<()> {
        Ok(())
    }

    async fn set_replication(&self, _path: &str, _replication: i16) -> io::Result<()> {
        Ok(())
    }

    async fn capacity(&self) -> io::Result<u64> {
        Ok(1 << 40)
    }

    async fn used(&self) -> io::Result<u64> {
        let files = self.state.files.lock().unwrap();
        Ok(files.values().map(|d| d.len() as u64).sum())
    }

    async fn default_block_size(&self) -> io::Result<u64> {
        Ok(128 * 1024 * 1024)
    }
}

pub struct MockFile {
    state: Arc<MockState>,
    path: String,
    data: Vec<u8>,
    pos: usize,
    write_mode: bool,
}

#[async_trait]
impl RemoteFile for MockFile {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.state.maybe_delay().await;
        let remaining = self.data.len().saturating_sub(self.pos);
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        self.state.read_bytes.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }

    async fn pread(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let offset = usize::try_from(offset).unwrap_or(usize::MAX).min(self.data.len());
        let remaining = self.data.len() - offset;
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        self.state.read_bytes.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.write_mode {
            return Err(io::Error::other("read-only stream"));
        }
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.pos = usize::try_from(pos).unwrap_or(usize::MAX).min(self.data.len());
        Ok(())
    }

    async fn tell(&mut self) -> io::Result<u64> {
        Ok(self.pos as u64)
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn available(&mut self) -> io::Result<u64> {
        Ok(self.data.len().saturating_sub(self.pos) as u64)
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.write_mode {
            self.state
                .files
                .lock()
                .unwrap()
                .insert(self.path.clone(), self.data.clone());
            self.write_mode = false;
        }
        Ok(())
    }
}

/// Connector handing out the shared mock session; counts dials.
pub struct MockConnector {
    fs: MockRemoteFs,
    pub dials: AtomicU32,
}

impl MockConnector {
    pub fn new(fs: MockRemoteFs) -> Arc<Self> {
        Arc::new(Self {
            fs,
            dials: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn dial(
        &self,
        _descriptor: &FilesystemDescriptor,
    ) -> io::Result<Arc<dyn RemoteFilesystem>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.fs.clone()) as Arc<dyn RemoteFilesystem>)
    }
}

/// Standard HDFS test descriptor.
pub fn hdfs_descriptor() -> FilesystemDescriptor {
    FilesystemDescriptor::new(FsType::Hdfs, "nn1", 8020)
}

/// Standard Tachyon test descriptor.
pub fn tachyon_descriptor() -> FilesystemDescriptor {
    FilesystemDescriptor::new(FsType::Tachyon, "tn1", 19998)
}

/// Registry over a scratch root with the mock wired in for HDFS and Tachyon,
/// configured with fast test tunings.
pub async fn test_registry(
    tmp: &tempfile::TempDir,
    fs: &MockRemoteFs,
    mutate: impl FnOnce(&mut CacheConfig),
) -> Arc<CacheRegistry> {
    let mut config = CacheConfig::rooted(tmp.path().join("cache"));
    config.fs_tuning.fs_timeout_base_ms = 5_000;
    config.fs_tuning.fs_retries = 2;
    config.fs_tuning.fs_backoff_base_ms = 10;
    config.fs_failure_cooldown_ms = 60_000;
    config.cache_eviction_timeslice_ms = 50;
    mutate(&mut config);

    let registry = CacheRegistry::builder(config)
        .connector(FsType::Hdfs, MockConnector::new(fs.clone()))
        .connector(FsType::Tachyon, MockConnector::new(fs.clone()))
        .build()
        .await
        .unwrap();
    registry.configure_filesystem(&hdfs_descriptor()).unwrap();
    registry
}
