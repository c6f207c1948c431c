//! Scanner-facing file API.
//!
//! Mirrors the POSIX-flavored surface scan operators consume, selecting a
//! local handle whenever a valid cached copy exists and falling back to a
//! pass-through remote stream (carrying its pool lease) otherwise. Stat-like
//! operations route through the bridge and the metadata cache so repeated
//! lookups cost no remote round-trips.

use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tracing::{debug, instrument, warn};

use crate::cache::{CfsPair, CreationNature, FileState, ManagedFile, PinGuard};
use crate::error::CacheError;
use crate::fs::{BlockLocation, FilesystemDescriptor, ObjectStatus, OpenFlags, RemoteFile};
use crate::pool::Lease;
use crate::registry::CacheRegistry;

/// Copy buffer for upload/copy streaming.
const COPY_BUFFER_SIZE: usize = 1 << 20;

/// How many times an open retries when it loses the pin/evict race.
const OPEN_RETRY_LIMIT: usize = 3;

fn remote_err(e: std::io::Error) -> CacheError {
    CacheError::RemoteIo(e.to_string())
}

enum HandleInner {
    /// Reader over a materialized cache file; the pin defers eviction.
    Cached {
        file: tokio::fs::File,
        pin: PinGuard,
    },
    /// CTAS writer: local file now, upload to the registered sink on close.
    LocalWriter {
        file: tokio::fs::File,
        managed: Arc<ManagedFile>,
    },
    /// Pass-through stream on the remote filesystem, carrying its lease.
    Remote {
        stream: Box<dyn RemoteFile>,
        _lease: Lease,
    },
    Closed,
}

/// An open file handle returned by [`FileSystemMediator::open`].
pub struct DfsFile {
    id: u64,
    inner: HandleInner,
}

impl DfsFile {
    /// Opaque handle identity; keys the CREATE-FROM-SELECT registration.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this handle reads from the local cache copy.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self.inner, HandleInner::Cached { .. })
    }
}

/// The mediator: descriptor-routed file and namespace operations.
pub struct FileSystemMediator {
    registry: Arc<CacheRegistry>,
    next_handle: AtomicU64,
}

impl FileSystemMediator {
    #[must_use]
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self {
            registry,
            next_handle: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    fn handle_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    // -- open/close -----------------------------------------------------------

    /// Open `path` on `descriptor`'s filesystem.
    ///
    /// Reads on a remote descriptor resolve through the cache: the loader
    /// materializes the object locally (single-flight) and the returned
    /// handle reads the local copy, pinned against eviction. Writes on a
    /// remote descriptor produce a CREATE-FROM-SELECT pair: bytes land in a
    /// local cache file whose registered remote sink is fed on close. Local
    /// descriptors pass straight through.
    #[instrument(name = "Mediator::open", skip(self), fields(descriptor = %descriptor))]
    pub async fn open(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &str,
        flags: OpenFlags,
        buf_size: u32,
        replication: i16,
        block_size: u64,
    ) -> Result<DfsFile, CacheError> {
        let id = self.handle_id();

        if descriptor.is_local() {
            let adapter = self.registry.adapter(descriptor)?;
            let lease = adapter.lease().await?;
            let stream = lease
                .filesystem()
                .open(path, flags, buf_size, replication, block_size)
                .await
                .map_err(remote_err)?;
            return Ok(DfsFile {
                id,
                inner: HandleInner::Remote {
                    stream,
                    _lease: lease,
                },
            });
        }

        if flags.is_write() {
            return self
                .open_create_from_select(id, descriptor, path, flags, buf_size, replication, block_size)
                .await;
        }

        // Read path: resolve through the cache, pin, and double-check the
        // state under the pin so an eviction racing the open is caught.
        for _ in 0..OPEN_RETRY_LIMIT {
            let managed = self.registry.open_cached(descriptor, path, None).await?;
            let pin = managed.pin();
            if managed.state() != FileState::Ready {
                drop(pin);
                continue;
            }
            let file = tokio::fs::File::open(managed.local_path()).await?;
            debug!(path, local = %managed.local_path().display(), "serving from cache");
            return Ok(DfsFile {
                id,
                inner: HandleInner::Cached { file, pin },
            });
        }
        Err(CacheError::RemoteIo(format!(
            "cached copy of {path} kept disappearing during open"
        )))
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the open signature")]
    async fn open_create_from_select(
        &self,
        id: u64,
        descriptor: &FilesystemDescriptor,
        path: &str,
        flags: OpenFlags,
        buf_size: u32,
        replication: i16,
        block_size: u64,
    ) -> Result<DfsFile, CacheError> {
        let adapter = self.registry.adapter(descriptor)?;

        let (managed, _admitted) = self.registry.add_file(
            descriptor,
            path,
            None,
            CreationNature::CreateFromSelect,
        )?;
        // The writer is this file's producer; readers arriving before close
        // wait on the state channel like any other download.
        let _ = managed.try_claim_producer();

        let setup = async {
            if let Some(parent) = managed.local_path().parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::File::create(managed.local_path()).await?;

            let lease = adapter.lease().await?;
            let remote = lease
                .filesystem()
                .open(path, flags, buf_size, replication, block_size)
                .await
                .map_err(remote_err)?;
            Ok::<_, CacheError>((file, lease, remote))
        }
        .await;

        let (file, lease, remote) = match setup {
            Ok(parts) => parts,
            Err(e) => {
                managed.mark_failed(
                    e.republish_message(),
                    self.registry.config().failure_cooldown(),
                );
                return Err(e);
            }
        };
        self.registry
            .register_create_from_select(id, CfsPair { remote, lease });
        debug!(path, handle = id, "registered create-from-select pair");

        Ok(DfsFile {
            id,
            inner: HandleInner::LocalWriter { file, managed },
        })
    }

    /// Close a handle. Safe error behavior on every path: the pin or lease is
    /// released even when the close itself fails. Closing twice reports
    /// [`CacheError::InvalidHandle`].
    #[instrument(name = "Mediator::close", skip_all, fields(handle = file.id))]
    pub async fn close(&self, file: &mut DfsFile) -> Result<(), CacheError> {
        match std::mem::replace(&mut file.inner, HandleInner::Closed) {
            HandleInner::Closed => Err(CacheError::InvalidHandle),
            HandleInner::Cached { file, pin } => {
                drop(file);
                drop(pin);
                Ok(())
            }
            HandleInner::Remote { mut stream, _lease } => {
                stream.close().await.map_err(remote_err)?;
                Ok(())
            }
            HandleInner::LocalWriter {
                file: mut local,
                managed,
            } => {
                let finalize = async {
                    local.flush().await?;
                    local.sync_all().await?;
                    drop(local);

                    let size = tokio::fs::metadata(managed.local_path()).await?.len();

                    // The registration is looked up exactly once; a concurrent
                    // or repeated close finds nothing and uploads nothing.
                    if let Some(mut pair) = self.registry.unregister_create_from_select(file.id) {
                        let upload = self.upload(managed.local_path(), &mut pair.remote).await;
                        let close_result = pair.remote.close().await.map_err(remote_err);
                        drop(pair.lease);
                        upload?;
                        close_result?;
                    }
                    Ok::<_, CacheError>(size)
                }
                .await;

                match finalize {
                    Ok(size) => {
                        // The local artifact joins the cache as a ready file.
                        self.registry
                            .engine()
                            .admit_ready(&managed, size, true)
                            .await
                    }
                    Err(e) => {
                        managed.mark_failed(
                            e.republish_message(),
                            self.registry.config().failure_cooldown(),
                        );
                        Err(e)
                    }
                }
            }
        }
    }

    async fn upload(
        &self,
        local: &std::path::Path,
        remote: &mut Box<dyn RemoteFile>,
    ) -> Result<(), CacheError> {
        let mut source = tokio::fs::File::open(local).await?;
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = source.read(&mut buffer).await?;
            if n == 0 {
                return Ok(());
            }
            let mut written = 0;
            while written < n {
                written += remote
                    .write(&buffer[written..n])
                    .await
                    .map_err(remote_err)?;
            }
        }
    }

    // -- stream operations ----------------------------------------------------

    /// Read at the handle's position; zero means end of file.
    pub async fn read(&self, file: &mut DfsFile, buf: &mut [u8]) -> Result<usize, CacheError> {
        match &mut file.inner {
            HandleInner::Cached { file, .. } => Ok(file.read(buf).await?),
            HandleInner::LocalWriter { file, .. } => Ok(file.read(buf).await?),
            HandleInner::Remote { stream, .. } => stream.read(buf).await.map_err(remote_err),
            HandleInner::Closed => Err(CacheError::InvalidHandle),
        }
    }

    /// Positional read; does not move the handle's position.
    pub async fn pread(
        &self,
        file: &mut DfsFile,
        position: u64,
        buf: &mut [u8],
    ) -> Result<usize, CacheError> {
        match &mut file.inner {
            HandleInner::Cached { file, .. } => {
                let pos = file.stream_position().await?;
                file.seek(SeekFrom::Start(position)).await?;
                let n = file.read(buf).await?;
                file.seek(SeekFrom::Start(pos)).await?;
                Ok(n)
            }
            HandleInner::LocalWriter { .. } => Err(CacheError::InvalidHandle),
            HandleInner::Remote { stream, .. } => {
                stream.pread(position, buf).await.map_err(remote_err)
            }
            HandleInner::Closed => Err(CacheError::InvalidHandle),
        }
    }

    /// Read up to `len` bytes into an owned buffer.
    pub async fn read_bytes(&self, file: &mut DfsFile, len: usize) -> Result<Bytes, CacheError> {
        let mut buf = vec![0u8; len];
        let n = self.read(file, &mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Write at the handle's position. Only valid on write handles.
    pub async fn write(&self, file: &mut DfsFile, buf: &[u8]) -> Result<usize, CacheError> {
        match &mut file.inner {
            HandleInner::LocalWriter { file, .. } => Ok(file.write(buf).await?),
            HandleInner::Remote { stream, .. } => stream.write(buf).await.map_err(remote_err),
            HandleInner::Cached { .. } | HandleInner::Closed => Err(CacheError::InvalidHandle),
        }
    }

    /// Seek to an absolute offset. Read handles only.
    pub async fn seek(&self, file: &mut DfsFile, position: u64) -> Result<(), CacheError> {
        match &mut file.inner {
            HandleInner::Cached { file, .. } => {
                file.seek(SeekFrom::Start(position)).await?;
                Ok(())
            }
            HandleInner::Remote { stream, .. } => stream.seek(position).await.map_err(remote_err),
            HandleInner::LocalWriter { .. } | HandleInner::Closed => {
                Err(CacheError::InvalidHandle)
            }
        }
    }

    /// Current offset of the handle.
    pub async fn tell(&self, file: &mut DfsFile) -> Result<u64, CacheError> {
        match &mut file.inner {
            HandleInner::Cached { file, .. } => Ok(file.stream_position().await?),
            HandleInner::LocalWriter { file, .. } => Ok(file.stream_position().await?),
            HandleInner::Remote { stream, .. } => stream.tell().await.map_err(remote_err),
            HandleInner::Closed => Err(CacheError::InvalidHandle),
        }
    }

    pub async fn flush(&self, file: &mut DfsFile) -> Result<(), CacheError> {
        match &mut file.inner {
            HandleInner::Cached { .. } => Ok(()),
            HandleInner::LocalWriter { file, .. } => Ok(file.flush().await?),
            HandleInner::Remote { stream, .. } => stream.flush().await.map_err(remote_err),
            HandleInner::Closed => Err(CacheError::InvalidHandle),
        }
    }

    /// Bytes readable without blocking.
    pub async fn available(&self, file: &mut DfsFile) -> Result<u64, CacheError> {
        match &mut file.inner {
            HandleInner::Cached { file, .. } => {
                let len = file.metadata().await?.len();
                let pos = file.stream_position().await?;
                Ok(len.saturating_sub(pos))
            }
            HandleInner::LocalWriter { .. } => Ok(0),
            HandleInner::Remote { stream, .. } => stream.available().await.map_err(remote_err),
            HandleInner::Closed => Err(CacheError::InvalidHandle),
        }
    }

    // -- stat-like operations (bridge + metadata cache) ----------------------

    /// Whether `path` exists on the descriptor's filesystem.
    pub async fn exists(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &str,
    ) -> Result<bool, CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        adapter
            .bridge()
            .exists(lease.filesystem(), &adapter.descriptor().key(), path, false)
            .await
            .into_result()
    }

    /// Directory listing, served from the metadata cache after the first
    /// remote call.
    pub async fn list_directory(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &str,
    ) -> Result<Vec<ObjectStatus>, CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        adapter
            .bridge()
            .list_status(lease.filesystem(), &adapter.descriptor().key(), path, false)
            .await
            .into_result()
    }

    /// Single-object stat, served from the parent's cached listing when
    /// available.
    pub async fn path_info(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &str,
    ) -> Result<ObjectStatus, CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        adapter
            .bridge()
            .file_status(lease.filesystem(), &adapter.descriptor().key(), path, false)
            .await
            .into_result()
    }

    /// Block placement (with disk ids where the backend reports them).
    pub async fn block_locations(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &str,
        start: u64,
        len: u64,
    ) -> Result<Vec<BlockLocation>, CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        adapter
            .bridge()
            .block_locations(lease.filesystem(), path, start, len)
            .await
            .into_result()
    }

    // -- namespace operations -------------------------------------------------

    pub async fn create_directory(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &str,
    ) -> Result<(), CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        lease
            .filesystem()
            .create_directory(path)
            .await
            .map_err(remote_err)
    }

    /// Rename on the remote side; cached copies of the old name are dropped.
    pub async fn rename(
        &self,
        descriptor: &FilesystemDescriptor,
        from: &str,
        to: &str,
    ) -> Result<(), CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        lease
            .filesystem()
            .rename(from, to)
            .await
            .map_err(remote_err)?;
        let _ = self.registry.delete_file(descriptor, from, None, true).await;
        self.registry.meta().invalidate(&adapter.descriptor().key(), to);
        Ok(())
    }

    /// Delete on the remote side; cached copies go too.
    pub async fn delete(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &str,
        recursive: bool,
    ) -> Result<(), CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        lease
            .filesystem()
            .delete(path, recursive)
            .await
            .map_err(remote_err)?;
        if recursive {
            let _ = self.registry.delete_path(descriptor, path).await;
        } else {
            let _ = self.registry.delete_file(descriptor, path, None, true).await;
        }
        Ok(())
    }

    /// Copy within one filesystem.
    pub async fn copy(
        &self,
        descriptor: &FilesystemDescriptor,
        from: &str,
        to: &str,
    ) -> Result<(), CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        lease.filesystem().copy(from, to).await.map_err(remote_err)
    }

    /// Copy across filesystems by streaming through this node.
    pub async fn copy_between(
        &self,
        src_descriptor: &FilesystemDescriptor,
        src: &str,
        dst_descriptor: &FilesystemDescriptor,
        dst: &str,
    ) -> Result<(), CacheError> {
        let src_adapter = self.registry.adapter(src_descriptor)?;
        let dst_adapter = self.registry.adapter(dst_descriptor)?;
        let src_lease = src_adapter.lease().await?;
        let dst_lease = dst_adapter.lease().await?;

        let mut reader = src_lease
            .filesystem()
            .open(src, OpenFlags::READ, 0, 0, 0)
            .await
            .map_err(remote_err)?;
        let mut writer = dst_lease
            .filesystem()
            .open(dst, OpenFlags::WRITE | OpenFlags::CREATE, 0, 0, 0)
            .await
            .map_err(remote_err)?;

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let result = async {
            loop {
                let n = reader.read(&mut buffer).await.map_err(remote_err)?;
                if n == 0 {
                    return Ok::<_, CacheError>(());
                }
                let mut written = 0;
                while written < n {
                    written += writer
                        .write(&buffer[written..n])
                        .await
                        .map_err(remote_err)?;
                }
            }
        }
        .await;

        let reader_close = reader.close().await;
        let writer_close = writer.close().await;
        result?;
        reader_close.map_err(remote_err)?;
        writer_close.map_err(remote_err)?;
        Ok(())
    }

    /// Move within one filesystem (rename), or across filesystems as
    /// copy-then-delete.
    pub async fn move_object(
        &self,
        src_descriptor: &FilesystemDescriptor,
        src: &str,
        dst_descriptor: &FilesystemDescriptor,
        dst: &str,
    ) -> Result<(), CacheError> {
        if src_descriptor.key() == dst_descriptor.key() {
            return self.rename(src_descriptor, src, dst).await;
        }
        self.copy_between(src_descriptor, src, dst_descriptor, dst)
            .await?;
        self.delete(src_descriptor, src, false).await
    }

    // -- permissions & capacity -----------------------------------------------

    pub async fn chown(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &str,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> Result<(), CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        lease
            .filesystem()
            .chown(path, owner, group)
            .await
            .map_err(remote_err)?;
        self.registry.meta().invalidate(&adapter.descriptor().key(), path);
        Ok(())
    }

    pub async fn chmod(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &str,
        mode: u16,
    ) -> Result<(), CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        lease
            .filesystem()
            .chmod(path, mode)
            .await
            .map_err(remote_err)?;
        self.registry.meta().invalidate(&adapter.descriptor().key(), path);
        Ok(())
    }

    pub async fn set_replication(
        &self,
        descriptor: &FilesystemDescriptor,
        path: &str,
        replication: i16,
    ) -> Result<(), CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        lease
            .filesystem()
            .set_replication(path, replication)
            .await
            .map_err(remote_err)
    }

    pub async fn get_capacity(
        &self,
        descriptor: &FilesystemDescriptor,
    ) -> Result<u64, CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        lease.filesystem().capacity().await.map_err(remote_err)
    }

    pub async fn get_used(&self, descriptor: &FilesystemDescriptor) -> Result<u64, CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        lease.filesystem().used().await.map_err(remote_err)
    }

    pub async fn get_default_block_size(
        &self,
        descriptor: &FilesystemDescriptor,
    ) -> Result<u64, CacheError> {
        let adapter = self.registry.adapter(descriptor)?;
        let lease = adapter.lease().await?;
        lease
            .filesystem()
            .default_block_size()
            .await
            .map_err(remote_err)
    }
}

impl Drop for DfsFile {
    fn drop(&mut self) {
        if !matches!(self.inner, HandleInner::Closed) {
            // The pin or lease guard embedded in the variant releases itself;
            // remote streams left to the backend's own teardown.
            warn!(handle = self.id, "file handle dropped without close");
        }
    }
}
