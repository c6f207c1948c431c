//! Tachyon specialization of the remote adapter.
//!
//! Tachyon only promotes an object into its in-memory tier when a reader
//! consumes the stream to EOF and closes it. Opening a file for read must
//! therefore drain it once, close (this commits the server-side cache), and
//! hand the caller a freshly reopened stream at offset 0. Writes pass
//! straight through.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::fs::{
    BlockLocation, FilesystemDescriptor, ObjectStatus, OpenFlags, RemoteConnector, RemoteFile,
    RemoteFilesystem,
};

/// Size of the scratch buffer used to drain the remote stream.
const DRAIN_BUFFER_SIZE: usize = 6_684_672;

/// Decorator forcing server-side caching on open-for-read.
pub struct TachyonFs {
    inner: Arc<dyn RemoteFilesystem>,
}

impl TachyonFs {
    #[must_use]
    pub fn wrap(inner: Arc<dyn RemoteFilesystem>) -> Self {
        Self { inner }
    }

    /// Read `stream` to EOF, discarding bytes. Returns the byte count.
    async fn drain(stream: &mut Box<dyn RemoteFile>) -> io::Result<u64> {
        let mut buffer = vec![0u8; DRAIN_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = stream.read(&mut buffer).await?;
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
        }
    }
}

#[async_trait]
impl RemoteFilesystem for TachyonFs {
    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        buf_size: u32,
        replication: i16,
        block_size: u64,
    ) -> io::Result<Box<dyn RemoteFile>> {
        let mut stream = self
            .inner
            .open(path, flags, buf_size, replication, block_size)
            .await?;
        if flags.is_write() {
            // No caching to trigger on a write stream.
            return Ok(stream);
        }

        match Self::drain(&mut stream).await {
            Ok(bytes) => {
                // Closing the fully-consumed stream is what commits the
                // object into the server-side cache.
                stream.close().await?;
                tracing::debug!(path, bytes, "drained remote stream to force caching");
            }
            Err(e) => {
                warn!(path, error = ?e, "remote stream drain hit an i/o error");
                if let Err(close_err) = stream.close().await {
                    warn!(path, error = ?close_err, "failed to close drained stream");
                }
                return Err(e);
            }
        }

        // Reopen with the original flags; the caller gets a stream at offset 0.
        self.inner
            .open(path, flags, buf_size, replication, block_size)
            .await
    }

    async fn exists(&self, path: &str) -> io::Result<bool> {
        self.inner.exists(path).await
    }

    async fn file_status(&self, path: &str) -> io::Result<ObjectStatus> {
        self.inner.file_status(path).await
    }

    async fn list_status(&self, path: &str) -> io::Result<Vec<ObjectStatus>> {
        self.inner.list_status(path).await
    }

    async fn block_locations(
        &self,
        path: &str,
        start: u64,
        len: u64,
    ) -> io::Result<Vec<BlockLocation>> {
        self.inner.block_locations(path, start, len).await
    }

    async fn create_directory(&self, path: &str) -> io::Result<()> {
        self.inner.create_directory(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        self.inner.rename(from, to).await
    }

    async fn delete(&self, path: &str, recursive: bool) -> io::Result<()> {
        self.inner.delete(path, recursive).await
    }

    async fn copy(&self, from: &str, to: &str) -> io::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn chown(&self, path: &str, owner: Option<&str>, group: Option<&str>) -> io::Result<()> {
        self.inner.chown(path, owner, group).await
    }

    async fn chmod(&self, path: &str, mode: u16) -> io::Result<()> {
        self.inner.chmod(path, mode).await
    }

    async fn set_replication(&self, path: &str, replication: i16) -> io::Result<()> {
        self.inner.set_replication(path, replication).await
    }

    async fn capacity(&self) -> io::Result<u64> {
        self.inner.capacity().await
    }

    async fn used(&self) -> io::Result<u64> {
        self.inner.used().await
    }

    async fn default_block_size(&self) -> io::Result<u64> {
        self.inner.default_block_size().await
    }
}

/// Connector decorator: dials through the wrapped connector, then wraps the
/// session in [`TachyonFs`].
pub struct TachyonConnector {
    inner: Arc<dyn RemoteConnector>,
}

impl TachyonConnector {
    #[must_use]
    pub fn wrap(inner: Arc<dyn RemoteConnector>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl RemoteConnector for TachyonConnector {
    async fn dial(
        &self,
        descriptor: &FilesystemDescriptor,
    ) -> io::Result<Arc<dyn RemoteFilesystem>> {
        let session = self.inner.dial(descriptor).await?;
        Ok(Arc::new(TachyonFs::wrap(session)))
    }
}
