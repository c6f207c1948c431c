//! Capability traits for remote filesystem backends.
//!
//! The original plugin surface was an inheritance chain; here it is a pair of
//! object-safe traits. A [`RemoteConnector`] dials descriptors into
//! [`RemoteFilesystem`] instances; the connection pool owns the dialed
//! instances and hands out leases on them.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::fs::{BlockLocation, FilesystemDescriptor, ObjectStatus, OpenFlags};

/// One established client session against a remote filesystem.
///
/// Every method maps 1-to-1 onto a primitive of the backing filesystem API.
/// Implementations must be safe to share between tasks (`&self` methods);
/// per-stream state lives in the [`RemoteFile`] handles they return.
#[async_trait]
pub trait RemoteFilesystem: Send + Sync {
    /// Open a stream to the object at `path`.
    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        buf_size: u32,
        replication: i16,
        block_size: u64,
    ) -> io::Result<Box<dyn RemoteFile>>;

    async fn exists(&self, path: &str) -> io::Result<bool>;

    async fn file_status(&self, path: &str) -> io::Result<ObjectStatus>;

    async fn list_status(&self, path: &str) -> io::Result<Vec<ObjectStatus>>;

    async fn block_locations(
        &self,
        path: &str,
        start: u64,
        len: u64,
    ) -> io::Result<Vec<BlockLocation>>;

    async fn create_directory(&self, path: &str) -> io::Result<()>;

    async fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    async fn delete(&self, path: &str, recursive: bool) -> io::Result<()>;

    async fn copy(&self, from: &str, to: &str) -> io::Result<()>;

    async fn chown(&self, path: &str, owner: Option<&str>, group: Option<&str>) -> io::Result<()>;

    async fn chmod(&self, path: &str, mode: u16) -> io::Result<()>;

    async fn set_replication(&self, path: &str, replication: i16) -> io::Result<()>;

    /// Raw capacity of the filesystem, in bytes.
    async fn capacity(&self) -> io::Result<u64>;

    /// Total size of all stored objects, in bytes.
    async fn used(&self) -> io::Result<u64>;

    async fn default_block_size(&self) -> io::Result<u64>;
}

/// An open stream on one remote object.
#[async_trait]
pub trait RemoteFile: Send {
    /// Read at the current position. Returns the number of bytes read; zero
    /// means end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Positional read; does not move the stream position.
    async fn pread(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write at the current position. Returns the number of bytes written.
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Seek to an absolute offset. Only valid on read streams.
    async fn seek(&mut self, pos: u64) -> io::Result<()>;

    /// Current stream offset.
    async fn tell(&mut self) -> io::Result<u64>;

    async fn flush(&mut self) -> io::Result<()>;

    /// Bytes readable without blocking on the backend.
    async fn available(&mut self) -> io::Result<u64>;

    /// Close the stream. Implementations must tolerate a second call.
    async fn close(&mut self) -> io::Result<()>;
}

/// Factory dialing descriptors into live [`RemoteFilesystem`] sessions.
///
/// One connector is registered per [`FsType`](crate::fs::FsType); the
/// connection pool calls `dial` whenever it has to grow or re-establish a
/// connection.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn dial(&self, descriptor: &FilesystemDescriptor)
    -> io::Result<Arc<dyn RemoteFilesystem>>;
}
