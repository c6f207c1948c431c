//! An adapter that overlays the host filesystem behind the remote trait.
//!
//! Backs descriptors with no host, and doubles as the reference
//! implementation of the adapter contract for tests: anything the cache can
//! do against HDFS it can do against a scratch directory.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};

use crate::fs::{
    BlockLocation, FilesystemDescriptor, ObjectKind, ObjectStatus, OpenFlags, RemoteConnector,
    RemoteFile, RemoteFilesystem,
};

/// Local filesystem adapter rooted at an optional prefix directory.
///
/// With no root, paths are interpreted verbatim against the host filesystem.
pub struct LocalFs {
    root: Option<PathBuf>,
}

impl LocalFs {
    #[must_use]
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Adapter whose paths are resolved under `root`. Used by tests to fence
    /// the "remote" side into a scratch directory.
    #[must_use]
    pub fn rooted(root: PathBuf) -> Self {
        Self { root: Some(root) }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }

    async fn status_of(&self, logical: &str, resolved: &Path) -> io::Result<ObjectStatus> {
        use std::os::unix::fs::MetadataExt as _;

        let meta = tokio::fs::metadata(resolved).await?;
        let modified_secs = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        Ok(ObjectStatus {
            path: logical.to_owned(),
            kind: if meta.is_dir() {
                ObjectKind::Directory
            } else {
                ObjectKind::File
            },
            size: meta.len(),
            block_size: meta.blksize(),
            replication: 1,
            modified_secs,
            owner: meta.uid().to_string(),
            group: meta.gid().to_string(),
            permissions: (meta.mode() & 0o7777) as u16,
        })
    }
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteFilesystem for LocalFs {
    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        _buf_size: u32,
        _replication: i16,
        _block_size: u64,
    ) -> io::Result<Box<dyn RemoteFile>> {
        let resolved = self.resolve(path);
        if flags.is_write()
            && let Some(parent) = resolved.parent()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let append = flags.contains(OpenFlags::APPEND);
        let file = tokio::fs::OpenOptions::new()
            .read(flags.contains(OpenFlags::READ))
            .write(flags.is_write() && !append)
            .create(flags.is_write())
            .truncate(!append && (flags.contains(OpenFlags::TRUNC) || flags.contains(OpenFlags::WRITE)))
            .append(append)
            .open(&resolved)
            .await?;
        Ok(Box::new(LocalFile { file: Some(file) }))
    }

    async fn exists(&self, path: &str) -> io::Result<bool> {
        tokio::fs::try_exists(self.resolve(path)).await
    }

    async fn file_status(&self, path: &str) -> io::Result<ObjectStatus> {
        let resolved = self.resolve(path);
        self.status_of(path, &resolved).await
    }

    async fn list_status(&self, path: &str) -> io::Result<Vec<ObjectStatus>> {
        let resolved = self.resolve(path);
        let mut entries = tokio::fs::read_dir(&resolved).await?;
        let mut statuses = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let logical = format!(
                "{}/{}",
                path.trim_end_matches('/'),
                name.to_string_lossy()
            );
            statuses.push(self.status_of(&logical, &entry.path()).await?);
        }
        Ok(statuses)
    }

    async fn block_locations(
        &self,
        path: &str,
        start: u64,
        len: u64,
    ) -> io::Result<Vec<BlockLocation>> {
        // A local file is one "block" on one host.
        let status = self.file_status(path).await?;
        let end = status.size.min(start.saturating_add(len));
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(vec![BlockLocation {
            hosts: vec!["localhost".to_owned()],
            offset: start,
            length: end - start,
            disk_ids: Vec::new(),
        }])
    }

    async fn create_directory(&self, path: &str) -> io::Result<()> {
        tokio::fs::create_dir_all(self.resolve(path)).await
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        tokio::fs::rename(self.resolve(from), self.resolve(to)).await
    }

    async fn delete(&self, path: &str, recursive: bool) -> io::Result<()> {
        let resolved = self.resolve(path);
        let meta = tokio::fs::metadata(&resolved).await?;
        if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&resolved).await
            } else {
                tokio::fs::remove_dir(&resolved).await
            }
        } else {
            tokio::fs::remove_file(&resolved).await
        }
    }

    async fn copy(&self, from: &str, to: &str) -> io::Result<()> {
        let to_resolved = self.resolve(to);
        if let Some(parent) = to_resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(self.resolve(from), to_resolved).await.map(|_| ())
    }

    async fn chown(
        &self,
        _path: &str,
        _owner: Option<&str>,
        _group: Option<&str>,
    ) -> io::Result<()> {
        // Ownership changes require name-service lookups we deliberately do
        // not perform for the overlay adapter.
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "chown is not supported by the local adapter",
        ))
    }

    async fn chmod(&self, path: &str, mode: u16) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt as _;
        tokio::fs::set_permissions(self.resolve(path), std::fs::Permissions::from_mode(u32::from(mode)))
            .await
    }

    async fn set_replication(&self, _path: &str, _replication: i16) -> io::Result<()> {
        // Replication is meaningless locally; accept and ignore.
        Ok(())
    }

    async fn capacity(&self) -> io::Result<u64> {
        Ok(u64::MAX)
    }

    async fn used(&self) -> io::Result<u64> {
        Ok(0)
    }

    async fn default_block_size(&self) -> io::Result<u64> {
        Ok(128 * 1024 * 1024)
    }
}

/// Stream over a local file.
struct LocalFile {
    file: Option<tokio::fs::File>,
}

impl LocalFile {
    fn file_mut(&mut self) -> io::Result<&mut tokio::fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("stream already closed"))
    }
}

#[async_trait]
impl RemoteFile for LocalFile {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file_mut()?.read(buf).await
    }

    async fn pread(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file_mut()?;
        let pos = file.stream_position().await?;
        file.seek(io::SeekFrom::Start(offset)).await?;
        let n = file.read(buf).await?;
        file.seek(io::SeekFrom::Start(pos)).await?;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file_mut()?.write(buf).await
    }

    async fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.file_mut()?.seek(io::SeekFrom::Start(pos)).await.map(|_| ())
    }

    async fn tell(&mut self) -> io::Result<u64> {
        self.file_mut()?.stream_position().await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.file_mut()?.flush().await
    }

    async fn available(&mut self) -> io::Result<u64> {
        let file = self.file_mut()?;
        let len = file.metadata().await?.len();
        let pos = file.stream_position().await?;
        Ok(len.saturating_sub(pos))
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

/// Connector producing [`LocalFs`] sessions. Registered for
/// [`FsType::Local`](crate::fs::FsType::Local) by default.
pub struct LocalConnector {
    root: Option<PathBuf>,
}

impl LocalConnector {
    #[must_use]
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Connector whose sessions are fenced under `root`.
    #[must_use]
    pub fn rooted(root: PathBuf) -> Self {
        Self { root: Some(root) }
    }
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteConnector for LocalConnector {
    async fn dial(
        &self,
        _descriptor: &FilesystemDescriptor,
    ) -> io::Result<Arc<dyn RemoteFilesystem>> {
        Ok(match &self.root {
            Some(root) => Arc::new(LocalFs::rooted(root.clone())),
            None => Arc::new(LocalFs::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_read_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = LocalFs::rooted(tmp.path().to_path_buf());

        let mut w = fs
            .open("/a/b.txt", OpenFlags::WRITE | OpenFlags::CREATE, 0, 0, 0)
            .await
            .unwrap();
        w.write(b"hello").await.unwrap();
        w.close().await.unwrap();

        let mut r = fs.open("/a/b.txt", OpenFlags::READ, 0, 0, 0).await.unwrap();
        let mut buf = [0u8; 16];
        let n = r.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn pread_preserves_position() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = LocalFs::rooted(tmp.path().to_path_buf());

        let mut w = fs
            .open("/f", OpenFlags::WRITE | OpenFlags::CREATE, 0, 0, 0)
            .await
            .unwrap();
        w.write(b"0123456789").await.unwrap();
        w.close().await.unwrap();

        let mut r = fs.open("/f", OpenFlags::READ, 0, 0, 0).await.unwrap();
        let mut buf = [0u8; 4];
        let n = r.pread(4, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"4567");
        assert_eq!(r.tell().await.unwrap(), 0, "pread must not move the cursor");
    }

    #[tokio::test]
    async fn list_status_reports_children() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = LocalFs::rooted(tmp.path().to_path_buf());
        for name in ["x", "y"] {
            let mut w = fs
                .open(&format!("/dir/{name}"), OpenFlags::WRITE | OpenFlags::CREATE, 0, 0, 0)
                .await
                .unwrap();
            w.write(b"data").await.unwrap();
            w.close().await.unwrap();
        }

        let mut listing = fs.list_status("/dir").await.unwrap();
        listing.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].path, "/dir/x");
        assert_eq!(listing[0].size, 4);
    }

    #[tokio::test]
    async fn exists_is_tristate_free() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = LocalFs::rooted(tmp.path().to_path_buf());
        assert!(!fs.exists("/nope").await.unwrap());
    }
}
