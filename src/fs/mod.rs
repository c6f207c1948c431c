//! Remote filesystem generalizations.
//!
//! The cache itself is domain-agnostic: everything it knows about a remote
//! filesystem flows through the [`RemoteFilesystem`] capability trait and the
//! small value types in this module. Concrete backends (HDFS, S3, Tachyon)
//! plug in behind a [`RemoteConnector`]; the [`local`] adapter covers the
//! degenerate case of a descriptor with no host.

pub mod local;
mod remote;
pub mod tachyon;

pub use remote::{RemoteConnector, RemoteFile, RemoteFilesystem};

use std::fmt;

use bitflags::bitflags;
use serde::Deserialize;

/// Supported remote filesystem families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsType {
    /// The machine-local filesystem (descriptor with no host).
    Local,
    Hdfs,
    S3n,
    S3a,
    Tachyon,
    /// Placeholder resolved against `fs_default_name` before first use.
    DefaultFromConfig,
    Other,
}

impl FsType {
    /// URI scheme string for this filesystem family.
    #[must_use]
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Local => "file",
            Self::Hdfs => "hdfs",
            Self::S3n => "s3n",
            Self::S3a => "s3a",
            Self::Tachyon => "tachyon",
            Self::DefaultFromConfig => "default",
            Self::Other => "other",
        }
    }

    /// Inverse of [`scheme`](Self::scheme). Unknown schemes map to `Other`.
    #[must_use]
    pub fn from_scheme(scheme: &str) -> Self {
        match scheme {
            "file" => Self::Local,
            "hdfs" => Self::Hdfs,
            "s3n" => Self::S3n,
            "s3a" => Self::S3a,
            "tachyon" => Self::Tachyon,
            "default" => Self::DefaultFromConfig,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Connection details for one remote filesystem, as configured by the engine.
///
/// Routing identity is `(fs_type, host)` — the port participates in URI
/// construction but not in routing. A descriptor with an empty host denotes
/// the local filesystem; `host == "default"` with port 0 is resolved lazily
/// against the ambient configuration and rewritten in place before first use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemDescriptor {
    pub fs_type: FsType,
    pub host: String,
    pub port: u16,
    /// Opaque credentials blob handed to the backend connector.
    pub credentials: Option<String>,
    /// Key/user under which the credentials apply.
    pub credentials_key: Option<String>,
}

/// Routing identity of a descriptor: `(fs_type, host)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    pub fs_type: FsType,
    pub host: String,
}

impl FilesystemDescriptor {
    /// Descriptor for a remote filesystem at `host:port`.
    #[must_use]
    pub fn new(fs_type: FsType, host: impl Into<String>, port: u16) -> Self {
        Self {
            fs_type,
            host: host.into(),
            port,
            credentials: None,
            credentials_key: None,
        }
    }

    /// Descriptor denoting the machine-local filesystem.
    #[must_use]
    pub fn local() -> Self {
        Self::new(FsType::Local, "", 0)
    }

    /// Descriptor that must be resolved against `fs_default_name` before use.
    #[must_use]
    pub fn default_from_config() -> Self {
        Self::new(FsType::DefaultFromConfig, "default", 0)
    }

    /// Parse a `scheme://host:port` URI into a descriptor. The path part, if
    /// any, is ignored — descriptors identify filesystems, not objects.
    #[must_use]
    pub fn from_uri(uri: &str) -> Option<Self> {
        let (scheme, rest) = uri.split_once("://")?;
        let authority = rest.split('/').next().unwrap_or(rest);
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h, p.parse::<u16>().ok()?),
            None => (authority, 0),
        };
        Some(Self::new(FsType::from_scheme(scheme), host, port))
    }

    /// Whether this descriptor denotes the local filesystem.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.host.is_empty() || self.fs_type == FsType::Local
    }

    /// Whether this descriptor still awaits resolution from configuration.
    #[must_use]
    pub fn needs_resolution(&self) -> bool {
        self.host == "default" && self.port == 0
    }

    /// Routing identity of this descriptor.
    #[must_use]
    pub fn key(&self) -> DescriptorKey {
        DescriptorKey {
            fs_type: self.fs_type,
            host: self.host.clone(),
        }
    }

    /// `scheme://host:port` authority string for this descriptor.
    #[must_use]
    pub fn uri(&self) -> String {
        if self.is_local() {
            return format!("{}://", FsType::Local.scheme());
        }
        format!("{}://{}:{}", self.fs_type.scheme(), self.host, self.port)
    }
}

impl fmt::Display for FilesystemDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Kind of a remote filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Directory,
}

/// Metadata of one remote object, as reported by a `file_status`/`list_status`
/// call. Mirrors the stat surface of the backing filesystems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStatus {
    /// Path of the object within its filesystem.
    pub path: String,
    pub kind: ObjectKind,
    pub size: u64,
    pub block_size: u64,
    pub replication: i16,
    /// Modification time, seconds since the epoch.
    pub modified_secs: i64,
    pub owner: String,
    pub group: String,
    /// Unix permission bits.
    pub permissions: u16,
}

/// Physical placement of one block of a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocation {
    /// Hostnames holding a replica of this block.
    pub hosts: Vec<String>,
    pub offset: u64,
    pub length: u64,
    /// Volume/disk identifiers per replica, when the backend exposes them.
    pub disk_ids: Vec<String>,
}

bitflags! {
    /// Open mode for [`RemoteFilesystem::open`] and the mediator handle API.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const APPEND = 1 << 2;
        const CREATE = 1 << 3;
        const TRUNC  = 1 << 4;
    }
}

impl OpenFlags {
    /// Whether this mode mutates the target object.
    #[must_use]
    pub fn is_write(self) -> bool {
        self.intersects(Self::WRITE | Self::APPEND | Self::CREATE | Self::TRUNC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_round_trips_through_from_uri() {
        let d = FilesystemDescriptor::new(FsType::Hdfs, "nn1", 8020);
        let parsed = FilesystemDescriptor::from_uri(&d.uri()).unwrap();
        assert_eq!(parsed.fs_type, FsType::Hdfs);
        assert_eq!(parsed.host, "nn1");
        assert_eq!(parsed.port, 8020);
    }

    #[test]
    fn from_uri_ignores_path_component() {
        let parsed = FilesystemDescriptor::from_uri("s3n://bucket:0/a/b/c").unwrap();
        assert_eq!(parsed.fs_type, FsType::S3n);
        assert_eq!(parsed.host, "bucket");
    }

    #[test]
    fn local_descriptor_has_no_host() {
        let d = FilesystemDescriptor::local();
        assert!(d.is_local());
        assert!(!d.needs_resolution());
    }

    #[test]
    fn default_descriptor_needs_resolution() {
        assert!(FilesystemDescriptor::default_from_config().needs_resolution());
    }

    #[test]
    fn write_modes_are_write() {
        assert!(OpenFlags::WRITE.is_write());
        assert!((OpenFlags::CREATE | OpenFlags::WRITE).is_write());
        assert!(!OpenFlags::READ.is_write());
    }
}
