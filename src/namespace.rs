//! Deterministic mapping from remote origins to local cache paths.
//!
//! The local path is a pure function of the remote origin:
//! `root / scheme / host_port / escaped-remote-segments [ / transform tag ]`.
//! No wall clock, pid, or access order participates, so the same origin maps
//! to the same local path on every node of a cluster and across restarts —
//! which is also what lets the cache re-enumerate its contents at startup.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest as _, Sha256};

use crate::fs::{FilesystemDescriptor, FsType};

/// Directory-name tag prefix for transform components. `#` can never appear
/// in an escaped path segment, so the tag is unambiguous when parsing back.
const TRANSFORM_TAG: &str = "t#";

/// Characters that pass through the segment escaper untouched.
fn is_plain(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-')
}

/// Escape one path segment into a filesystem-safe directory name.
///
/// `.` and `..` are escaped wholesale — they would otherwise survive as path
/// navigation and walk out of the cache root.
fn escape_segment(segment: &str) -> String {
    if segment == "." || segment == ".." {
        return segment.bytes().map(|b| format!("%{b:02X}")).collect();
    }
    let mut out = String::with_capacity(segment.len());
    for &byte in segment.as_bytes() {
        if is_plain(byte) {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push_str(&format!("{byte:02X}"));
        }
    }
    out
}

/// Inverse of [`escape_segment`]. Returns `None` on malformed input.
fn unescape_segment(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let value = u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?;
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Short stable digest of a transform command.
fn transform_digest(transform: &str) -> String {
    let digest = Sha256::digest(transform.as_bytes());
    let mut tag = String::with_capacity(TRANSFORM_TAG.len() + 16);
    tag.push_str(TRANSFORM_TAG);
    for byte in &digest[..8] {
        tag.push_str(&format!("{byte:02x}"));
    }
    tag
}

/// Authority directory name for a descriptor: `host_port`, or `local` for
/// the machine-local filesystem.
fn authority_dir(descriptor: &FilesystemDescriptor) -> String {
    if descriptor.is_local() {
        return "local".to_owned();
    }
    format!("{}_{}", escape_segment(&descriptor.host), descriptor.port)
}

/// Compute the local cache path of `(descriptor, remote_path, transform)`.
#[must_use]
pub fn local_path(
    root: &Path,
    descriptor: &FilesystemDescriptor,
    remote_path: &str,
    transform: Option<&str>,
) -> PathBuf {
    let mut path = root.join(descriptor.fs_type.scheme());
    path.push(authority_dir(descriptor));
    for segment in remote_path.split('/').filter(|s| !s.is_empty()) {
        path.push(escape_segment(segment));
    }
    if let Some(transform) = transform.filter(|t| !t.is_empty()) {
        path.push(transform_digest(transform));
    }
    path
}

/// A remote origin recovered from a local cache path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredOrigin {
    pub fs_type: FsType,
    pub host: String,
    pub port: u16,
    pub remote_path: String,
    /// Whether the path carried a transform tag. The command itself is not
    /// recoverable from its digest.
    pub transformed: bool,
}

/// Recover the remote origin of a file found under the cache root at startup.
///
/// Returns `None` for paths that are not inside `root` or do not follow the
/// namespace layout (e.g. stray files a user dropped into the cache area).
#[must_use]
pub fn restore(root: &Path, local: &Path) -> Option<RestoredOrigin> {
    let relative = local.strip_prefix(root).ok()?;
    let mut components = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(os) => os.to_str(),
            _ => None,
        });

    let fs_type = FsType::from_scheme(components.next()?);
    let authority = components.next()?;
    let (host, port) = if authority == "local" {
        (String::new(), 0)
    } else {
        let (host_esc, port_str) = authority.rsplit_once('_')?;
        (unescape_segment(host_esc)?, port_str.parse().ok()?)
    };

    let mut segments = Vec::new();
    let mut transformed = false;
    for component in components {
        if component.starts_with(TRANSFORM_TAG) {
            transformed = true;
            continue;
        }
        segments.push(unescape_segment(component)?);
    }
    if segments.is_empty() {
        return None;
    }

    Some(RestoredOrigin {
        fs_type,
        host,
        port,
        remote_path: format!("/{}", segments.join("/")),
        transformed,
    })
}
