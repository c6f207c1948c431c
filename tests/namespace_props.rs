//! Property tests for the local path namespace.
#![allow(clippy::unwrap_used, missing_docs)]

use std::path::Path;

use proptest::prelude::*;

use dfs_cache::fs::{FilesystemDescriptor, FsType};
use dfs_cache::namespace::{local_path, restore};

/// Remote path segments: non-empty, no '/', no NUL.
fn segment() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[^/\u{0}]{1,24}").unwrap()
}

fn remote_path() -> impl Strategy<Value = String> {
    proptest::collection::vec(segment(), 1..6).prop_map(|segments| format!("/{}", segments.join("/")))
}

fn descriptor() -> impl Strategy<Value = FilesystemDescriptor> {
    (
        prop_oneof![
            Just(FsType::Hdfs),
            Just(FsType::S3n),
            Just(FsType::S3a),
            Just(FsType::Tachyon),
        ],
        "[a-z][a-z0-9-]{0,15}",
        0u16..=u16::MAX,
    )
        .prop_map(|(fs_type, host, port)| FilesystemDescriptor::new(fs_type, host, port))
}

proptest! {
    /// The derivation is a pure function: same inputs, same string, anywhere.
    #[test]
    fn derivation_is_deterministic(
        d in descriptor(),
        path in remote_path(),
        transform in proptest::option::of("[ -~]{1,32}"),
    ) {
        let a = local_path(Path::new("/cache"), &d, &path, transform.as_deref());
        let b = local_path(Path::new("/cache"), &d, &path, transform.as_deref());
        prop_assert_eq!(a, b);
    }

    /// Distinct origins never collide.
    #[test]
    fn distinct_paths_do_not_collide(
        d in descriptor(),
        a in remote_path(),
        b in remote_path(),
    ) {
        prop_assume!(a != b);
        let pa = local_path(Path::new("/cache"), &d, &a, None);
        let pb = local_path(Path::new("/cache"), &d, &b, None);
        prop_assert_ne!(pa, pb);
    }

    /// A transform forks the namespace away from the plain artifact.
    #[test]
    fn transform_forks_the_path(
        d in descriptor(),
        path in remote_path(),
        transform in "[ -~]{1,32}",
    ) {
        let plain = local_path(Path::new("/cache"), &d, &path, None);
        let forked = local_path(Path::new("/cache"), &d, &path, Some(&transform));
        prop_assert_ne!(plain, forked);
    }

    /// Every derived path parses back to its origin.
    #[test]
    fn restore_round_trips(
        d in descriptor(),
        path in remote_path(),
    ) {
        let derived = local_path(Path::new("/cache"), &d, &path, None);
        let restored = restore(Path::new("/cache"), &derived).unwrap();
        prop_assert_eq!(restored.fs_type, d.fs_type);
        prop_assert_eq!(restored.host, d.host);
        prop_assert_eq!(restored.port, d.port);
        prop_assert_eq!(restored.remote_path, path);
        prop_assert!(!restored.transformed);
    }

    /// Derived paths stay inside the cache root (escaping defeats `..`).
    #[test]
    fn derived_paths_stay_under_the_root(
        d in descriptor(),
        path in remote_path(),
    ) {
        let derived = local_path(Path::new("/cache"), &d, &path, None);
        prop_assert!(derived.starts_with("/cache"));
        for component in derived.components() {
            prop_assert!(component.as_os_str() != "..");
        }
    }
}
