//! Tachyon drain-on-open behavior.
#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;

use common::{MockRemoteFs, tachyon_descriptor, test_registry};
use dfs_cache::fs::tachyon::TachyonFs;
use dfs_cache::fs::{OpenFlags, RemoteFilesystem};
use dfs_cache::FileState;

#[tokio::test]
async fn open_for_read_drains_and_reopens() {
    let fs = MockRemoteFs::new();
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    fs.put("/t/obj", &payload);
    let tachyon = TachyonFs::wrap(Arc::new(fs.clone()));

    let mut handle = tachyon
        .open("/t/obj", OpenFlags::READ, 0, 0, 0)
        .await
        .unwrap();

    // The drain consumed the whole object before the handle was returned.
    assert!(
        fs.read_bytes() >= payload.len() as u64,
        "drain must read at least the remote size"
    );
    assert_eq!(fs.open_count(), 2, "drain stream plus the reopened stream");
    assert_eq!(
        handle.tell().await.unwrap(),
        0,
        "returned handle is a fresh stream at offset 0"
    );

    // And it still serves the full content.
    let mut buf = vec![0u8; payload.len()];
    let mut total = 0;
    loop {
        let n = handle.read(&mut buf[total..]).await.unwrap();
        if n == 0 {
            break;
        }
        total += n;
    }
    assert_eq!(total, payload.len());
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn open_for_write_bypasses_the_drain() {
    let fs = MockRemoteFs::new();
    let tachyon = TachyonFs::wrap(Arc::new(fs.clone()));

    let mut handle = tachyon
        .open("/t/out", OpenFlags::WRITE | OpenFlags::CREATE, 0, 0, 0)
        .await
        .unwrap();
    assert_eq!(fs.open_count(), 1, "no second open for a write stream");
    assert_eq!(fs.read_bytes(), 0, "nothing to drain on a write stream");

    handle.write(b"fresh output").await.unwrap();
    handle.close().await.unwrap();
    assert_eq!(fs.get("/t/out").unwrap(), b"fresh output");
}

#[tokio::test]
async fn read_error_during_drain_closes_and_fails() {
    let fs = MockRemoteFs::new();
    // Object absent: open itself fails and nothing leaks.
    let tachyon = TachyonFs::wrap(Arc::new(fs.clone()));
    assert!(
        tachyon.open("/t/missing", OpenFlags::READ, 0, 0, 0).await.is_err(),
        "missing object must not produce a handle"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tachyon_descriptor_routes_through_the_drain_decorator() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = MockRemoteFs::new();
    let payload = vec![9u8; 4096];
    fs.put("/mem/f", &payload);
    let registry = test_registry(&tmp, &fs, |_| {}).await;
    registry.configure_filesystem(&tachyon_descriptor()).unwrap();

    let file = registry
        .open_cached(&tachyon_descriptor(), "/mem/f", None)
        .await
        .unwrap();
    assert_eq!(file.state(), FileState::Ready);
    // Drain pass plus the loader's own consumption of the reopened stream.
    assert!(fs.read_bytes() >= 2 * payload.len() as u64);
    assert_eq!(fs.open_count(), 2);

    let on_disk = tokio::fs::read(file.local_path()).await.unwrap();
    assert_eq!(on_disk, payload);
}
