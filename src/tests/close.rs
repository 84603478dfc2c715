// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::new_fs;
use crate::error::Error;
use crate::fs::WriteFlags;
use crate::kind::StorageType;
use crate::memory::MemoryStorage;

#[tokio::test]
async fn test_every_operation_fails_after_close() {
    let fs = new_fs().await;
    fs.write_txt_file("/f", "x", WriteFlags::default())
        .await
        .unwrap();

    fs.close();
    assert!(fs.is_closed());

    match fs.read_bytes("/f", None, None).await {
        Err(Error::StorageClosed { path }) => assert_eq!(path, "/f"),
        other => panic!("expected storage-closed, got {other:?}"),
    }
    assert!(matches!(
        fs.write_txt_file("/f", "y", WriteFlags::default()).await,
        Err(Error::StorageClosed { .. })
    ));
    assert!(matches!(
        fs.list_folder("/").await,
        Err(Error::StorageClosed { .. })
    ));
    assert!(matches!(
        fs.make_folder("/d").await,
        Err(Error::StorageClosed { .. })
    ));
    assert!(matches!(
        fs.stat("/f").await,
        Err(Error::StorageClosed { .. })
    ));
    assert!(matches!(
        fs.delete_file("/f").await,
        Err(Error::StorageClosed { .. })
    ));
    assert!(matches!(
        fs.move_entry("/f", "/g").await,
        Err(Error::StorageClosed { .. })
    ));
    assert!(matches!(
        fs.check_file_presence("/f").await,
        Err(Error::StorageClosed { .. })
    ));
    assert!(matches!(
        fs.watch_tree("/", |_ev| {}).await,
        Err(Error::StorageClosed { .. })
    ));
    assert!(matches!(
        fs.readonly_sub_root("/").await,
        Err(Error::StorageClosed { .. })
    ));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let fs = new_fs().await;
    fs.close();
    fs.close();
    assert!(fs.is_closed());
}

#[tokio::test]
async fn test_close_does_not_close_the_storage() {
    let storage = MemoryStorage::new(StorageType::Local);
    let root_key = crate::cryptor::NodeKey::random();
    let fs = crate::fs::FS::open(storage.clone(), root_key.clone())
        .await
        .unwrap();
    fs.write_txt_file("/kept", "alive", WriteFlags::default())
        .await
        .unwrap();
    fs.close();

    // The storage still serves a fresh view opened with the same root
    // key; only the closed view is gone.
    let reopened = crate::fs::FS::open(storage, root_key).await.unwrap();
    assert_eq!(reopened.read_txt_file("/kept").await.unwrap(), "alive");
}

#[tokio::test]
async fn test_close_ends_watches() {
    let fs = new_fs().await;
    fs.make_folder("/watched").await.unwrap();

    let seen = std::sync::Arc::new(std::sync::Mutex::new(0usize));
    let seen_in = seen.clone();
    let handle = fs
        .watch_tree("/watched", move |_ev| {
            *seen_in.lock().unwrap() += 1;
        })
        .await
        .unwrap();

    fs.close();
    // Give the watch task a moment to observe the close signal.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!handle.is_detached()); // close, not detach, ended it

    // Writes through another view do not reach the closed watcher.
    let count_before = *seen.lock().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), count_before);
}
