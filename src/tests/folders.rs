// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::new_fs;
use crate::attrs::XAttrsChanges;
use crate::cryptor::NodeKey;
use crate::error::Error;
use crate::folder::FolderNode;
use crate::fs::WriteFlags;
use crate::kind::{NodeKind, StorageType};
use crate::memory::MemoryStorage;
use crate::node::Node;
use serde_json::json;

#[tokio::test]
async fn test_create_and_read_text() {
    let fs = new_fs().await;

    let flags = WriteFlags {
        create: true,
        exclusive: false,
        truncate: true,
    };
    fs.write_txt_file("/a/b.txt", "hello", flags).await.unwrap();

    let (entries, _) = fs.list_folder("/a").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "b.txt");
    assert_eq!(entries[0].kind, NodeKind::File);

    assert_eq!(fs.read_txt_file("/a/b.txt").await.unwrap(), "hello");
}

#[tokio::test]
async fn test_exclusive_collision() {
    let fs = new_fs().await;
    let flags = WriteFlags {
        create: true,
        exclusive: false,
        truncate: true,
    };
    let version = fs.write_txt_file("/a/b.txt", "hello", flags).await.unwrap();

    let exclusive = WriteFlags {
        create: true,
        exclusive: true,
        truncate: true,
    };
    match fs.write_txt_file("/a/b.txt", "x", exclusive).await {
        Err(Error::AlreadyExists { path }) => assert_eq!(path, "/a/b.txt"),
        other => panic!("expected already-exists, got {other:?}"),
    }

    // Prior version and bytes unchanged.
    let (bytes, v) = fs.read_bytes("/a/b.txt", None, None).await.unwrap();
    assert_eq!(bytes, b"hello");
    assert_eq!(v, version);
}

#[tokio::test]
async fn test_non_empty_folder_delete() {
    let fs = new_fs().await;
    fs.make_folder("/d").await.unwrap();
    fs.write_txt_file("/d/f", "1", WriteFlags::default())
        .await
        .unwrap();

    match fs.delete_folder("/d", false).await {
        Err(Error::NotEmpty { path }) => assert_eq!(path, "/d"),
        other => panic!("expected not-empty, got {other:?}"),
    }

    fs.delete_folder("/d", true).await.unwrap();
    assert!(!fs.check_folder_presence("/d").await.unwrap());
    assert!(!fs.check_file_presence("/d/f").await.unwrap());
}

#[tokio::test]
async fn test_make_folder_creates_intermediates() {
    let fs = new_fs().await;
    fs.make_folder("/x/y/z").await.unwrap();
    assert!(fs.check_folder_presence("/x").await.unwrap());
    assert!(fs.check_folder_presence("/x/y").await.unwrap());
    assert!(fs.check_folder_presence("/x/y/z").await.unwrap());

    // An empty folder exists and lists as empty.
    let (entries, version) = fs.list_folder("/x/y/z").await.unwrap();
    assert!(entries.is_empty());
    assert!(version >= 1);
}

#[tokio::test]
async fn test_kind_mismatch_errors() {
    let fs = new_fs().await;
    fs.write_txt_file("/f", "data", WriteFlags::default())
        .await
        .unwrap();
    fs.make_folder("/d").await.unwrap();

    assert!(matches!(
        fs.list_folder("/f").await,
        Err(Error::NotFolder { .. })
    ));
    assert!(matches!(
        fs.read_bytes("/d", None, None).await,
        Err(Error::IsFolder { .. })
    ));
    assert!(matches!(
        fs.delete_file("/d").await,
        Err(Error::IsFolder { .. })
    ));
    assert!(matches!(
        fs.delete_folder("/f", false).await,
        Err(Error::NotFolder { .. })
    ));
    // Paths through a file fail as not-a-folder.
    assert!(matches!(
        fs.read_bytes("/f/deeper", None, None).await,
        Err(Error::NotFolder { .. })
    ));
}

#[tokio::test]
async fn test_missing_paths() {
    let fs = new_fs().await;
    match fs.read_bytes("/no/such/file", None, None).await {
        Err(Error::NotFound { path }) => assert_eq!(path, "/no/such/file"),
        other => panic!("expected not-found, got {other:?}"),
    }
    match fs.list_folder("/nowhere").await {
        Err(Error::NotFound { path }) => assert_eq!(path, "/nowhere"),
        other => panic!("expected not-found, got {other:?}"),
    }
    assert!(!fs.check_file_presence("/ghost").await.unwrap());
    assert!(!fs.check_folder_presence("/ghost").await.unwrap());
    assert!(!fs.check_link_presence("/ghost").await.unwrap());
}

#[tokio::test]
async fn test_folder_stat_and_xattrs() {
    let fs = new_fs().await;
    fs.make_folder("/d").await.unwrap();

    let stat = fs.stat("/d").await.unwrap();
    assert_eq!(stat.kind, NodeKind::Folder);
    assert_eq!(stat.size, None);
    assert!(stat.version >= 1);
    assert!(stat.attrs.ctime > 0);

    let v = fs
        .update_xattrs("/d", &XAttrsChanges::set_one("purpose", json!("inbox")))
        .await
        .unwrap();
    assert_eq!(v, stat.version + 1);
    assert_eq!(
        fs.get_xattr("/d", "purpose").await.unwrap(),
        Some(json!("inbox"))
    );
}

#[tokio::test]
async fn test_root_stat() {
    let fs = new_fs().await;
    let stat = fs.stat("/").await.unwrap();
    assert_eq!(stat.kind, NodeKind::Folder);

    let (entries, _) = fs.list_folder("/").await.unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_copy_file_carries_bytes_and_xattrs() {
    let fs = new_fs().await;
    fs.write_bytes("/src", b"payload", WriteFlags::default())
        .await
        .unwrap();
    fs.update_xattrs("/src", &XAttrsChanges::set_one("tag", json!("blue")))
        .await
        .unwrap();

    fs.copy_file("/src", "/copies/dst").await.unwrap();

    let (bytes, _) = fs.read_bytes("/copies/dst", None, None).await.unwrap();
    assert_eq!(bytes, b"payload");
    assert_eq!(
        fs.get_xattr("/copies/dst", "tag").await.unwrap(),
        Some(json!("blue"))
    );
    // The copy is a different object: writing it leaves the source.
    fs.write_bytes("/copies/dst", b"changed", WriteFlags::default())
        .await
        .unwrap();
    let (bytes, _) = fs.read_bytes("/src", None, None).await.unwrap();
    assert_eq!(bytes, b"payload");
}

#[tokio::test]
async fn test_copy_folder_merge_semantics() {
    let fs = new_fs().await;
    fs.write_txt_file("/tree/a.txt", "A", WriteFlags::default())
        .await
        .unwrap();
    fs.write_txt_file("/tree/sub/b.txt", "B", WriteFlags::default())
        .await
        .unwrap();

    fs.copy_folder("/tree", "/out", false).await.unwrap();
    assert_eq!(fs.read_txt_file("/out/a.txt").await.unwrap(), "A");
    assert_eq!(fs.read_txt_file("/out/sub/b.txt").await.unwrap(), "B");

    // Without merge, an existing destination refuses.
    assert!(matches!(
        fs.copy_folder("/tree", "/out", false).await,
        Err(Error::AlreadyExists { .. })
    ));

    // With merge, files are overwritten in place.
    fs.write_txt_file("/tree/a.txt", "A2", WriteFlags::default())
        .await
        .unwrap();
    fs.copy_folder("/tree", "/out", true).await.unwrap();
    assert_eq!(fs.read_txt_file("/out/a.txt").await.unwrap(), "A2");
}

#[tokio::test]
async fn test_save_folder_imports_across_filesystems() {
    let src_fs = new_fs().await;
    let dst_fs = new_fs().await;

    src_fs
        .write_txt_file("/msg/body.txt", "message body", WriteFlags::default())
        .await
        .unwrap();
    src_fs
        .write_txt_file("/msg/att/one.bin", "attachment", WriteFlags::default())
        .await
        .unwrap();

    dst_fs
        .save_folder(&src_fs, "/msg", "/received/msg1")
        .await
        .unwrap();

    assert_eq!(
        dst_fs.read_txt_file("/received/msg1/body.txt").await.unwrap(),
        "message body"
    );
    assert_eq!(
        dst_fs
            .read_txt_file("/received/msg1/att/one.bin")
            .await
            .unwrap(),
        "attachment"
    );
}

#[tokio::test]
async fn test_save_folder_rematerializes_links() {
    let src_fs = new_fs().await;
    let dst_fs = new_fs().await;

    src_fs
        .write_txt_file("/msg/data.txt", "payload", WriteFlags::default())
        .await
        .unwrap();
    src_fs
        .write_txt_file("/shared/inner.txt", "inner", WriteFlags::default())
        .await
        .unwrap();
    src_fs.link("/msg/data-ln", "/msg/data.txt").await.unwrap();
    src_fs.link("/msg/shared-ln", "/shared").await.unwrap();

    dst_fs
        .save_folder(&src_fs, "/msg", "/in/msg")
        .await
        .unwrap();

    // The imported links name objects that live in the destination
    // storage, not the source's.
    let src_params = src_fs.read_link("/msg/data-ln").await.unwrap();
    let dst_params = dst_fs.read_link("/in/msg/data-ln").await.unwrap();
    assert_ne!(src_params.target_obj_id(), dst_params.target_obj_id());

    match dst_fs.open_link("/in/msg/data-ln").await.unwrap() {
        Node::File(file) => {
            let (bytes, _) = file.read_bytes(None, None).await.unwrap();
            assert_eq!(bytes, b"payload");
        }
        other => panic!("expected a file, got {other:?}"),
    }

    // A folder target is deep-copied, its content included.
    match dst_fs.open_link("/in/msg/shared-ln").await.unwrap() {
        Node::Folder(folder) => {
            let inner = folder.get_file("inner.txt").await.unwrap();
            let (bytes, _) = inner.read_bytes(None, None).await.unwrap();
            assert_eq!(bytes, b"inner");
        }
        other => panic!("expected a folder, got {other:?}"),
    }

    // Rewriting the source afterwards leaves the imported copy alone.
    src_fs
        .write_txt_file("/msg/data.txt", "changed", WriteFlags::default())
        .await
        .unwrap();
    match dst_fs.open_link("/in/msg/data-ln").await.unwrap() {
        Node::File(file) => {
            let (bytes, _) = file.read_bytes(None, None).await.unwrap();
            assert_eq!(bytes, b"payload");
        }
        other => panic!("expected a file, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sub_tree_walk_exclusive_leaf() {
    let storage = MemoryStorage::new(StorageType::Local);
    let root = FolderNode::open_root(storage, NodeKey::random())
        .await
        .unwrap();
    let parts: Vec<String> = vec!["a".into(), "b".into()];

    root.get_folder_in_sub_tree(&parts, true, false)
        .await
        .unwrap();
    // An existing leaf refuses an exclusive create; intermediates do
    // not.
    assert!(matches!(
        root.get_folder_in_sub_tree(&parts, true, true).await,
        Err(Error::AlreadyExists { .. })
    ));

    // An existing leaf of any kind refuses the exclusive create the
    // same way; only a non-exclusive walk reports the kind mismatch.
    let a = root.get_folder("a").await.unwrap();
    a.create_file("f", true).await.unwrap();
    let file_leaf: Vec<String> = vec!["a".into(), "f".into()];
    assert!(matches!(
        root.get_folder_in_sub_tree(&file_leaf, true, true).await,
        Err(Error::AlreadyExists { .. })
    ));
    assert!(matches!(
        root.get_folder_in_sub_tree(&file_leaf, true, false).await,
        Err(Error::NotFolder { .. })
    ));

    // An empty walk is the folder itself.
    let same = root.get_folder_in_sub_tree(&[], false, false).await.unwrap();
    assert_eq!(same.obj_id(), root.obj_id());
}

#[tokio::test]
async fn test_empty_segments_in_paths_are_discarded() {
    let fs = new_fs().await;
    fs.write_txt_file("/a//b.txt", "x", WriteFlags::default())
        .await
        .unwrap();
    assert_eq!(fs.read_txt_file("//a/b.txt/").await.unwrap(), "x");
}
