// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::{new_fs, new_fs_on};
use crate::error::Error;
use crate::folder::FolderNode;
use crate::fs::WriteFlags;
use crate::kind::{NodeKind, StorageType};
use crate::link::{LinkParams, LinkTarget};
use crate::memory::MemoryStorage;
use crate::node::Node;
use crate::storage::ObjId;

#[tokio::test]
async fn test_link_to_file() {
    let fs = new_fs().await;
    fs.write_txt_file("/docs/report.txt", "findings", WriteFlags::default())
        .await
        .unwrap();

    fs.link("/shortcuts/report", "/docs/report.txt")
        .await
        .unwrap();
    assert!(fs.check_link_presence("/shortcuts/report").await.unwrap());

    let params = fs.read_link("/shortcuts/report").await.unwrap();
    assert!(params.is_file());
    assert_eq!(params.target_name(), "report.txt");
    assert_eq!(params.storage_type, StorageType::Local);

    // The link materializes into a readable file.
    match fs.open_link("/shortcuts/report").await.unwrap() {
        Node::File(file) => {
            let (bytes, _) = file.read_bytes(None, None).await.unwrap();
            assert_eq!(bytes, b"findings");
        }
        other => panic!("expected a file, got {other:?}"),
    }
}

#[tokio::test]
async fn test_link_to_folder_reaches_subtree() {
    let fs = new_fs().await;
    fs.write_txt_file("/proj/src/main.rs", "fn main() {}", WriteFlags::default())
        .await
        .unwrap();

    fs.link("/proj-link", "/proj").await.unwrap();
    match fs.open_link("/proj-link").await.unwrap() {
        Node::Folder(folder) => {
            let (entries, _) = folder.list();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].name, "src");
            assert_eq!(entries[0].kind, NodeKind::Folder);
        }
        other => panic!("expected a folder, got {other:?}"),
    }
}

#[tokio::test]
async fn test_link_kind_errors() {
    let fs = new_fs().await;
    fs.write_txt_file("/f", "x", WriteFlags::default())
        .await
        .unwrap();
    fs.link("/ln", "/f").await.unwrap();

    // read_link on a non-link and file ops on a link.
    assert!(matches!(
        fs.read_link("/f").await,
        Err(Error::NotLink { .. })
    ));
    assert!(matches!(
        fs.read_bytes("/ln", None, None).await,
        Err(Error::NotFile { .. })
    ));
    assert!(matches!(
        fs.delete_file("/ln").await,
        Err(Error::NotFile { .. })
    ));

    fs.delete_link("/ln").await.unwrap();
    assert!(!fs.check_link_presence("/ln").await.unwrap());
}

#[tokio::test]
async fn test_link_nodes_carry_no_xattrs() {
    let fs = new_fs().await;
    fs.write_txt_file("/f", "x", WriteFlags::default())
        .await
        .unwrap();
    fs.link("/ln", "/f").await.unwrap();

    assert!(matches!(
        fs.update_xattrs(
            "/ln",
            &crate::attrs::XAttrsChanges::set_one("a", serde_json::json!(1))
        )
        .await,
        Err(Error::AttrsNotEnabled)
    ));
}

#[tokio::test]
async fn test_share_storage_refuses_link_params() {
    let storage = MemoryStorage::new(StorageType::Share);
    let fs = new_fs_on(storage).await;
    fs.write_txt_file("/f", "x", WriteFlags::default())
        .await
        .unwrap();

    assert!(matches!(
        fs.get_link_params("/f").await,
        Err(Error::NotPermitted { .. })
    ));
}

#[tokio::test]
async fn test_linking_policy_is_an_invariant_error() {
    // A synced storage must not hold a link into a local-only storage.
    let synced = MemoryStorage::new(StorageType::Synced);
    let root = FolderNode::open_root(synced, crate::cryptor::NodeKey::random())
        .await
        .unwrap();

    let params = LinkParams {
        storage_type: StorageType::Local,
        readonly: false,
        target: LinkTarget::File {
            file_name: "f".to_string(),
            obj_id: ObjId::new("local-obj"),
            key: crate::cryptor::NodeKey::random().to_base64(),
        },
    };
    assert!(matches!(
        root.create_link("ln", params).await,
        Err(Error::Invariant { .. })
    ));
}

#[tokio::test]
async fn test_link_survives_in_folder_copy() {
    let fs = new_fs().await;
    fs.write_txt_file("/data/file.txt", "x", WriteFlags::default())
        .await
        .unwrap();
    fs.link("/tree/ln", "/data/file.txt").await.unwrap();

    fs.copy_folder("/tree", "/tree2", false).await.unwrap();
    let copied = fs.read_link("/tree2/ln").await.unwrap();
    let original = fs.read_link("/tree/ln").await.unwrap();
    assert_eq!(copied.target_obj_id(), original.target_obj_id());
}
