// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The filesystem root: path-rooted operations over one mounted folder.
//!
//! Paths are POSIX-style, split on `/` with empty segments discarded;
//! `.` and `..` are not resolved, callers pass canonical paths. Every
//! error leaving this module carries the path the caller used.

use crate::attrs::{CommonAttrs, XAttrs, XAttrsChanges};
use crate::cryptor::NodeKey;
use crate::error::{Error, Result};
use crate::events::{spawn_node_watch, spawn_tree_watch, Observer, TreeEvent, WatchHandle};
use crate::file::{FileByteSink, FileByteSrc, FileNode};
use crate::folder::FolderNode;
use crate::kind::NodeKind;
use crate::link::{LinkParams, LinkTarget};
use crate::node::Node;
use crate::path::{join_path, split_path};
use crate::storage::{ListingEntry, ObjEvent, Storage};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Flags of a path-addressed write.
#[derive(Debug, Clone, Copy)]
pub struct WriteFlags {
    /// Create the file (and missing parent folders) when absent.
    pub create: bool,
    /// Fail with `already-exists` when the file is already there.
    pub exclusive: bool,
    /// Start from an empty base instead of the current content.
    pub truncate: bool,
}

impl Default for WriteFlags {
    fn default() -> Self {
        WriteFlags {
            create: true,
            exclusive: false,
            truncate: true,
        }
    }
}

/// What `stat` reports for one node.
#[derive(Debug, Clone)]
pub struct Stat {
    pub kind: NodeKind,
    /// File content length; `None` for folders and links.
    pub size: Option<u64>,
    pub version: u64,
    pub attrs: CommonAttrs,
    pub xattrs: XAttrs,
}

/// A mounted, path-addressed view over one folder of a storage.
///
/// Sub-roots derived with [`FS::readonly_sub_root`] and
/// [`FS::writable_sub_root`] are independent `FS` values sharing the
/// storage; closing one does not close the others, and closing any of
/// them never closes the storage itself.
pub struct FS {
    storage: Arc<dyn Storage>,
    root: FolderNode,
    writable: bool,
    close_tx: watch::Sender<bool>,
}

impl FS {
    /// Mount the storage's root folder, creating its first version with
    /// the caller-supplied root key when the storage is empty.
    pub async fn open(storage: Arc<dyn Storage>, root_key: NodeKey) -> Result<FS> {
        let root = FolderNode::open_root(storage.clone(), root_key).await?;
        Ok(Self::from_root(storage, root, true))
    }

    fn from_root(storage: Arc<dyn Storage>, root: FolderNode, writable: bool) -> FS {
        let (close_tx, _) = watch::channel(false);
        FS {
            storage,
            root,
            writable,
            close_tx,
        }
    }

    /// Stop this view. Outstanding watches end; already-scheduled
    /// writes run to completion; every later call fails with
    /// `storage-closed`. A second close is a no-op. The underlying
    /// storage stays open.
    pub fn close(&self) {
        _ = self.close_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn check_open(&self, path: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::storage_closed(path));
        }
        Ok(())
    }

    fn check_writable(&self, path: &str) -> Result<()> {
        self.check_open(path)?;
        if !self.writable {
            return Err(Error::not_permitted(path));
        }
        Ok(())
    }

    async fn folder_at(&self, parts: &[String], full: &str) -> Result<FolderNode> {
        self.root
            .get_folder_in_sub_tree(parts, false, false)
            .await
            .map_err(|e| e.with_path(full))
    }

    async fn node_at(&self, path: &str) -> Result<Node> {
        let parts = split_path(path);
        if parts.is_empty() {
            return Ok(Node::Folder(self.root.clone()));
        }
        let (dir_parts, leaf) = parts.split_at(parts.len() - 1);
        let parent = self.folder_at(dir_parts, path).await?;
        parent
            .get_node(&leaf[0])
            .await
            .map_err(|e| e.with_path(path))
    }

    async fn node_at_opt(&self, path: &str) -> Result<Option<Node>> {
        match self.node_at(path).await {
            Ok(node) => Ok(Some(node)),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolve or create the file a write is addressed to.
    async fn file_for_write(&self, path: &str, flags: &WriteFlags) -> Result<(FileNode, bool)> {
        let parts = split_path(path);
        if parts.is_empty() {
            return Err(Error::is_folder(path));
        }
        let (dir_parts, leaf) = parts.split_at(parts.len() - 1);
        let name = &leaf[0];
        let parent = self
            .root
            .get_folder_in_sub_tree(dir_parts, flags.create, false)
            .await
            .map_err(|e| e.with_path(path))?;
        match parent
            .get_node_opt(name)
            .await
            .map_err(|e| e.with_path(path))?
        {
            None => {
                if !flags.create {
                    return Err(Error::not_found(path));
                }
                let file = parent
                    .create_file(name, false)
                    .await
                    .map_err(|e| e.with_path(path))?;
                Ok((file, true))
            }
            Some(Node::File(file)) => {
                if flags.exclusive {
                    return Err(Error::already_exists(path));
                }
                Ok((file, false))
            }
            Some(Node::Folder(_)) => Err(Error::is_folder(path)),
            Some(Node::Link(_)) => Err(Error::not_file(path)),
        }
    }

    // ---- folders ----

    /// Create a folder, with missing intermediate folders.
    pub async fn make_folder(&self, path: &str) -> Result<()> {
        self.check_writable(path)?;
        let parts = split_path(path);
        self.root
            .get_folder_in_sub_tree(&parts, true, false)
            .await
            .map_err(|e| e.with_path(path))?;
        Ok(())
    }

    /// Delete a folder; a non-empty one needs `remove_content`.
    pub async fn delete_folder(&self, path: &str, remove_content: bool) -> Result<()> {
        self.check_writable(path)?;
        let parts = split_path(path);
        if parts.is_empty() {
            return Err(Error::not_permitted(path));
        }
        let (dir_parts, leaf) = parts.split_at(parts.len() - 1);
        let parent = self.folder_at(dir_parts, path).await?;
        let node = parent
            .get_node(&leaf[0])
            .await
            .map_err(|e| e.with_path(path))?;
        if !matches!(node, Node::Folder(_)) {
            return Err(Error::not_folder(path));
        }
        parent
            .remove_child(&leaf[0], remove_content)
            .await
            .map_err(|e| e.with_path(path))
    }

    pub async fn list_folder(&self, path: &str) -> Result<(Vec<ListingEntry>, u64)> {
        self.check_open(path)?;
        let parts = split_path(path);
        let folder = self.folder_at(&parts, path).await?;
        Ok(folder.list())
    }

    // ---- files ----

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        self.check_writable(path)?;
        self.delete_leaf(path, NodeKind::File).await
    }

    pub async fn delete_link(&self, path: &str) -> Result<()> {
        self.check_writable(path)?;
        self.delete_leaf(path, NodeKind::Link).await
    }

    async fn delete_leaf(&self, path: &str, kind: NodeKind) -> Result<()> {
        let parts = split_path(path);
        if parts.is_empty() {
            return Err(Error::not_permitted(path));
        }
        let (dir_parts, leaf) = parts.split_at(parts.len() - 1);
        let parent = self.folder_at(dir_parts, path).await?;
        let node = parent
            .get_node(&leaf[0])
            .await
            .map_err(|e| e.with_path(path))?;
        match (kind, &node) {
            (NodeKind::File, Node::File(_)) | (NodeKind::Link, Node::Link(_)) => {}
            (NodeKind::File, Node::Folder(_)) => return Err(Error::is_folder(path)),
            (NodeKind::File, _) => return Err(Error::not_file(path)),
            (NodeKind::Link, _) => return Err(Error::not_link(path)),
            (NodeKind::Folder, _) => return Err(Error::invariant("delete_leaf on folder kind")),
        }
        parent
            .remove_child(&leaf[0], false)
            .await
            .map_err(|e| e.with_path(path))
    }

    /// Read `[start, min(end, size))` of a file with the version the
    /// bytes belong to.
    pub async fn read_bytes(
        &self,
        path: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<(Vec<u8>, u64)> {
        self.check_open(path)?;
        let file = self.file_at(path).await?;
        file.read_bytes(start, end)
            .await
            .map_err(|e| e.with_path(path))
    }

    async fn file_at(&self, path: &str) -> Result<FileNode> {
        match self.node_at(path).await? {
            Node::File(file) => Ok(file),
            Node::Folder(_) => Err(Error::is_folder(path)),
            Node::Link(_) => Err(Error::not_file(path)),
        }
    }

    /// Write a complete file in one call. Returns the new version.
    pub async fn write_bytes(&self, path: &str, bytes: &[u8], flags: WriteFlags) -> Result<u64> {
        self.check_writable(path)?;
        let (file, created) = self.file_for_write(path, &flags).await?;
        if flags.truncate || created {
            return file
                .save(bytes, None)
                .await
                .map_err(|e| e.with_path(path));
        }
        // Overwrite from the start, keeping any tail beyond the new
        // bytes.
        let (mut sink, _version) = file
            .write_sink(false, None, None)
            .await
            .map_err(|e| e.with_path(path))?;
        if let Err(e) = sink.write(bytes).await {
            return sink.done(Some(e)).await.map_err(|e| e.with_path(path));
        }
        sink.done(None).await.map_err(|e| e.with_path(path))
    }

    pub async fn read_txt_file(&self, path: &str) -> Result<String> {
        let (bytes, _) = self.read_bytes(path, None, None).await?;
        String::from_utf8(bytes).map_err(|e| Error::parsing(path, e))
    }

    pub async fn write_txt_file(&self, path: &str, txt: &str, flags: WriteFlags) -> Result<u64> {
        self.write_bytes(path, txt.as_bytes(), flags).await
    }

    pub async fn read_json_file(&self, path: &str) -> Result<serde_json::Value> {
        let (bytes, _) = self.read_bytes(path, None, None).await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::parsing(path, e))
    }

    pub async fn write_json_file(
        &self,
        path: &str,
        json: &serde_json::Value,
        flags: WriteFlags,
    ) -> Result<u64> {
        let bytes = serde_json::to_vec(json)
            .map_err(|e| Error::invariant(format!("json encoding: {e}")))?;
        self.write_bytes(path, &bytes, flags).await
    }

    /// Lazy byte source over a file, with the observed version.
    pub async fn get_byte_src(&self, path: &str) -> Result<(FileByteSrc, u64)> {
        self.check_open(path)?;
        let file = self.file_at(path).await?;
        file.read_src().await.map_err(|e| e.with_path(path))
    }

    /// Streaming write sink and the version it will produce.
    ///
    /// When `current_version` is given and is not the live version the
    /// call fails with `version-mismatch` before any byte is written.
    pub async fn get_byte_sink(
        &self,
        path: &str,
        flags: WriteFlags,
        current_version: Option<u64>,
    ) -> Result<(FileByteSink, u64)> {
        self.check_writable(path)?;
        let (file, _created) = self.file_for_write(path, &flags).await?;
        file.write_sink(flags.truncate, current_version, None)
            .await
            .map_err(|e| e.with_path(path))
    }

    // ---- moving and copying ----

    /// Move or rename. Source-side errors carry the source path,
    /// destination-side errors the destination path.
    pub async fn move_entry(&self, src: &str, dst: &str) -> Result<()> {
        self.check_writable(src)?;
        let src_parts = split_path(src);
        let dst_parts = split_path(dst);
        if src_parts.is_empty() {
            return Err(Error::not_permitted(src));
        }
        if dst_parts.is_empty() {
            return Err(Error::already_exists(dst));
        }
        let (src_dir, src_leaf) = src_parts.split_at(src_parts.len() - 1);
        let (dst_dir, dst_leaf) = dst_parts.split_at(dst_parts.len() - 1);

        let src_parent = self.folder_at(src_dir, src).await?;
        if !src_parent.has_child(&src_leaf[0]) {
            return Err(Error::not_found(src));
        }
        let dst_parent = self
            .root
            .get_folder_in_sub_tree(dst_dir, false, false)
            .await
            .map_err(|e| e.with_path(dst))?;

        src_parent
            .move_child_to(&src_leaf[0], &dst_parent, &dst_leaf[0])
            .await
            .map_err(|e| match e {
                Error::NotFound { .. } => Error::not_found(src),
                Error::AlreadyExists { .. } => Error::already_exists(dst),
                other => other.with_path(dst),
            })
    }

    /// Copy one file's bytes and xattrs within this filesystem.
    pub async fn copy_file(&self, src: &str, dst: &str) -> Result<u64> {
        self.check_writable(dst)?;
        transfer_file(self, src, self, dst, WriteFlags::default()).await
    }

    /// Copy a subtree. Without `merge_and_overwrite` an existing
    /// destination entry fails the copy; with it, folders merge and
    /// files are overwritten.
    pub async fn copy_folder(&self, src: &str, dst: &str, merge_and_overwrite: bool) -> Result<()> {
        self.check_writable(dst)?;
        // The source listing is snapshotted before any write, so
        // copying into a subtree of itself cannot recurse forever.
        transfer_folder(
            self,
            src.to_string(),
            self,
            dst.to_string(),
            merge_and_overwrite,
            0,
        )
        .await
    }

    /// Import one file from another filesystem view.
    pub async fn save_file(&self, src_fs: &FS, src: &str, dst: &str) -> Result<u64> {
        self.check_writable(dst)?;
        src_fs.check_open(src)?;
        transfer_file(src_fs, src, self, dst, WriteFlags::default()).await
    }

    /// Import a subtree from another filesystem view.
    pub async fn save_folder(&self, src_fs: &FS, src: &str, dst: &str) -> Result<()> {
        self.check_writable(dst)?;
        src_fs.check_open(src)?;
        transfer_folder(src_fs, src.to_string(), self, dst.to_string(), false, 0).await
    }

    // ---- stat, presence, attributes ----

    pub async fn stat(&self, path: &str) -> Result<Stat> {
        self.check_open(path)?;
        let node = self.node_at(path).await?;
        Ok(match node {
            Node::File(f) => Stat {
                kind: NodeKind::File,
                size: Some(f.size()),
                version: f.version(),
                attrs: f.attrs(),
                xattrs: f.xattrs(),
            },
            Node::Folder(d) => Stat {
                kind: NodeKind::Folder,
                size: None,
                version: d.version(),
                attrs: d.attrs(),
                xattrs: d.xattrs(),
            },
            Node::Link(l) => Stat {
                kind: NodeKind::Link,
                size: None,
                version: l.version(),
                attrs: l.core().attrs(),
                xattrs: l.core().xattrs(),
            },
        })
    }

    pub async fn check_file_presence(&self, path: &str) -> Result<bool> {
        self.check_open(path)?;
        Ok(matches!(self.node_at_opt(path).await?, Some(Node::File(_))))
    }

    pub async fn check_folder_presence(&self, path: &str) -> Result<bool> {
        self.check_open(path)?;
        Ok(matches!(
            self.node_at_opt(path).await?,
            Some(Node::Folder(_))
        ))
    }

    pub async fn check_link_presence(&self, path: &str) -> Result<bool> {
        self.check_open(path)?;
        Ok(matches!(self.node_at_opt(path).await?, Some(Node::Link(_))))
    }

    /// Apply an xattr change set to the node at `path`; removals then
    /// sets, one version bump. Returns the new version.
    pub async fn update_xattrs(&self, path: &str, changes: &XAttrsChanges) -> Result<u64> {
        self.check_writable(path)?;
        match self.node_at(path).await? {
            Node::File(f) => f
                .update_xattrs(changes)
                .await
                .map_err(|e| e.with_path(path)),
            Node::Folder(d) => d
                .update_xattrs(changes)
                .await
                .map_err(|e| e.with_path(path)),
            Node::Link(_) => Err(Error::AttrsNotEnabled),
        }
    }

    pub async fn get_xattr(&self, path: &str, name: &str) -> Result<Option<serde_json::Value>> {
        let stat = self.stat(path).await?;
        Ok(stat.xattrs.get(name).cloned())
    }

    pub async fn list_xattrs(&self, path: &str) -> Result<Vec<String>> {
        let stat = self.stat(path).await?;
        Ok(stat.xattrs.list())
    }

    // ---- links ----

    /// Link parameters of the file or folder at `path`.
    pub async fn get_link_params(&self, path: &str) -> Result<LinkParams> {
        self.check_open(path)?;
        match self.node_at(path).await? {
            Node::File(f) => f.get_link_params().map_err(|e| e.with_path(path)),
            Node::Folder(d) => d.get_link_params().map_err(|e| e.with_path(path)),
            Node::Link(_) => Err(Error::not_file(path)),
        }
    }

    /// The parameters stored in the link node at `path`.
    pub async fn read_link(&self, path: &str) -> Result<LinkParams> {
        self.check_open(path)?;
        match self.node_at(path).await? {
            Node::Link(l) => Ok(l.link_params()),
            _ => Err(Error::not_link(path)),
        }
    }

    /// Create a link at `path` to the file or folder at `target`.
    pub async fn link(&self, path: &str, target: &str) -> Result<()> {
        self.check_writable(path)?;
        let params = self.get_link_params(target).await?;
        let parts = split_path(path);
        if parts.is_empty() {
            return Err(Error::already_exists(path));
        }
        let (dir_parts, leaf) = parts.split_at(parts.len() - 1);
        let parent = self.folder_at(dir_parts, path).await?;
        parent
            .create_link(&leaf[0], params)
            .await
            .map_err(|e| e.with_path(path))?;
        Ok(())
    }

    /// Materialize the target of the link at `path` within this
    /// filesystem's storage.
    pub async fn open_link(&self, path: &str) -> Result<Node> {
        let params = self.read_link(path).await?;
        let key = params.target_key()?;
        let storage = self.storage.clone();
        match &params.target {
            LinkTarget::File { file_name, obj_id, .. } => Ok(Node::File(
                FileNode::load(storage, obj_id.clone(), key, file_name.clone(), None)
                    .await
                    .map_err(|e| e.with_path(path))?,
            )),
            LinkTarget::Folder {
                folder_name,
                obj_id,
                ..
            } => Ok(Node::Folder(
                FolderNode::load(storage, obj_id.clone(), key, folder_name.clone(), None)
                    .await
                    .map_err(|e| e.with_path(path))?,
            )),
        }
    }

    // ---- sub-roots ----

    /// A read-only view rooted at `path`. The view holds the folder's
    /// key, which transitively decrypts the whole subtree; no other
    /// keys are handed over.
    pub async fn readonly_sub_root(&self, path: &str) -> Result<FS> {
        self.check_open(path)?;
        let parts = split_path(path);
        let folder = self.folder_at(&parts, path).await?;
        Ok(Self::from_root(self.storage.clone(), folder, false))
    }

    /// A writable view rooted at `path`, creating the folder when
    /// `create` is set.
    pub async fn writable_sub_root(&self, path: &str, create: bool) -> Result<FS> {
        self.check_writable(path)?;
        let parts = split_path(path);
        let folder = self
            .root
            .get_folder_in_sub_tree(&parts, create, false)
            .await
            .map_err(|e| e.with_path(path))?;
        Ok(Self::from_root(self.storage.clone(), folder, true))
    }

    // ---- watching ----

    /// Watch one file's events until detach or close.
    pub async fn watch_file(
        &self,
        path: &str,
        observer: impl Observer<ObjEvent>,
    ) -> Result<WatchHandle> {
        self.check_open(path)?;
        let file = self.file_at(path).await?;
        Ok(spawn_node_watch(
            &self.storage,
            file.obj_id(),
            self.close_tx.subscribe(),
            Box::new(observer),
        ))
    }

    /// Watch one folder's entry events until detach or close.
    pub async fn watch_folder(
        &self,
        path: &str,
        observer: impl Observer<ObjEvent>,
    ) -> Result<WatchHandle> {
        self.check_open(path)?;
        let parts = split_path(path);
        let folder = self.folder_at(&parts, path).await?;
        Ok(spawn_node_watch(
            &self.storage,
            folder.obj_id(),
            self.close_tx.subscribe(),
            Box::new(observer),
        ))
    }

    /// Watch a whole subtree, receiving path-corrected events.
    pub async fn watch_tree(
        &self,
        path: &str,
        observer: impl Observer<TreeEvent>,
    ) -> Result<WatchHandle> {
        self.check_open(path)?;
        let parts = split_path(path);
        let folder = self.folder_at(&parts, path).await?;
        spawn_tree_watch(
            &self.storage,
            &folder,
            join_path(&parts),
            self.close_tx.subscribe(),
            Box::new(observer),
        )
        .await
    }
}

impl std::fmt::Debug for FS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FS{{root:{}, writable:{}, closed:{}}}",
            self.root.obj_id(),
            self.writable,
            self.is_closed()
        )
    }
}

fn child_path(base: &str, name: &str) -> String {
    let mut parts = split_path(base);
    parts.push(name.to_string());
    join_path(&parts)
}

fn xattrs_to_changes(xattrs: &XAttrs) -> XAttrsChanges {
    let set: BTreeMap<String, serde_json::Value> = xattrs
        .list()
        .into_iter()
        .filter_map(|name| xattrs.get(&name).map(|v| (name, v.clone())))
        .collect();
    XAttrsChanges {
        set,
        remove: Vec::new(),
    }
}

async fn transfer_file(
    src_fs: &FS,
    src: &str,
    dst_fs: &FS,
    dst: &str,
    flags: WriteFlags,
) -> Result<u64> {
    let (bytes, _) = src_fs.read_bytes(src, None, None).await?;
    let src_stat = src_fs.stat(src).await?;
    let version = dst_fs.write_bytes(dst, &bytes, flags).await?;
    if !src_stat.xattrs.is_empty() {
        return dst_fs
            .update_xattrs(dst, &xattrs_to_changes(&src_stat.xattrs))
            .await;
    }
    Ok(version)
}

/// Longest chain of links followed while importing a subtree; a chain
/// deeper than this is treated as a cycle.
const LINK_IMPORT_DEPTH_LIMIT: u32 = 10;

/// Re-create a link's target inside the destination storage and mint
/// fresh parameters for it. The target objects are reachable through
/// the new link's parameters only, like a folder attached to a message.
fn import_link_params<'a>(
    src_fs: &'a FS,
    dst_fs: &'a FS,
    params: LinkParams,
    dst_parent_id: crate::storage::ObjId,
    link_depth: u32,
) -> BoxFuture<'a, Result<LinkParams>> {
    async move {
        if link_depth >= LINK_IMPORT_DEPTH_LIMIT {
            return Err(Error::endless(params.target_name()));
        }
        let key = params.target_key()?;
        let mut new_params = match &params.target {
            LinkTarget::File {
                file_name, obj_id, ..
            } => {
                let src_file = FileNode::load(
                    src_fs.storage.clone(),
                    obj_id.clone(),
                    key,
                    file_name.clone(),
                    None,
                )
                .await?;
                let (bytes, _) = src_file.read_bytes(None, None).await?;
                let new_id = dst_fs.storage.generate_new_obj_id().await?;
                let new_file = FileNode::create_new(
                    dst_fs.storage.clone(),
                    new_id,
                    NodeKey::random(),
                    file_name.clone(),
                    dst_parent_id,
                )
                .await?;
                new_file.save(&bytes, None).await?;
                let xattrs = src_file.xattrs();
                if !xattrs.is_empty() {
                    new_file.update_xattrs(&xattrs_to_changes(&xattrs)).await?;
                }
                new_file.get_link_params()?
            }
            LinkTarget::Folder {
                folder_name,
                obj_id,
                ..
            } => {
                let src_root = FolderNode::load(
                    src_fs.storage.clone(),
                    obj_id.clone(),
                    key,
                    folder_name.clone(),
                    None,
                )
                .await?;
                let src_view = FS::from_root(src_fs.storage.clone(), src_root, false);
                let new_id = dst_fs.storage.generate_new_obj_id().await?;
                let new_folder = FolderNode::create_new(
                    dst_fs.storage.clone(),
                    new_id,
                    NodeKey::random(),
                    folder_name.clone(),
                    dst_parent_id,
                )
                .await?;
                let dst_view = FS::from_root(dst_fs.storage.clone(), new_folder.clone(), true);
                transfer_folder(
                    &src_view,
                    "/".to_string(),
                    &dst_view,
                    "/".to_string(),
                    true,
                    link_depth + 1,
                )
                .await?;
                new_folder.get_link_params()?
            }
        };
        new_params.readonly = params.readonly;
        Ok(new_params)
    }
    .boxed()
}

fn transfer_folder<'a>(
    src_fs: &'a FS,
    src: String,
    dst_fs: &'a FS,
    dst: String,
    merge_and_overwrite: bool,
    link_depth: u32,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let (entries, _) = src_fs.list_folder(&src).await?;
        if !merge_and_overwrite && dst_fs.check_folder_presence(&dst).await? {
            return Err(Error::already_exists(dst));
        }
        dst_fs.make_folder(&dst).await?;

        for entry in entries {
            let src_child = child_path(&src, &entry.name);
            let dst_child = child_path(&dst, &entry.name);
            match entry.kind {
                NodeKind::File => {
                    let flags = WriteFlags {
                        create: true,
                        exclusive: !merge_and_overwrite,
                        truncate: true,
                    };
                    transfer_file(src_fs, &src_child, dst_fs, &dst_child, flags).await?;
                }
                NodeKind::Folder => {
                    transfer_folder(
                        src_fs,
                        src_child,
                        dst_fs,
                        dst_child,
                        merge_and_overwrite,
                        link_depth,
                    )
                    .await?;
                }
                NodeKind::Link => {
                    let params = src_fs.read_link(&src_child).await?;
                    let parts = split_path(&dst_child);
                    let (dir_parts, leaf) = parts.split_at(parts.len() - 1);
                    let parent = dst_fs.folder_at(dir_parts, &dst_child).await?;
                    if merge_and_overwrite && parent.has_child(&leaf[0]) {
                        parent
                            .remove_child(&leaf[0], false)
                            .await
                            .map_err(|e| e.with_path(&dst_child))?;
                    }
                    // Within one storage the parameters stay valid; an
                    // import must re-create the target, or the new link
                    // would name objects the destination never held.
                    let params = if Arc::ptr_eq(&src_fs.storage, &dst_fs.storage) {
                        params
                    } else {
                        import_link_params(src_fs, dst_fs, params, parent.obj_id(), link_depth)
                            .await
                            .map_err(|e| e.with_path(&dst_child))?
                    };
                    parent
                        .create_link(&leaf[0], params)
                        .await
                        .map_err(|e| e.with_path(&dst_child))?;
                }
            }
        }
        Ok(())
    }
    .boxed()
}
