// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Folder nodes: the encrypted child table and every child-mutating
//! operation of the tree.
//!
//! A folder payload is self-describing: each child entry carries the
//! child's own key, so holding a folder key transitively unlocks the
//! whole subtree. Renames and moves touch only folder payloads; the
//! moved child keeps its object id and key.

use crate::attrs::{CommonAttrs, XAttrs, XAttrsChanges};
use crate::cryptor::NodeKey;
use crate::error::{Error, Result};
use crate::file::FileNode;
use crate::kind::{NodeKind, StorageType};
use crate::link::{LinkNode, LinkParams, LinkTarget};
use crate::node::{Node, NodeCore};
use crate::path::check_name;
use crate::storage::{ListingEntry, MoveLabel, ObjEvent, ObjId, Storage};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One child as kept in the in-memory table.
#[derive(Debug, Clone)]
pub(crate) struct ChildEntry {
    pub obj_id: ObjId,
    pub key: NodeKey,
    pub kind: NodeKind,
}

/// One child as persisted inside the folder payload.
#[derive(Debug, Serialize, Deserialize)]
struct ChildRec {
    obj_id: ObjId,
    key: String,
    kind: NodeKind,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FolderContent {
    nodes: BTreeMap<String, ChildRec>,
}

/// Folder listing exported as plain JSON, used for filesystems attached
/// to messages where the recipient receives the keys out of band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderJson {
    pub nodes: BTreeMap<String, FolderJsonNode>,
    pub ctime: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderJsonNode {
    pub obj_id: ObjId,
    pub name: String,
    pub key: String,
    pub kind: NodeKind,
}

struct FolderInner {
    core: NodeCore,
    children: std::sync::Mutex<BTreeMap<String, ChildEntry>>,
    loaded: Mutex<HashMap<String, Node>>,
}

/// A folder node. Cheap to clone; clones share state and locks.
#[derive(Clone)]
pub struct FolderNode(Arc<FolderInner>);

impl FolderNode {
    pub(crate) fn core(&self) -> &NodeCore {
        &self.0.core
    }

    fn new_inner(
        storage: Arc<dyn Storage>,
        obj_id: ObjId,
        key: NodeKey,
        name: String,
        parent_id: Option<ObjId>,
        children: BTreeMap<String, ChildEntry>,
    ) -> Self {
        let core = NodeCore::new(
            storage,
            obj_id,
            key,
            NodeKind::Folder,
            name,
            parent_id,
            0,
            CommonAttrs::now(),
            XAttrs::new(),
            0,
        );
        FolderNode(Arc::new(FolderInner {
            core,
            children: std::sync::Mutex::new(children),
            loaded: Mutex::new(HashMap::new()),
        }))
    }

    /// Open the root folder, creating its first version with the
    /// caller-supplied root key when the storage has none yet.
    pub(crate) async fn open_root(storage: Arc<dyn Storage>, root_key: NodeKey) -> Result<Self> {
        let root_id = ObjId::root();
        match storage.get_obj(&root_id).await {
            Ok(src) => {
                Self::load_from(storage, src, root_id, root_key, String::new(), None).await
            }
            Err(Error::NotFound { .. }) => {
                let folder =
                    Self::new_inner(storage, root_id, root_key, String::new(), None, BTreeMap::new());
                folder.persist_table(None).await?;
                Ok(folder)
            }
            Err(e) => Err(e),
        }
    }

    /// Create a brand-new empty folder and persist its first version.
    pub(crate) async fn create_new(
        storage: Arc<dyn Storage>,
        obj_id: ObjId,
        key: NodeKey,
        name: String,
        parent_id: ObjId,
    ) -> Result<Self> {
        let folder =
            Self::new_inner(storage, obj_id, key, name, Some(parent_id), BTreeMap::new());
        folder.persist_table(None).await?;
        Ok(folder)
    }

    /// Load an existing folder object from the store.
    pub(crate) async fn load(
        storage: Arc<dyn Storage>,
        obj_id: ObjId,
        key: NodeKey,
        name: String,
        parent_id: Option<ObjId>,
    ) -> Result<Self> {
        let src = storage.get_obj(&obj_id).await?;
        Self::load_from(storage, src, obj_id, key, name, parent_id).await
    }

    async fn load_from(
        storage: Arc<dyn Storage>,
        src: Box<dyn crate::storage::ObjSource>,
        obj_id: ObjId,
        key: NodeKey,
        name: String,
        parent_id: Option<ObjId>,
    ) -> Result<Self> {
        let folder = Self::new_inner(storage, obj_id, key, name.clone(), parent_id, BTreeMap::new());
        let payload = folder.0.core.persistence().read_payload(src).await?;
        let content_bytes = payload.read_content_all().await?;
        let content: FolderContent =
            serde_json::from_slice(&content_bytes).map_err(|e| Error::parsing(name, e))?;

        let mut children = BTreeMap::new();
        for (child_name, rec) in content.nodes {
            children.insert(
                child_name,
                ChildEntry {
                    obj_id: rec.obj_id,
                    key: NodeKey::from_base64(&rec.key)?,
                    kind: rec.kind,
                },
            );
        }
        *folder.0.children.lock().expect("child table poisoned") = children;
        folder.0.core.set_updated(
            payload.version().unwrap_or(0),
            payload.attrs(),
            payload.xattrs().clone(),
            None,
        );
        Ok(folder)
    }

    pub fn obj_id(&self) -> ObjId {
        self.0.core.obj_id().clone()
    }

    pub fn name(&self) -> String {
        self.0.core.name()
    }

    pub fn version(&self) -> u64 {
        self.0.core.version()
    }

    pub fn attrs(&self) -> CommonAttrs {
        self.0.core.attrs()
    }

    pub fn xattrs(&self) -> XAttrs {
        self.0.core.xattrs()
    }

    /// Snapshot of the listing together with the folder version.
    pub fn list(&self) -> (Vec<ListingEntry>, u64) {
        let children = self.0.children.lock().expect("child table poisoned");
        let entries = children
            .iter()
            .map(|(name, entry)| ListingEntry {
                name: name.clone(),
                kind: entry.kind,
            })
            .collect();
        (entries, self.0.core.version())
    }

    pub fn is_empty_folder(&self) -> bool {
        self.0
            .children
            .lock()
            .expect("child table poisoned")
            .is_empty()
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.0
            .children
            .lock()
            .expect("child table poisoned")
            .contains_key(name)
    }

    pub(crate) fn child_entry(&self, name: &str) -> Option<ChildEntry> {
        self.0
            .children
            .lock()
            .expect("child table poisoned")
            .get(name)
            .cloned()
    }

    pub(crate) fn entries_snapshot(&self) -> Vec<(String, ChildEntry)> {
        self.0
            .children
            .lock()
            .expect("child table poisoned")
            .iter()
            .map(|(n, e)| (n.clone(), e.clone()))
            .collect()
    }

    fn serialize_children(&self) -> Result<Vec<u8>> {
        let children = self.0.children.lock().expect("child table poisoned");
        let mut nodes = BTreeMap::new();
        for (name, entry) in children.iter() {
            nodes.insert(
                name.clone(),
                ChildRec {
                    obj_id: entry.obj_id.clone(),
                    key: entry.key.to_base64(),
                    kind: entry.kind,
                },
            );
        }
        serde_json::to_vec(&FolderContent { nodes })
            .map_err(|e| Error::invariant(format!("folder payload encoding: {e}")))
    }

    /// Persist the current child table as a new version. Callers hold
    /// the change lock.
    async fn persist_table(&self, changes: Option<&XAttrsChanges>) -> Result<u64> {
        let params = self.0.core.params_for_update(changes)?;
        let content = self.serialize_children()?;
        let stream = self
            .0
            .core
            .persistence()
            .write_whole(&content, params.version, params.attrs, params.xattrs.clone())
            .await?;
        self.0
            .core
            .storage()
            .save_obj(self.0.core.obj_id(), params.version, stream)
            .await?;
        self.0
            .core
            .set_updated(params.version, params.attrs, params.xattrs, None);
        Ok(params.version)
    }

    /// Load a child by name, caching the handle. Parents hold strong
    /// handles to loaded children; children know only their parent id.
    pub async fn get_node_opt(&self, name: &str) -> Result<Option<Node>> {
        let entry = match self.child_entry(name) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let mut loaded = self.0.loaded.lock().await;
        if let Some(node) = loaded.get(name) {
            if node.obj_id() == entry.obj_id {
                return Ok(Some(node.clone()));
            }
        }
        let storage = self.0.core.storage().clone();
        let parent_id = self.obj_id();
        let node = match entry.kind {
            NodeKind::File => Node::File(
                FileNode::load(storage, entry.obj_id, entry.key, name.to_string(), Some(parent_id))
                    .await?,
            ),
            NodeKind::Folder => Node::Folder(
                FolderNode::load(storage, entry.obj_id, entry.key, name.to_string(), Some(parent_id))
                    .await?,
            ),
            NodeKind::Link => Node::Link(
                LinkNode::load(storage, entry.obj_id, entry.key, name.to_string(), Some(parent_id))
                    .await?,
            ),
        };
        loaded.insert(name.to_string(), node.clone());
        Ok(Some(node))
    }

    pub async fn get_node(&self, name: &str) -> Result<Node> {
        self.get_node_opt(name)
            .await?
            .ok_or_else(|| Error::not_found(name))
    }

    pub async fn get_file_opt(&self, name: &str) -> Result<Option<FileNode>> {
        match self.get_node_opt(name).await? {
            None => Ok(None),
            Some(Node::File(f)) => Ok(Some(f)),
            Some(_) => Err(Error::not_file(name)),
        }
    }

    pub async fn get_file(&self, name: &str) -> Result<FileNode> {
        self.get_file_opt(name)
            .await?
            .ok_or_else(|| Error::not_found(name))
    }

    pub async fn get_folder_opt(&self, name: &str) -> Result<Option<FolderNode>> {
        match self.get_node_opt(name).await? {
            None => Ok(None),
            Some(Node::Folder(f)) => Ok(Some(f)),
            Some(_) => Err(Error::not_folder(name)),
        }
    }

    pub async fn get_folder(&self, name: &str) -> Result<FolderNode> {
        self.get_folder_opt(name)
            .await?
            .ok_or_else(|| Error::not_found(name))
    }

    pub async fn get_link_opt(&self, name: &str) -> Result<Option<LinkNode>> {
        match self.get_node_opt(name).await? {
            None => Ok(None),
            Some(Node::Link(l)) => Ok(Some(l)),
            Some(_) => Err(Error::not_link(name)),
        }
    }

    pub async fn get_link(&self, name: &str) -> Result<LinkNode> {
        self.get_link_opt(name)
            .await?
            .ok_or_else(|| Error::not_found(name))
    }

    /// Walk `parts` downward from this folder; empty `parts` is this
    /// folder itself.
    ///
    /// With `create`, missing intermediate segments become folders; with
    /// `create` and `exclusive`, an existing leaf fails.
    pub async fn get_folder_in_sub_tree(
        &self,
        parts: &[String],
        create: bool,
        exclusive: bool,
    ) -> Result<FolderNode> {
        let mut current = self.clone();
        for (i, name) in parts.iter().enumerate() {
            let is_leaf = i + 1 == parts.len();
            let node = current.get_node_opt(name).await?;
            // An exclusive create refuses an existing leaf of ANY kind
            // before the kind is even looked at.
            if create && exclusive && is_leaf && node.is_some() {
                return Err(Error::already_exists(name.clone()));
            }
            match node {
                Some(Node::Folder(next)) => current = next,
                Some(_) => return Err(Error::not_folder(name.clone())),
                None => {
                    if !create {
                        return Err(Error::not_found(name.clone()));
                    }
                    current = current.create_folder(name, false).await?;
                }
            }
        }
        Ok(current)
    }

    /// Create a file under this folder. With `exclusive` an existing
    /// entry fails; without, an existing FILE is returned as is.
    pub async fn create_file(&self, name: &str, exclusive: bool) -> Result<FileNode> {
        check_name(name)?;
        let _guard = self.0.core.lock_change().await;

        if self.has_child(name) {
            if exclusive {
                return Err(Error::already_exists(name));
            }
            return self.get_file(name).await;
        }

        let storage = self.0.core.storage().clone();
        let obj_id = storage.generate_new_obj_id().await?;
        let key = NodeKey::random();
        // Child first, then parent: a crash in between leaks an
        // unreachable object, never a dangling entry.
        let file = FileNode::create_new(
            storage,
            obj_id.clone(),
            key.clone(),
            name.to_string(),
            self.obj_id(),
        )
        .await?;
        self.register_child(name, obj_id, key, NodeKind::File, Node::File(file.clone()), None)
            .await?;
        Ok(file)
    }

    /// Create a subfolder. With `exclusive` an existing entry fails;
    /// without, an existing FOLDER is returned as is.
    pub async fn create_folder(&self, name: &str, exclusive: bool) -> Result<FolderNode> {
        check_name(name)?;
        let _guard = self.0.core.lock_change().await;

        if self.has_child(name) {
            if exclusive {
                return Err(Error::already_exists(name));
            }
            return self.get_folder(name).await;
        }

        let storage = self.0.core.storage().clone();
        let obj_id = storage.generate_new_obj_id().await?;
        let key = NodeKey::random();
        let folder = FolderNode::create_new(
            storage,
            obj_id.clone(),
            key.clone(),
            name.to_string(),
            self.obj_id(),
        )
        .await?;
        self.register_child(
            name,
            obj_id,
            key,
            NodeKind::Folder,
            Node::Folder(folder.clone()),
            None,
        )
        .await?;
        Ok(folder)
    }

    /// Install a link whose payload is the serialized parameters.
    ///
    /// The linking policy is checked against this folder's storage; a
    /// violation is a programming error, not a file condition.
    pub async fn create_link(&self, name: &str, params: LinkParams) -> Result<LinkNode> {
        check_name(name)?;
        if !self.0.core.storage().kind().may_link_to(params.storage_type) {
            return Err(Error::invariant(format!(
                "{} storage cannot link into {} storage",
                self.0.core.storage().kind(),
                params.storage_type
            )));
        }
        let _guard = self.0.core.lock_change().await;
        if self.has_child(name) {
            return Err(Error::already_exists(name));
        }

        let storage = self.0.core.storage().clone();
        let obj_id = storage.generate_new_obj_id().await?;
        let key = NodeKey::random();
        let link = LinkNode::create_new(
            storage,
            obj_id.clone(),
            key.clone(),
            name.to_string(),
            self.obj_id(),
            params,
        )
        .await?;
        self.register_child(name, obj_id, key, NodeKind::Link, Node::Link(link.clone()), None)
            .await?;
        Ok(link)
    }

    /// Installs the entry and persists the parent; caller holds this
    /// folder's change lock and has already persisted the child.
    async fn register_child(
        &self,
        name: &str,
        obj_id: ObjId,
        key: NodeKey,
        kind: NodeKind,
        node: Node,
        move_label: Option<MoveLabel>,
    ) -> Result<()> {
        {
            let mut children = self.0.children.lock().expect("child table poisoned");
            children.insert(
                name.to_string(),
                ChildEntry {
                    obj_id,
                    key,
                    kind,
                },
            );
        }
        self.persist_table(None).await?;
        let child_obj_id = node.obj_id();
        self.0.loaded.lock().await.insert(name.to_string(), node);
        self.0.core.publish(ObjEvent::EntryAdded {
            entry: ListingEntry {
                name: name.to_string(),
                kind,
            },
            child_obj_id,
            move_label,
        });
        Ok(())
    }

    /// Move or rename a child. A same-folder move is a rename and emits
    /// `entry-renaming`; a cross-folder move acquires both folders'
    /// change locks in objId order and emits a correlated
    /// removal/addition pair sharing one move label.
    pub async fn move_child_to(
        &self,
        old_name: &str,
        dst: &FolderNode,
        new_name: &str,
    ) -> Result<()> {
        check_name(new_name)?;
        if self.obj_id() == dst.obj_id() {
            return self.rename_child(old_name, new_name).await;
        }

        // Lower objId locks first, so two concurrent moves between the
        // same pair of folders cannot deadlock.
        let (_guard_a, _guard_b) = if self.obj_id().as_str() < dst.obj_id().as_str() {
            let a = self.0.core.lock_change().await;
            let b = dst.0.core.lock_change().await;
            (a, b)
        } else {
            let b = dst.0.core.lock_change().await;
            let a = self.0.core.lock_change().await;
            (b, a)
        };

        let entry = self
            .child_entry(old_name)
            .ok_or_else(|| Error::not_found(old_name))?;
        if dst.has_child(new_name) {
            return Err(Error::already_exists(new_name));
        }

        let label: MoveLabel = rand::random();
        let node = self.get_node(old_name).await?;

        // Destination gains the entry before the source loses it, so no
        // folder payload ever dangles.
        {
            let mut dst_children = dst.0.children.lock().expect("child table poisoned");
            dst_children.insert(new_name.to_string(), entry.clone());
        }
        dst.persist_table(None).await?;
        {
            let mut src_children = self.0.children.lock().expect("child table poisoned");
            src_children.remove(old_name);
        }
        self.persist_table(None).await?;

        self.0.loaded.lock().await.remove(old_name);
        node.core().set_name(new_name.to_string());
        node.core().set_parent_id(Some(dst.obj_id()));
        dst.0
            .loaded
            .lock()
            .await
            .insert(new_name.to_string(), node);

        self.0.core.publish(ObjEvent::EntryRemoved {
            name: old_name.to_string(),
            move_label: Some(label),
        });
        dst.0.core.publish(ObjEvent::EntryAdded {
            entry: ListingEntry {
                name: new_name.to_string(),
                kind: entry.kind,
            },
            child_obj_id: entry.obj_id.clone(),
            move_label: Some(label),
        });
        Ok(())
    }

    async fn rename_child(&self, old_name: &str, new_name: &str) -> Result<()> {
        if old_name == new_name {
            return Ok(());
        }
        let _guard = self.0.core.lock_change().await;
        let entry = self
            .child_entry(old_name)
            .ok_or_else(|| Error::not_found(old_name))?;
        if self.has_child(new_name) {
            return Err(Error::already_exists(new_name));
        }
        {
            let mut children = self.0.children.lock().expect("child table poisoned");
            children.remove(old_name);
            children.insert(new_name.to_string(), entry);
        }
        self.persist_table(None).await?;

        let mut loaded = self.0.loaded.lock().await;
        if let Some(node) = loaded.remove(old_name) {
            node.core().set_name(new_name.to_string());
            loaded.insert(new_name.to_string(), node);
        }
        drop(loaded);

        self.0.core.publish(ObjEvent::EntryRenamed {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        });
        Ok(())
    }

    /// Remove a child entry and its object(s).
    ///
    /// A non-empty child folder needs `recursive`; a child with an
    /// in-flight writer is `busy`.
    pub async fn remove_child(&self, name: &str, recursive: bool) -> Result<()> {
        let _guard = self.0.core.lock_change().await;
        let entry = self
            .child_entry(name)
            .ok_or_else(|| Error::not_found(name))?;

        let node = self.get_node(name).await?;
        if let Node::Folder(child_folder) = &node {
            if !child_folder.is_empty_folder() && !recursive {
                return Err(Error::not_empty(name));
            }
        }
        let _child_guard = node.core().try_lock_change()?;

        {
            let mut children = self.0.children.lock().expect("child table poisoned");
            children.remove(name);
        }
        self.persist_table(None).await?;
        self.0.loaded.lock().await.remove(name);

        self.0.core.publish(ObjEvent::EntryRemoved {
            name: name.to_string(),
            move_label: None,
        });
        node.core().publish(ObjEvent::Removed);

        let storage = self.0.core.storage().clone();
        remove_subtree_objects(storage, entry).await?;
        Ok(())
    }

    /// Apply an xattr change set to this folder; one version bump.
    pub async fn update_xattrs(&self, changes: &XAttrsChanges) -> Result<u64> {
        let _guard = self.0.core.lock_change().await;
        let version = self.persist_table(Some(changes)).await?;
        self.0.core.publish(ObjEvent::AttrsChange { version });
        Ok(version)
    }

    /// Self-contained reference to this folder, including its key.
    pub fn get_link_params(&self) -> Result<LinkParams> {
        let storage_type = self.0.core.storage().kind();
        if !matches!(storage_type, StorageType::Local | StorageType::Synced) {
            return Err(Error::not_permitted(self.0.core.name()));
        }
        Ok(LinkParams {
            storage_type,
            readonly: false,
            target: LinkTarget::Folder {
                folder_name: self.0.core.name(),
                obj_id: self.obj_id(),
                key: self.0.core.key().to_base64(),
            },
        })
    }

    /// Export the listing as plain JSON, keys included.
    pub fn to_folder_json(&self) -> FolderJson {
        let children = self.0.children.lock().expect("child table poisoned");
        let nodes = children
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    FolderJsonNode {
                        obj_id: entry.obj_id.clone(),
                        name: name.clone(),
                        key: entry.key.to_base64(),
                        kind: entry.kind,
                    },
                )
            })
            .collect();
        FolderJson {
            nodes,
            ctime: self.0.core.attrs().ctime,
        }
    }
}

impl std::fmt::Debug for FolderNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FolderNode({})", self.0.core.obj_id())
    }
}

/// Remove a child's object and, for folders, every descendant object.
/// Folder payloads hold the keys needed to walk down.
fn remove_subtree_objects(
    storage: Arc<dyn Storage>,
    entry: ChildEntry,
) -> BoxFuture<'static, Result<()>> {
    async move {
        if entry.kind == NodeKind::Folder {
            match FolderNode::load(
                storage.clone(),
                entry.obj_id.clone(),
                entry.key.clone(),
                String::new(),
                None,
            )
            .await
            {
                Ok(folder) => {
                    for (_, child) in folder.entries_snapshot() {
                        remove_subtree_objects(storage.clone(), child).await?;
                    }
                }
                Err(e) => {
                    // The entry goes away regardless; an unreadable
                    // descendant only leaks unreachable objects.
                    debug!("skipping descendants of {}: {e}", entry.obj_id);
                }
            }
        }
        storage.remove_obj(&entry.obj_id).await
    }
    .boxed()
}
