// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Common node machinery shared by files, folders and links.
//!
//! Every node owns an exclusive change lock. Mutations acquire it for
//! the whole duration of the change and release it only after the new
//! version was handed to the store or abandoned; `tokio::sync::Mutex`
//! queues waiters FIFO, so per-node writes are totally ordered and
//! versions assigned under the lock are strictly increasing. Locks are
//! never re-acquired on the same call chain: compound operations take
//! every guard they need at the outermost frame and pass them down.

use crate::attrs::{CommonAttrs, XAttrs, XAttrsChanges};
use crate::cryptor::NodeKey;
use crate::error::{Error, Result};
use crate::kind::NodeKind;
use crate::persistence::NodePersistence;
use crate::storage::{NodeEvent, ObjEvent, ObjId, Storage};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Parameters of a not-yet-committed update.
///
/// Computed before a write, committed with [`NodeCore::set_updated`]
/// only after the write lands; until then the node's live state is
/// untouched.
#[derive(Debug, Clone)]
pub(crate) struct UpdateParams {
    pub version: u64,
    pub attrs: CommonAttrs,
    pub xattrs: XAttrs,
}

#[derive(Debug, Clone)]
pub(crate) struct NodeState {
    pub name: String,
    pub parent_id: Option<ObjId>,
    pub version: u64,
    pub attrs: CommonAttrs,
    pub xattrs: XAttrs,
    pub size: u64,
}

pub(crate) struct NodeCore {
    storage: Arc<dyn Storage>,
    persistence: NodePersistence,
    kind: NodeKind,
    state: std::sync::Mutex<NodeState>,
    change_lock: Arc<Mutex<()>>,
}

impl NodeCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        obj_id: ObjId,
        key: NodeKey,
        kind: NodeKind,
        name: String,
        parent_id: Option<ObjId>,
        version: u64,
        attrs: CommonAttrs,
        xattrs: XAttrs,
        size: u64,
    ) -> Self {
        let persistence = NodePersistence::new(obj_id, key, storage.cryptor());
        NodeCore {
            storage,
            persistence,
            kind,
            state: std::sync::Mutex::new(NodeState {
                name,
                parent_id,
                version,
                attrs,
                xattrs,
                size,
            }),
            change_lock: Arc::new(Mutex::new(())),
        }
    }

    pub(crate) fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub(crate) fn persistence(&self) -> &NodePersistence {
        &self.persistence
    }

    pub(crate) fn obj_id(&self) -> &ObjId {
        self.persistence.obj_id()
    }

    pub(crate) fn key(&self) -> &NodeKey {
        self.persistence.key()
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn state(&self) -> NodeState {
        self.state.lock().expect("node state poisoned").clone()
    }

    pub(crate) fn name(&self) -> String {
        self.state.lock().expect("node state poisoned").name.clone()
    }

    pub(crate) fn parent_id(&self) -> Option<ObjId> {
        self.state
            .lock()
            .expect("node state poisoned")
            .parent_id
            .clone()
    }

    pub(crate) fn version(&self) -> u64 {
        self.state.lock().expect("node state poisoned").version
    }

    pub(crate) fn size(&self) -> u64 {
        self.state.lock().expect("node state poisoned").size
    }

    pub(crate) fn set_name(&self, name: String) {
        self.state.lock().expect("node state poisoned").name = name;
    }

    pub(crate) fn set_parent_id(&self, parent_id: Option<ObjId>) {
        self.state.lock().expect("node state poisoned").parent_id = parent_id;
    }

    /// Acquire this node's change lock; waiters are served FIFO.
    pub(crate) async fn lock_change(&self) -> OwnedMutexGuard<()> {
        self.change_lock.clone().lock_owned().await
    }

    /// Non-blocking acquisition, for operations that must not wait on
    /// an in-flight writer (e.g. removal).
    pub(crate) fn try_lock_change(&self) -> Result<OwnedMutexGuard<()>> {
        self.change_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::busy(self.name()))
    }

    /// Compute the parameters of the next version: `version + 1`,
    /// xattr changes applied to a copy, `mtime` stamped now.
    pub(crate) fn params_for_update(
        &self,
        changes: Option<&XAttrsChanges>,
    ) -> Result<UpdateParams> {
        let state = self.state();
        let xattrs = match changes {
            Some(changes) => state.xattrs.with_changes(changes)?,
            None => state.xattrs,
        };
        Ok(UpdateParams {
            version: state.version + 1,
            attrs: state.attrs.touched(),
            xattrs,
        })
    }

    /// Commit a landed update into the live node state.
    pub(crate) fn set_updated(
        &self,
        version: u64,
        attrs: CommonAttrs,
        xattrs: XAttrs,
        size: Option<u64>,
    ) {
        let mut state = self.state.lock().expect("node state poisoned");
        state.version = version;
        state.attrs = attrs;
        state.xattrs = xattrs;
        if let Some(size) = size {
            state.size = size;
        }
    }

    /// Refresh the cached snapshot from a payload newer than ours.
    pub(crate) fn refresh_from(
        &self,
        version: u64,
        attrs: CommonAttrs,
        xattrs: XAttrs,
        size: Option<u64>,
    ) {
        let mut state = self.state.lock().expect("node state poisoned");
        if version > state.version {
            state.version = version;
            state.attrs = attrs;
            state.xattrs = xattrs;
            if let Some(size) = size {
                state.size = size;
            }
        }
    }

    /// Publish an event for this node into the storage event hub.
    pub(crate) fn publish(&self, event: ObjEvent) {
        self.storage.publish_node_event(NodeEvent {
            obj_id: self.obj_id().clone(),
            parent_obj_id: self.parent_id(),
            name: Some(self.name()),
            event,
        });
    }

    pub(crate) fn attrs(&self) -> CommonAttrs {
        self.state.lock().expect("node state poisoned").attrs
    }

    pub(crate) fn xattrs(&self) -> XAttrs {
        self.state
            .lock()
            .expect("node state poisoned")
            .xattrs
            .clone()
    }
}

/// A loaded node of any kind; the closed sum callers pattern-match on.
#[derive(Clone)]
pub enum Node {
    File(crate::file::FileNode),
    Folder(crate::folder::FolderNode),
    Link(crate::link::LinkNode),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::File(_) => NodeKind::File,
            Node::Folder(_) => NodeKind::Folder,
            Node::Link(_) => NodeKind::Link,
        }
    }

    pub(crate) fn core(&self) -> &NodeCore {
        match self {
            Node::File(f) => f.core(),
            Node::Folder(f) => f.core(),
            Node::Link(l) => l.core(),
        }
    }

    pub fn obj_id(&self) -> ObjId {
        self.core().obj_id().clone()
    }

    pub fn name(&self) -> String {
        self.core().name()
    }

    pub fn version(&self) -> u64 {
        self.core().version()
    }

    pub fn into_file(self) -> Option<crate::file::FileNode> {
        match self {
            Node::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_folder(self) -> Option<crate::folder::FolderNode> {
        match self {
            Node::Folder(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_link(self) -> Option<crate::link::LinkNode> {
        match self {
            Node::Link(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Result<&crate::file::FileNode> {
        match self {
            Node::File(f) => Ok(f),
            _ => Err(Error::not_file(self.name())),
        }
    }

    pub fn as_folder(&self) -> Result<&crate::folder::FolderNode> {
        match self {
            Node::Folder(f) => Ok(f),
            _ => Err(Error::not_folder(self.name())),
        }
    }

    pub fn as_link(&self) -> Result<&crate::link::LinkNode> {
        match self {
            Node::Link(l) => Ok(l),
            _ => Err(Error::not_link(self.name())),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind(), self.obj_id())
    }
}
