// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Link nodes: a persisted, self-contained reference to a node in some
//! storage, including the key required to open it.

use crate::attrs::{CommonAttrs, XAttrs};
use crate::cryptor::NodeKey;
use crate::error::{Error, Result};
use crate::kind::{NodeKind, StorageType};
use crate::node::NodeCore;
use crate::storage::{ObjId, Storage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Everything needed to materialize a link's target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkParams {
    pub storage_type: StorageType,
    #[serde(default)]
    pub readonly: bool,
    pub target: LinkTarget,
}

/// The linked node, with its name, object id and base64-encoded key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LinkTarget {
    File {
        file_name: String,
        obj_id: ObjId,
        key: String,
    },
    Folder {
        folder_name: String,
        obj_id: ObjId,
        key: String,
    },
}

impl LinkParams {
    pub fn is_file(&self) -> bool {
        matches!(self.target, LinkTarget::File { .. })
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.target, LinkTarget::Folder { .. })
    }

    pub fn target_name(&self) -> &str {
        match &self.target {
            LinkTarget::File { file_name, .. } => file_name,
            LinkTarget::Folder { folder_name, .. } => folder_name,
        }
    }

    pub fn target_obj_id(&self) -> &ObjId {
        match &self.target {
            LinkTarget::File { obj_id, .. } => obj_id,
            LinkTarget::Folder { obj_id, .. } => obj_id,
        }
    }

    pub(crate) fn target_key(&self) -> Result<NodeKey> {
        let encoded = match &self.target {
            LinkTarget::File { key, .. } => key,
            LinkTarget::Folder { key, .. } => key,
        };
        NodeKey::from_base64(encoded)
    }
}

/// A link node.
#[derive(Clone)]
pub struct LinkNode {
    inner: Arc<NodeCore>,
    params: LinkParams,
}

impl LinkNode {
    pub(crate) fn core(&self) -> &NodeCore {
        &self.inner
    }

    /// Create a link and persist its first version, child-first.
    pub(crate) async fn create_new(
        storage: Arc<dyn Storage>,
        obj_id: ObjId,
        key: NodeKey,
        name: String,
        parent_id: ObjId,
        params: LinkParams,
    ) -> Result<Self> {
        let content = serde_json::to_vec(&params)
            .map_err(|e| Error::invariant(format!("link params encoding: {e}")))?;
        let core = NodeCore::new(
            storage,
            obj_id,
            key,
            NodeKind::Link,
            name,
            Some(parent_id),
            0,
            CommonAttrs::now(),
            XAttrs::new(),
            0,
        );
        let node = LinkNode {
            inner: Arc::new(core),
            params,
        };
        let update = node.inner.params_for_update(None)?;
        let stream = node
            .inner
            .persistence()
            .write_whole(&content, update.version, update.attrs, update.xattrs.clone())
            .await?;
        node.inner
            .storage()
            .save_obj(node.inner.obj_id(), update.version, stream)
            .await?;
        node.inner
            .set_updated(update.version, update.attrs, update.xattrs, None);
        Ok(node)
    }

    /// Load and parse an existing link object.
    pub(crate) async fn load(
        storage: Arc<dyn Storage>,
        obj_id: ObjId,
        key: NodeKey,
        name: String,
        parent_id: Option<ObjId>,
    ) -> Result<Self> {
        let src = storage.get_obj(&obj_id).await?;
        let core = NodeCore::new(
            storage,
            obj_id,
            key,
            NodeKind::Link,
            name.clone(),
            parent_id,
            0,
            CommonAttrs::now(),
            XAttrs::new(),
            0,
        );
        let payload = core.persistence().read_payload(src).await?;
        let content = payload.read_content_all().await?;
        let params: LinkParams =
            serde_json::from_slice(&content).map_err(|e| Error::parsing(name, e))?;
        core.set_updated(
            payload.version().unwrap_or(0),
            payload.attrs(),
            payload.xattrs().clone(),
            None,
        );
        Ok(LinkNode {
            inner: Arc::new(core),
            params,
        })
    }

    pub fn obj_id(&self) -> ObjId {
        self.inner.obj_id().clone()
    }

    pub fn name(&self) -> String {
        self.inner.name()
    }

    pub fn version(&self) -> u64 {
        self.inner.version()
    }

    /// The parameters this link stores.
    pub fn link_params(&self) -> LinkParams {
        self.params.clone()
    }
}

impl std::fmt::Debug for LinkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LinkNode({} -> {})",
            self.inner.obj_id(),
            self.params.target_obj_id()
        )
    }
}
