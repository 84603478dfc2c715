// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::cryptor::Cryptor;
use crate::error::Result;
use crate::kind::{NodeKind, StorageType};
use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Reserved identifier of a filesystem's root folder object.
pub const ROOT_OBJ_ID: &str = "=root=";

/// Opaque identifier of an object in the store.
///
/// Minted by the store when a node is created; immutable for the node's
/// lifetime. The distinguished [`ObjId::root`] value addresses the root
/// folder of a storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjId(String);

impl ObjId {
    pub fn new(id: impl Into<String>) -> Self {
        ObjId(id.into())
    }

    pub fn root() -> Self {
        ObjId(ROOT_OBJ_ID.to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_OBJ_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

/// One chunk of encrypted object bytes, pushed writer-side.
///
/// A well-formed object byte stream yields exactly one `Header` followed
/// by zero or more `Segment`s.
#[derive(Debug, Clone)]
pub enum ObjChunk {
    Header(Vec<u8>),
    Segment(Vec<u8>),
}

/// Writer-push stream of encrypted object bytes, handed to
/// [`Storage::save_obj`]. An `Err` item aborts the save; nothing of the
/// new version is kept.
pub type ObjByteStream = Pin<Box<dyn Stream<Item = Result<ObjChunk>> + Send>>;

/// Read handle on one stored object version.
#[async_trait]
pub trait ObjSource: Send + Sync {
    /// Version of the object these bytes belong to. `None` on storages
    /// that do not version objects; unknown versions are never compared.
    fn version(&self) -> Option<u64>;

    async fn read_header(&self) -> Result<Vec<u8>>;

    /// Read segment `index`, or `None` past the last segment.
    async fn read_segment(&self, index: u32) -> Result<Option<Vec<u8>>>;

    async fn segment_count(&self) -> Result<u32>;
}

/// An entry in a folder listing, as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// Opaque token correlating the removal half of a cross-folder move with
/// its addition half in the event stream.
pub type MoveLabel = u64;

/// Semantic change to one object, delivered at the objId level.
#[derive(Debug, Clone)]
pub enum ObjEvent {
    /// The object was removed from the store.
    Removed,
    /// A file object gained a new version.
    FileChange { version: u64 },
    /// Attributes changed without content change.
    AttrsChange { version: u64 },
    /// A folder object gained a child entry.
    EntryAdded {
        entry: ListingEntry,
        child_obj_id: ObjId,
        move_label: Option<MoveLabel>,
    },
    /// A folder object lost a child entry.
    EntryRemoved {
        name: String,
        move_label: Option<MoveLabel>,
    },
    /// A child entry changed name within the same folder.
    EntryRenamed { old_name: String, new_name: String },
}

/// An objId-level event from the store.
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub obj_id: ObjId,
    pub parent_obj_id: Option<ObjId>,
    /// The node's name within its parent, when the producer knows it.
    pub name: Option<String>,
    pub event: ObjEvent,
}

/// The object store a filesystem persists through.
///
/// Shared by every node of the filesystem. The storage is responsible
/// for its own internal concurrency; in particular it serializes
/// `save_obj` per object id and rejects a save whose version is not the
/// successor of the stored one with `concurrent-update`.
#[async_trait]
pub trait Storage: Send + Sync {
    fn kind(&self) -> StorageType;

    fn cryptor(&self) -> Arc<dyn Cryptor>;

    /// Mint a fresh object id, unique within this storage.
    async fn generate_new_obj_id(&self) -> Result<ObjId>;

    /// Open the current version of an object for reading.
    async fn get_obj(&self, id: &ObjId) -> Result<Box<dyn ObjSource>>;

    /// Persist a new version of an object from a writer-push stream.
    ///
    /// Consumes the stream to completion; an `Err` item discards the
    /// partial version.
    async fn save_obj(&self, id: &ObjId, version: u64, bytes: ObjByteStream) -> Result<()>;

    /// Remove an object. Removing an absent object is a no-op.
    async fn remove_obj(&self, id: &ObjId) -> Result<()>;

    /// Subscribe to objId-level events.
    fn node_events(&self) -> broadcast::Receiver<NodeEvent>;

    /// Publish a semantic event into the storage's event hub.
    ///
    /// Nodes call this after a write lands; an externally-synced storage
    /// feeds the same hub with events observed from the sync server.
    fn publish_node_event(&self, event: NodeEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_sentinel() {
        assert!(ObjId::root().is_root());
        assert!(!ObjId::new("abc").is_root());
        assert_eq!(ObjId::root(), ObjId::new(ROOT_OBJ_ID));
    }
}
