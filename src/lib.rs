// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! keyfs: an encrypted, versioned, tree-structured virtual filesystem.
//!
//! Every node (file, folder, link) is backed by one independently
//! encrypted object in a pluggable [`Storage`]. A folder's payload
//! lists its children together with each child's object id and key, so
//! holding a folder key transitively unlocks its whole subtree. Nodes
//! are versioned; per-node change locks serialize concurrent writers
//! while byte content streams through the segmented [`Cryptor`].

mod attrs;
mod cryptor;
mod error;
mod events;
mod file;
mod folder;
mod fs;
mod kind;
mod link;
mod memory;
mod node;
mod path;
mod persistence;
mod segbox;
mod storage;

pub use attrs::{CommonAttrs, XAttrs, XAttrsChanges};
pub use cryptor::{
    Cryptor, HeaderNonce, NodeKey, SegmentsReader, SegmentsWriter, KEY_SIZE, NONCE_SIZE,
};
pub use error::{Error, Result};
pub use events::{Observer, TreeEvent, WatchHandle};
pub use file::{FileByteSink, FileByteSrc, FileNode};
pub use folder::{FolderJson, FolderJsonNode, FolderNode};
pub use fs::{Stat, WriteFlags, FS};
pub use kind::{NodeKind, StorageType};
pub use link::{LinkNode, LinkParams, LinkTarget};
pub use memory::MemoryStorage;
pub use node::Node;
pub use persistence::header_nonce_of;
pub use segbox::{SegBoxCryptor, SEG_CONTENT_SIZE};
pub use storage::{
    ListingEntry, MoveLabel, NodeEvent, ObjByteStream, ObjChunk, ObjEvent, ObjId, ObjSource,
    Storage, ROOT_OBJ_ID,
};

#[cfg(test)]
mod tests;
