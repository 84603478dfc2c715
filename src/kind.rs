// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

/// Kind of a node in the filesystem tree.
///
/// Once a node is created its kind never changes. Folder payloads and
/// link parameters persist the kind next to the object id and key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
    Link,
}

impl NodeKind {
    pub fn is_file(&self) -> bool {
        matches!(self, NodeKind::File)
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, NodeKind::Folder)
    }

    pub fn is_link(&self) -> bool {
        matches!(self, NodeKind::Link)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Folder => "folder",
            NodeKind::Link => "link",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Type of the storage a filesystem lives in.
///
/// Link compatibility follows the storage's reach: a local-only storage
/// may reference anything the device can open, a synced storage must not
/// reference objects that exist only on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    Synced,
    Share,
}

impl StorageType {
    /// Whether a link placed in a storage of this type may point into a
    /// storage of type `target`.
    pub fn may_link_to(&self, target: StorageType) -> bool {
        match self {
            StorageType::Local => true,
            StorageType::Synced => matches!(target, StorageType::Synced | StorageType::Share),
            StorageType::Share => matches!(target, StorageType::Share),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Local => "local",
            StorageType::Synced => "synced",
            StorageType::Share => "share",
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
