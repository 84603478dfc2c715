// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::cryptor::NodeKey;
use crate::fs::FS;
use crate::kind::StorageType;
use crate::memory::MemoryStorage;
use std::sync::Arc;

mod close;
mod folders;
mod links;

pub(crate) async fn new_fs() -> FS {
    new_fs_on(MemoryStorage::new(StorageType::Local)).await
}

pub(crate) async fn new_fs_on(storage: Arc<MemoryStorage>) -> FS {
    FS::open(storage, NodeKey::random()).await.unwrap()
}
