// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! In-memory [`Storage`] implementation, suitable for testing and for
//! derived-filesystem computation that never touches a real store.

use crate::cryptor::Cryptor;
use crate::error::{Error, Result};
use crate::kind::StorageType;
use crate::segbox::SegBoxCryptor;
use crate::storage::{NodeEvent, ObjByteStream, ObjChunk, ObjId, ObjSource, Storage};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredObj {
    version: u64,
    header: Vec<u8>,
    segments: Vec<Vec<u8>>,
}

/// Object store backed by a process-local map.
pub struct MemoryStorage {
    kind: StorageType,
    cryptor: Arc<dyn Cryptor>,
    objs: Mutex<HashMap<ObjId, StoredObj>>,
    events: broadcast::Sender<NodeEvent>,
}

impl MemoryStorage {
    pub fn new(kind: StorageType) -> Arc<Self> {
        Self::with_cryptor(kind, Arc::new(SegBoxCryptor::new()))
    }

    pub fn with_cryptor(kind: StorageType, cryptor: Arc<dyn Cryptor>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(MemoryStorage {
            kind,
            cryptor,
            objs: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Current version of an object, `None` when absent.
    pub async fn obj_version(&self, id: &ObjId) -> Option<u64> {
        self.objs.lock().await.get(id).map(|o| o.version)
    }

    /// Number of objects held, reachable or not.
    pub async fn obj_count(&self) -> usize {
        self.objs.lock().await.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn kind(&self) -> StorageType {
        self.kind
    }

    fn cryptor(&self) -> Arc<dyn Cryptor> {
        self.cryptor.clone()
    }

    async fn generate_new_obj_id(&self) -> Result<ObjId> {
        Ok(ObjId::new(uuid7::uuid7().to_string()))
    }

    async fn get_obj(&self, id: &ObjId) -> Result<Box<dyn ObjSource>> {
        let objs = self.objs.lock().await;
        let stored = objs
            .get(id)
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        Ok(Box::new(MemObjSource {
            version: Some(stored.version),
            header: stored.header.clone(),
            segments: stored.segments.clone(),
        }))
    }

    async fn save_obj(&self, id: &ObjId, version: u64, mut bytes: ObjByteStream) -> Result<()> {
        // Drain the stream before touching the map: a mid-stream error
        // must leave the stored object untouched.
        let mut header = None;
        let mut segments = Vec::new();
        while let Some(chunk) = bytes.next().await {
            match chunk? {
                ObjChunk::Header(h) => {
                    if header.replace(h).is_some() {
                        return Err(Error::invariant(format!(
                            "duplicate header chunk for {id}"
                        )));
                    }
                }
                ObjChunk::Segment(s) => segments.push(s),
            }
        }
        let header =
            header.ok_or_else(|| Error::invariant(format!("no header chunk for {id}")))?;

        let mut objs = self.objs.lock().await;
        let expected = objs.get(id).map(|o| o.version + 1).unwrap_or(1);
        if version != expected {
            return Err(Error::concurrent_update(id.to_string()));
        }
        objs.insert(
            id.clone(),
            StoredObj {
                version,
                header,
                segments,
            },
        );
        Ok(())
    }

    async fn remove_obj(&self, id: &ObjId) -> Result<()> {
        self.objs.lock().await.remove(id);
        Ok(())
    }

    fn node_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn publish_node_event(&self, event: NodeEvent) {
        // No receivers is fine; events are fire-and-forget here.
        _ = self.events.send(event);
    }
}

struct MemObjSource {
    version: Option<u64>,
    header: Vec<u8>,
    segments: Vec<Vec<u8>>,
}

#[async_trait]
impl ObjSource for MemObjSource {
    fn version(&self) -> Option<u64> {
        self.version
    }

    async fn read_header(&self) -> Result<Vec<u8>> {
        Ok(self.header.clone())
    }

    async fn read_segment(&self, index: u32) -> Result<Option<Vec<u8>>> {
        Ok(self.segments.get(index as usize).cloned())
    }

    async fn segment_count(&self) -> Result<u32> {
        Ok(self.segments.len() as u32)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunk_stream(chunks: Vec<Result<ObjChunk>>) -> ObjByteStream {
        Box::pin(stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_version_succession() {
        let storage = MemoryStorage::new(StorageType::Local);
        let id = storage.generate_new_obj_id().await.unwrap();

        let save = |v| {
            chunk_stream(vec![
                Ok(ObjChunk::Header(vec![v as u8])),
                Ok(ObjChunk::Segment(vec![1, 2, 3])),
            ])
        };

        // First save must be version 1.
        assert!(matches!(
            storage.save_obj(&id, 2, save(2)).await,
            Err(Error::ConcurrentUpdate { .. })
        ));
        storage.save_obj(&id, 1, save(1)).await.unwrap();
        // Skipping a version or repeating one is a concurrent update.
        assert!(matches!(
            storage.save_obj(&id, 1, save(1)).await,
            Err(Error::ConcurrentUpdate { .. })
        ));
        assert!(matches!(
            storage.save_obj(&id, 3, save(3)).await,
            Err(Error::ConcurrentUpdate { .. })
        ));
        storage.save_obj(&id, 2, save(2)).await.unwrap();
        assert_eq!(storage.obj_version(&id).await, Some(2));
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_object_untouched() {
        let storage = MemoryStorage::new(StorageType::Local);
        let id = storage.generate_new_obj_id().await.unwrap();
        storage
            .save_obj(
                &id,
                1,
                chunk_stream(vec![Ok(ObjChunk::Header(vec![1]))]),
            )
            .await
            .unwrap();

        let failing = chunk_stream(vec![
            Ok(ObjChunk::Header(vec![2])),
            Err(Error::bad_arg("writer died")),
        ]);
        assert!(storage.save_obj(&id, 2, failing).await.is_err());
        assert_eq!(storage.obj_version(&id).await, Some(1));

        let src = storage.get_obj(&id).await.unwrap();
        assert_eq!(src.read_header().await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let storage = MemoryStorage::new(StorageType::Local);
        let id = storage.generate_new_obj_id().await.unwrap();
        storage.remove_obj(&id).await.unwrap();
        storage.remove_obj(&id).await.unwrap();
        assert!(storage.get_obj(&id).await.is_err());
    }
}
