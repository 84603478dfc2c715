// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Per-node persistence: binds a node's key and object id to the
//! segmented encryption scheme and frames attributes next to content.
//!
//! Plaintext layout of every object payload:
//!
//! ```text
//! [u32 LE meta length][meta JSON: {attrs, xattrs}][content bytes]
//! ```
//!
//! Folder objects keep their child table in the content part; file
//! objects keep raw bytes there; link objects keep serialized link
//! parameters.

use crate::attrs::{CommonAttrs, XAttrs};
use crate::cryptor::{Cryptor, HeaderNonce, NodeKey, SegmentsReader, SegmentsWriter, NONCE_SIZE};
use crate::error::{Error, Result};
use crate::storage::{ObjByteStream, ObjId, ObjSource};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const META_LEN_SIZE: u64 = 4;

/// Derives the header nonce for an object: a pure function of the
/// object id, so every version of the object reuses it and delta writes
/// stay verifiable.
pub fn header_nonce_of(obj_id: &ObjId) -> HeaderNonce {
    let mut hasher = Sha256::new();
    hasher.update(b"keyfs.header-nonce\0");
    hasher.update(obj_id.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    nonce
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PayloadMeta {
    attrs: CommonAttrs,
    xattrs: XAttrs,
}

/// Binds one node to the encryption scheme.
pub(crate) struct NodePersistence {
    obj_id: ObjId,
    key: NodeKey,
    cryptor: Arc<dyn Cryptor>,
}

impl NodePersistence {
    pub(crate) fn new(obj_id: ObjId, key: NodeKey, cryptor: Arc<dyn Cryptor>) -> Self {
        NodePersistence {
            obj_id,
            key,
            cryptor,
        }
    }

    pub(crate) fn obj_id(&self) -> &ObjId {
        &self.obj_id
    }

    pub(crate) fn key(&self) -> &NodeKey {
        &self.key
    }

    fn header_nonce(&self) -> HeaderNonce {
        header_nonce_of(&self.obj_id)
    }

    /// Decrypt an object and expose its attrs, xattrs and content.
    pub(crate) async fn read_payload(&self, src: Box<dyn ObjSource>) -> Result<Payload> {
        let version = src.version();
        let reader = self
            .cryptor
            .make_segments_reader(&self.key, &self.header_nonce(), src)
            .await?;

        if reader.content_len() < META_LEN_SIZE {
            return Err(Error::end_of_bytes(""));
        }
        let len_bytes = reader.read(0, META_LEN_SIZE).await?;
        let meta_len = u32::from_le_bytes(
            len_bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::end_of_bytes(""))?,
        ) as u64;
        let content_offset = META_LEN_SIZE + meta_len;
        if reader.content_len() < content_offset {
            return Err(Error::end_of_bytes(""));
        }
        let meta_bytes = reader.read(META_LEN_SIZE, content_offset).await?;
        let meta: PayloadMeta =
            serde_json::from_slice(&meta_bytes).map_err(|e| Error::parsing("", e))?;

        Ok(Payload {
            meta,
            version,
            content_offset,
            reader,
        })
    }

    /// Encrypt a payload whose content fits in memory, returning the
    /// encrypted byte stream ready for `save_obj`.
    pub(crate) async fn write_whole(
        &self,
        content: &[u8],
        version: u64,
        attrs: CommonAttrs,
        xattrs: XAttrs,
    ) -> Result<ObjByteStream> {
        let (mut sink, stream) = self.write_sink(version, attrs, xattrs, None).await?;
        sink.write(content).await?;
        _ = sink.done().await?;
        Ok(stream)
    }

    /// Open a streaming sink for a new version.
    ///
    /// With `base`, the sink starts from the base object's content (the
    /// restart-on-existing-header path of the segmented scheme) with the
    /// write position at content start; without, it starts empty.
    pub(crate) async fn write_sink(
        &self,
        version: u64,
        attrs: CommonAttrs,
        xattrs: XAttrs,
        base: Option<Box<dyn ObjSource>>,
    ) -> Result<(PayloadSink, ObjByteStream)> {
        let meta = PayloadMeta { attrs, xattrs };
        let meta_bytes =
            serde_json::to_vec(&meta).map_err(|e| Error::invariant(format!("meta encoding: {e}")))?;
        let meta_len = meta_bytes.len() as u32;

        let mut writer = self
            .cryptor
            .make_segments_writer(&self.key, &self.header_nonce(), version)
            .await?;
        let stream = writer
            .take_byte_stream()
            .ok_or_else(|| Error::invariant("segments writer without byte stream"))?;

        writer.write(&meta_len.to_le_bytes()).await?;
        writer.write(&meta_bytes).await?;
        let content_offset = META_LEN_SIZE + meta_len as u64;

        if let Some(base) = base {
            let base_payload = self.read_payload(base).await?;
            let base_content = base_payload.read_content_all().await?;
            writer.write(&base_content).await?;
            writer.seek(content_offset).await?;
        }

        Ok((
            PayloadSink {
                writer,
                content_offset,
            },
            stream,
        ))
    }
}

/// Decrypted view of one object version.
pub(crate) struct Payload {
    meta: PayloadMeta,
    version: Option<u64>,
    content_offset: u64,
    reader: Box<dyn SegmentsReader>,
}

impl Payload {
    pub(crate) fn attrs(&self) -> CommonAttrs {
        self.meta.attrs
    }

    pub(crate) fn xattrs(&self) -> &XAttrs {
        &self.meta.xattrs
    }

    pub(crate) fn version(&self) -> Option<u64> {
        self.version
    }

    pub(crate) fn content_len(&self) -> u64 {
        self.reader.content_len() - self.content_offset
    }

    /// Content subrange `[start, end)`, clamped to the content length.
    pub(crate) async fn read_content(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let len = self.content_len();
        let start = start.min(len);
        let end = end.min(len);
        if start >= end {
            return Ok(Vec::new());
        }
        self.reader
            .read(self.content_offset + start, self.content_offset + end)
            .await
    }

    pub(crate) async fn read_content_all(&self) -> Result<Vec<u8>> {
        self.read_content(0, u64::MAX).await
    }
}

/// Streaming sink over one new object version; positions are relative
/// to content start.
pub(crate) struct PayloadSink {
    writer: Box<dyn SegmentsWriter>,
    content_offset: u64,
}

impl PayloadSink {
    pub(crate) async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write(bytes).await
    }

    pub(crate) async fn seek(&mut self, pos: u64) -> Result<()> {
        self.writer.seek(self.content_offset + pos).await
    }

    pub(crate) fn len(&self) -> u64 {
        self.writer.len().saturating_sub(self.content_offset)
    }

    /// Seal the version; returns the final content length.
    pub(crate) async fn done(self) -> Result<u64> {
        let total = self.writer.done().await?;
        Ok(total - self.content_offset)
    }

    pub(crate) async fn abort(self, reason: Error) {
        self.writer.abort(reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::XAttrsChanges;
    use crate::kind::StorageType;
    use crate::memory::MemoryStorage;
    use crate::storage::Storage;
    use serde_json::json;

    #[test]
    fn test_header_nonce_is_deterministic() {
        let a = header_nonce_of(&ObjId::new("abc"));
        let b = header_nonce_of(&ObjId::new("abc"));
        let c = header_nonce_of(&ObjId::new("abd"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_payload_round_trip() {
        let storage = MemoryStorage::new(StorageType::Local);
        let id = storage.generate_new_obj_id().await.unwrap();
        let np = NodePersistence::new(id.clone(), NodeKey::random(), storage.cryptor());

        let mut xattrs = XAttrs::new();
        xattrs
            .apply(&XAttrsChanges::set_one("app", json!("mail")))
            .unwrap();
        let attrs = CommonAttrs::now();

        let stream = np
            .write_whole(b"payload content", 1, attrs, xattrs.clone())
            .await
            .unwrap();
        storage.save_obj(&id, 1, stream).await.unwrap();

        let payload = np
            .read_payload(storage.get_obj(&id).await.unwrap())
            .await
            .unwrap();
        assert_eq!(payload.version(), Some(1));
        assert_eq!(payload.attrs(), attrs);
        assert_eq!(payload.xattrs(), &xattrs);
        assert_eq!(payload.content_len(), 15);
        assert_eq!(payload.read_content_all().await.unwrap(), b"payload content");
        assert_eq!(payload.read_content(8, 15).await.unwrap(), b"content");
        assert!(payload.read_content(20, 30).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_over_base_keeps_tail() {
        let storage = MemoryStorage::new(StorageType::Local);
        let id = storage.generate_new_obj_id().await.unwrap();
        let np = NodePersistence::new(id.clone(), NodeKey::random(), storage.cryptor());

        let attrs = CommonAttrs::now();
        let stream = np
            .write_whole(b"0123456789", 1, attrs, XAttrs::new())
            .await
            .unwrap();
        storage.save_obj(&id, 1, stream).await.unwrap();

        let base = storage.get_obj(&id).await.unwrap();
        let (mut sink, stream) = np
            .write_sink(2, attrs.touched(), XAttrs::new(), Some(base))
            .await
            .unwrap();
        assert_eq!(sink.len(), 10);
        sink.write(b"ab").await.unwrap();
        let size = sink.done().await.unwrap();
        assert_eq!(size, 10);
        storage.save_obj(&id, 2, stream).await.unwrap();

        let payload = np
            .read_payload(storage.get_obj(&id).await.unwrap())
            .await
            .unwrap();
        assert_eq!(payload.read_content_all().await.unwrap(), b"ab23456789");
    }

    #[tokio::test]
    async fn test_wrong_node_key_cannot_open() {
        let storage = MemoryStorage::new(StorageType::Local);
        let id = storage.generate_new_obj_id().await.unwrap();
        let np = NodePersistence::new(id.clone(), NodeKey::random(), storage.cryptor());
        let stream = np
            .write_whole(b"x", 1, CommonAttrs::now(), XAttrs::new())
            .await
            .unwrap();
        storage.save_obj(&id, 1, stream).await.unwrap();

        let wrong = NodePersistence::new(id.clone(), NodeKey::random(), storage.cryptor());
        assert!(wrong
            .read_payload(storage.get_obj(&id).await.unwrap())
            .await
            .is_err());
    }
}
