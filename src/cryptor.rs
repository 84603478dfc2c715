// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::storage::{ObjByteStream, ObjSource};
use async_trait::async_trait;
use base64::Engine;

/// Size of a node's symmetric key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a header nonce in bytes (XChaCha20-Poly1305 nonce width).
pub const NONCE_SIZE: usize = 24;

/// Deterministic nonce derived from an object id, consumed by the
/// segmented encryption scheme.
pub type HeaderNonce = [u8; NONCE_SIZE];

/// Symmetric key owned by exactly one node.
///
/// Keys never leave the owning node except inside link parameters and
/// folder-payload child entries. The Debug impl never prints key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeKey([u8; KEY_SIZE]);

impl NodeKey {
    /// Fresh key from secure random bytes.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        NodeKey(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        NodeKey(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::crypto(format!("bad key encoding: {e}")))?;
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::crypto("key has wrong length"))?;
        Ok(NodeKey(bytes))
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeKey(..)")
    }
}

impl serde::Serialize for NodeKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> serde::Deserialize<'de> for NodeKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        NodeKey::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// The segmented-box encryption primitive a filesystem consumes.
///
/// Turns a mutable plaintext stream into encrypted object bytes (header
/// plus segments) and back. Implementations may run their work on their
/// own threads; the filesystem only awaits them.
#[async_trait]
pub trait Cryptor: Send + Sync {
    /// Open an encrypting writer for a new object version.
    ///
    /// The writer hands out its encrypted byte stream once, before any
    /// plaintext is pushed; chunks flow when the writer is sealed.
    async fn make_segments_writer(
        &self,
        key: &NodeKey,
        header_nonce: &HeaderNonce,
        version: u64,
    ) -> Result<Box<dyn SegmentsWriter>>;

    /// Open a decrypting reader over one stored object version.
    async fn make_segments_reader(
        &self,
        key: &NodeKey,
        header_nonce: &HeaderNonce,
        src: Box<dyn ObjSource>,
    ) -> Result<Box<dyn SegmentsReader>>;
}

/// Encrypting writer for one object version.
#[async_trait]
pub trait SegmentsWriter: Send {
    /// Take the encrypted byte stream. Yields `None` on the second call.
    fn take_byte_stream(&mut self) -> Option<ObjByteStream>;

    /// Overwrite bytes at the current position, extending the content
    /// when writing past its end.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Move the write position. Seeking past the end zero-fills on the
    /// next write.
    async fn seek(&mut self, pos: u64) -> Result<()>;

    /// Current content length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seal the version: encrypt and emit header + segments into the
    /// byte stream taken earlier. Returns the final content length.
    async fn done(self: Box<Self>) -> Result<u64>;

    /// Abandon the version: the byte stream yields an error and the
    /// store discards the partial save.
    async fn abort(self: Box<Self>, reason: Error);
}

/// Decrypting random-access reader over one object version.
#[async_trait]
pub trait SegmentsReader: Send + Sync {
    /// Plaintext content length.
    fn content_len(&self) -> u64;

    /// Read the plaintext subrange `[start, end)`, clamped to the
    /// content length.
    async fn read(&self, start: u64, end: u64) -> Result<Vec<u8>>;

    async fn read_all(&self) -> Result<Vec<u8>> {
        self.read(0, self.content_len()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_base64_round_trip() {
        let key = NodeKey::random();
        let b64 = key.to_base64();
        assert_eq!(NodeKey::from_base64(&b64).unwrap(), key);
    }

    #[test]
    fn test_key_debug_redacts() {
        let key = NodeKey::from_bytes([7u8; KEY_SIZE]);
        assert_eq!(format!("{key:?}"), "NodeKey(..)");
    }

    #[test]
    fn test_bad_key_encoding() {
        assert!(NodeKey::from_base64("not base64!!").is_err());
        assert!(NodeKey::from_base64("AAAA").is_err()); // wrong length
    }
}
