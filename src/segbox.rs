// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Default segmented-box cryptor: XChaCha20-Poly1305 over fixed-size
//! segments, with per-segment nonces derived from the header nonce, the
//! object version and the segment index.

use crate::cryptor::{Cryptor, HeaderNonce, NodeKey, SegmentsReader, SegmentsWriter, NONCE_SIZE};
use crate::error::{Error, Result};
use crate::storage::{ObjByteStream, ObjChunk, ObjSource};
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Plaintext bytes per segment.
pub const SEG_CONTENT_SIZE: usize = 64 * 1024;

/// Poly1305 tag appended to every sealed segment.
const TAG_SIZE: usize = 16;

/// Segment index reserved for the header.
const HEADER_IDX: u32 = u32::MAX;

#[derive(Debug, Serialize, Deserialize)]
struct SegBoxHeader {
    fmt: u32,
    seg: u32,
    v: u64,
}

/// Nonce for one segment: the header nonce with the version folded into
/// bytes 8..16 and the segment index into bytes 16..20. The same
/// (key, version, index) triple always maps to the same nonce, so a
/// rewrite of one version is deterministic, while distinct versions
/// never share a nonce.
fn seg_nonce(header_nonce: &HeaderNonce, version: u64, index: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = *header_nonce;
    for (i, b) in version.to_le_bytes().iter().enumerate() {
        nonce[8 + i] ^= b;
    }
    for (i, b) in index.to_le_bytes().iter().enumerate() {
        nonce[16 + i] ^= b;
    }
    nonce
}

fn seal(key: &NodeKey, nonce: &[u8; NONCE_SIZE], plain: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(XNonce::from_slice(nonce), plain)
        .map_err(|_| Error::crypto("segment encryption failed"))
}

fn open(key: &NodeKey, nonce: &[u8; NONCE_SIZE], sealed: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| Error::crypto("segment verification failed"))
}

/// The default [`Cryptor`].
pub struct SegBoxCryptor {
    seg_size: usize,
}

impl SegBoxCryptor {
    pub fn new() -> Self {
        SegBoxCryptor {
            seg_size: SEG_CONTENT_SIZE,
        }
    }

    /// Segment size override, used by tests to exercise multi-segment
    /// objects with small payloads.
    pub fn with_segment_size(seg_size: usize) -> Self {
        assert!(seg_size > 0);
        SegBoxCryptor { seg_size }
    }
}

#[async_trait]
impl Cryptor for SegBoxCryptor {
    async fn make_segments_writer(
        &self,
        key: &NodeKey,
        header_nonce: &HeaderNonce,
        version: u64,
    ) -> Result<Box<dyn SegmentsWriter>> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        Ok(Box::new(SegBoxWriter {
            key: key.clone(),
            header_nonce: *header_nonce,
            version,
            seg_size: self.seg_size,
            content: Vec::new(),
            pos: 0,
            chunk_tx,
            chunk_rx: Some(chunk_rx),
        }))
    }

    async fn make_segments_reader(
        &self,
        key: &NodeKey,
        header_nonce: &HeaderNonce,
        src: Box<dyn ObjSource>,
    ) -> Result<Box<dyn SegmentsReader>> {
        let version = src.version().unwrap_or(0);
        let sealed_header = src.read_header().await?;
        let header_plain = open(
            key,
            &seg_nonce(header_nonce, version, HEADER_IDX),
            &sealed_header,
        )?;
        let header: SegBoxHeader = serde_json::from_slice(&header_plain)
            .map_err(|e| Error::crypto(format!("bad object header: {e}")))?;
        if header.fmt != 1 {
            return Err(Error::crypto(format!(
                "unsupported object format {}",
                header.fmt
            )));
        }
        if let Some(v) = src.version() {
            if header.v != v {
                return Err(Error::crypto(format!(
                    "header claims version {} for object bytes of version {v}",
                    header.v
                )));
            }
        }

        let seg_size = header.seg as u64;
        let seg_count = src.segment_count().await?;
        let content_len = match seg_count {
            0 => 0,
            n => {
                let last = src
                    .read_segment(n - 1)
                    .await?
                    .ok_or_else(|| Error::end_of_bytes(""))?;
                if last.len() < TAG_SIZE {
                    return Err(Error::crypto("truncated final segment"));
                }
                (n as u64 - 1) * seg_size + (last.len() - TAG_SIZE) as u64
            }
        };

        Ok(Box::new(SegBoxReader {
            key: key.clone(),
            header_nonce: *header_nonce,
            version: header.v,
            seg_size: header.seg as usize,
            content_len,
            src,
        }))
    }
}

struct SegBoxWriter {
    key: NodeKey,
    header_nonce: HeaderNonce,
    version: u64,
    seg_size: usize,
    content: Vec<u8>,
    pos: u64,
    chunk_tx: mpsc::UnboundedSender<Result<ObjChunk>>,
    chunk_rx: Option<mpsc::UnboundedReceiver<Result<ObjChunk>>>,
}

#[async_trait]
impl SegmentsWriter for SegBoxWriter {
    fn take_byte_stream(&mut self) -> Option<ObjByteStream> {
        let rx = self.chunk_rx.take()?;
        Some(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let start = self.pos as usize;
        let end = start + bytes.len();
        if self.content.len() < end {
            self.content.resize(end, 0);
        }
        self.content[start..end].copy_from_slice(bytes);
        self.pos = end as u64;
        Ok(())
    }

    async fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.content.len() as u64
    }

    async fn done(self: Box<Self>) -> Result<u64> {
        // Seal everything before emitting a single chunk, so a sealing
        // failure never leaves a clean-looking truncated stream.
        let sealed = (|| {
            let header = SegBoxHeader {
                fmt: 1,
                seg: self.seg_size as u32,
                v: self.version,
            };
            let header_plain = serde_json::to_vec(&header)
                .map_err(|e| Error::invariant(format!("header encoding failed: {e}")))?;
            let mut chunks = vec![ObjChunk::Header(seal(
                &self.key,
                &seg_nonce(&self.header_nonce, self.version, HEADER_IDX),
                &header_plain,
            )?)];
            for (index, seg) in self.content.chunks(self.seg_size).enumerate() {
                chunks.push(ObjChunk::Segment(seal(
                    &self.key,
                    &seg_nonce(&self.header_nonce, self.version, index as u32),
                    seg,
                )?));
            }
            Ok(chunks)
        })();
        match sealed {
            Ok(chunks) => {
                // A dropped receiver means the save was abandoned;
                // sealing still reports the content length.
                for chunk in chunks {
                    _ = self.chunk_tx.send(Ok(chunk));
                }
                Ok(self.content.len() as u64)
            }
            Err(e) => {
                _ = self
                    .chunk_tx
                    .send(Err(Error::crypto("object sealing failed")));
                Err(e)
            }
        }
    }

    async fn abort(self: Box<Self>, reason: Error) {
        _ = self.chunk_tx.send(Err(reason));
    }
}

struct SegBoxReader {
    key: NodeKey,
    header_nonce: HeaderNonce,
    version: u64,
    seg_size: usize,
    content_len: u64,
    src: Box<dyn ObjSource>,
}

#[async_trait]
impl SegmentsReader for SegBoxReader {
    fn content_len(&self) -> u64 {
        self.content_len
    }

    async fn read(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let end = end.min(self.content_len);
        if start >= end {
            return Ok(Vec::new());
        }
        let seg_size = self.seg_size as u64;
        let first_seg = (start / seg_size) as u32;
        let last_seg = ((end - 1) / seg_size) as u32;

        let mut out = Vec::with_capacity((end - start) as usize);
        for index in first_seg..=last_seg {
            let sealed = self
                .src
                .read_segment(index)
                .await?
                .ok_or_else(|| Error::end_of_bytes(""))?;
            let plain = open(
                &self.key,
                &seg_nonce(&self.header_nonce, self.version, index),
                &sealed,
            )?;
            let seg_start = index as u64 * seg_size;
            let lo = start.saturating_sub(seg_start).min(plain.len() as u64) as usize;
            let hi = (end - seg_start).min(plain.len() as u64) as usize;
            out.extend_from_slice(&plain[lo..hi]);
        }
        Ok(out)
    }
}
