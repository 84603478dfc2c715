// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! File nodes: versioned byte content with streaming reads and writes.

use crate::attrs::{CommonAttrs, XAttrs, XAttrsChanges};
use crate::cryptor::NodeKey;
use crate::error::{Error, Result};
use crate::kind::{NodeKind, StorageType};
use crate::link::{LinkParams, LinkTarget};
use crate::node::NodeCore;
use crate::persistence::{Payload, PayloadSink};
use crate::storage::{ObjEvent, ObjId, Storage};
use log::debug;
use std::sync::Arc;
use tokio::sync::{oneshot, OwnedMutexGuard};

/// A file node. Cheap to clone; all clones share the node state and its
/// change lock.
#[derive(Clone)]
pub struct FileNode(Arc<NodeCore>);

impl FileNode {
    pub(crate) fn core(&self) -> &NodeCore {
        &self.0
    }

    /// Create a brand-new file and persist its empty first version.
    ///
    /// Called by the parent folder BEFORE it registers the child entry,
    /// so a crash in between leaks an unreachable object instead of
    /// leaving a dangling reference.
    pub(crate) async fn create_new(
        storage: Arc<dyn Storage>,
        obj_id: ObjId,
        key: NodeKey,
        name: String,
        parent_id: ObjId,
    ) -> Result<Self> {
        let core = NodeCore::new(
            storage,
            obj_id,
            key,
            NodeKind::File,
            name,
            Some(parent_id),
            0,
            CommonAttrs::now(),
            XAttrs::new(),
            0,
        );
        let node = FileNode(Arc::new(core));
        let params = node.0.params_for_update(None)?;
        let stream = node
            .0
            .persistence()
            .write_whole(&[], params.version, params.attrs, params.xattrs.clone())
            .await?;
        node.0
            .storage()
            .save_obj(node.0.obj_id(), params.version, stream)
            .await?;
        node.0
            .set_updated(params.version, params.attrs, params.xattrs, Some(0));
        Ok(node)
    }

    /// Load an existing file object from the store.
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
            NodeKind::File,
            name,
            parent_id,
            0,
            CommonAttrs::now(),
            XAttrs::new(),
            0,
        );
        let node = FileNode(Arc::new(core));
        let payload = node.0.persistence().read_payload(src).await?;
        node.0.set_updated(
            payload.version().unwrap_or(0),
            payload.attrs(),
            payload.xattrs().clone(),
            Some(payload.content_len()),
        );
        Ok(node)
    }

    pub fn obj_id(&self) -> ObjId {
        self.0.obj_id().clone()
    }

    pub fn name(&self) -> String {
        self.0.name()
    }

    pub fn version(&self) -> u64 {
        self.0.version()
    }

    pub fn size(&self) -> u64 {
        self.0.size()
    }

    pub fn attrs(&self) -> CommonAttrs {
        self.0.attrs()
    }

    pub fn xattrs(&self) -> XAttrs {
        self.0.xattrs()
    }

    /// Open the current object and refresh the cached snapshot when the
    /// store has a newer version than we do.
    async fn open_payload(&self) -> Result<Payload> {
        let src = self.0.storage().get_obj(self.0.obj_id()).await?;
        let payload = self.0.persistence().read_payload(src).await?;
        if let Some(version) = payload.version() {
            self.0.refresh_from(
                version,
                payload.attrs(),
                payload.xattrs().clone(),
                Some(payload.content_len()),
            );
        }
        Ok(payload)
    }

    /// Lazy byte source over the current version, with the version
    /// observed at open time.
    pub async fn read_src(&self) -> Result<(FileByteSrc, u64)> {
        let payload = self.open_payload().await?;
        let version = payload.version().unwrap_or_else(|| self.0.version());
        Ok((FileByteSrc { payload }, version))
    }

    /// Read `[start, min(end, size))` together with the version the
    /// bytes belong to. `start ≥ size` yields empty bytes, not an
    /// error; an inverted range is a `bad-arg`.
    pub async fn read_bytes(
        &self,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<(Vec<u8>, u64)> {
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(u64::MAX);
        if end < start {
            return Err(Error::bad_arg(format!(
                "read range is inverted: start {start}, end {end}"
            )));
        }
        let payload = self.open_payload().await?;
        let version = payload.version().unwrap_or_else(|| self.0.version());
        let bytes = payload.read_content(start, end).await?;
        Ok((bytes, version))
    }

    /// One-shot write of a complete new payload. Returns the new
    /// version.
    pub async fn save(&self, bytes: &[u8], changes: Option<&XAttrsChanges>) -> Result<u64> {
        let _guard = self.0.lock_change().await;
        let params = self.0.params_for_update(changes)?;
        let stream = self
            .0
            .persistence()
            .write_whole(bytes, params.version, params.attrs, params.xattrs.clone())
            .await?;
        self.0
            .storage()
            .save_obj(self.0.obj_id(), params.version, stream)
            .await?;
        self.0.set_updated(
            params.version,
            params.attrs,
            params.xattrs,
            Some(bytes.len() as u64),
        );
        self.0.publish(ObjEvent::FileChange {
            version: params.version,
        });
        Ok(params.version)
    }

    /// Open a streaming write. The sink and the version it will produce
    /// are returned synchronously; the version is assigned before any
    /// byte is written. The node's change lock travels inside the sink
    /// and is held until `done`.
    ///
    /// With `truncate` the sink starts empty; otherwise it starts from
    /// the current content. A `current_version` that is not the live
    /// version fails with `version-mismatch` before any byte moves.
    pub async fn write_sink(
        &self,
        truncate: bool,
        current_version: Option<u64>,
        changes: Option<&XAttrsChanges>,
    ) -> Result<(FileByteSink, u64)> {
        let guard = self.0.lock_change().await;

        let live = self.0.version();
        if let Some(expected) = current_version {
            if expected != live {
                return Err(Error::version_mismatch(self.0.name(), expected, live));
            }
        }

        let params = self.0.params_for_update(changes)?;
        let base = if truncate || live == 0 {
            None
        } else {
            Some(self.0.storage().get_obj(self.0.obj_id()).await?)
        };
        let (sink, stream) = self
            .0
            .persistence()
            .write_sink(params.version, params.attrs, params.xattrs.clone(), base)
            .await?;

        let (size_tx, size_rx) = oneshot::channel::<u64>();
        let (commit_tx, commit_rx) = oneshot::channel::<Result<u64>>();

        // Detached save task: push the encrypted stream into the store,
        // rendezvous on the final size reported by the sink, then commit
        // the version into the node.
        let core = self.0.clone();
        let new_version = params.version;
        let attrs = params.attrs;
        let xattrs = params.xattrs;
        tokio::spawn(async move {
            let obj_id = core.obj_id().clone();
            let outcome = match core.storage().save_obj(&obj_id, new_version, stream).await {
                Ok(()) => match size_rx.await {
                    Ok(new_size) => {
                        core.set_updated(new_version, attrs, xattrs, Some(new_size));
                        core.publish(ObjEvent::FileChange {
                            version: new_version,
                        });
                        Ok(new_version)
                    }
                    Err(_) => Err(Error::invariant(format!(
                        "sink for {obj_id} vanished before reporting its size"
                    ))),
                },
                Err(e) => {
                    debug!("save of {obj_id} v{new_version} did not land: {e}");
                    Err(e)
                }
            };
            _ = commit_tx.send(outcome);
        });

        Ok((
            FileByteSink {
                sink: Some(sink),
                size_tx: Some(size_tx),
                commit_rx,
                _guard: guard,
            },
            params.version,
        ))
    }

    /// Apply an xattr change set: removals then sets, one version bump.
    /// Returns the new version.
    pub async fn update_xattrs(&self, changes: &XAttrsChanges) -> Result<u64> {
        let _guard = self.0.lock_change().await;
        let params = self.0.params_for_update(Some(changes))?;
        let base = self.0.storage().get_obj(self.0.obj_id()).await?;
        let (sink, stream) = self
            .0
            .persistence()
            .write_sink(params.version, params.attrs, params.xattrs.clone(), Some(base))
            .await?;
        let size = sink.done().await?;
        self.0
            .storage()
            .save_obj(self.0.obj_id(), params.version, stream)
            .await?;
        self.0
            .set_updated(params.version, params.attrs, params.xattrs, Some(size));
        self.0.publish(ObjEvent::AttrsChange {
            version: params.version,
        });
        Ok(params.version)
    }

    /// Self-contained reference to this file, including its key.
    ///
    /// Only nodes of local and synced storages can be linked to.
    pub fn get_link_params(&self) -> Result<LinkParams> {
        let storage_type = self.0.storage().kind();
        if !matches!(storage_type, StorageType::Local | StorageType::Synced) {
            return Err(Error::not_permitted(self.0.name()));
        }
        Ok(LinkParams {
            storage_type,
            readonly: false,
            target: LinkTarget::File {
                file_name: self.0.name(),
                obj_id: self.obj_id(),
                key: self.0.key().to_base64(),
            },
        })
    }
}

impl std::fmt::Debug for FileNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileNode({})", self.0.obj_id())
    }
}

/// Lazy, random-access byte source over one file version.
pub struct FileByteSrc {
    payload: Payload,
}

impl FileByteSrc {
    pub fn len(&self) -> u64 {
        self.payload.content_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn read(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        self.payload.read_content(start, end).await
    }

    pub async fn read_all(&self) -> Result<Vec<u8>> {
        self.payload.read_content_all().await
    }
}

/// Streaming write handle for one new file version.
///
/// Holds the node's change lock until [`FileByteSink::done`]; dropping
/// the sink without calling `done` abandons the write and the save task
/// discards the partial version.
pub struct FileByteSink {
    sink: Option<PayloadSink>,
    size_tx: Option<oneshot::Sender<u64>>,
    commit_rx: oneshot::Receiver<Result<u64>>,
    _guard: OwnedMutexGuard<()>,
}

impl FileByteSink {
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink
            .as_mut()
            .ok_or_else(|| Error::invariant("write after done"))?
            .write(bytes)
            .await
    }

    pub async fn seek(&mut self, pos: u64) -> Result<()> {
        self.sink
            .as_mut()
            .ok_or_else(|| Error::invariant("seek after done"))?
            .seek(pos)
            .await
    }

    /// Content length written so far.
    pub fn len(&self) -> u64 {
        self.sink.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finish the write.
    ///
    /// With `None`, seals the encryption, reports the final size to the
    /// save task and waits for the commit; save errors surface here.
    /// With `Some(err)`, cancels the save (follow-up errors from the
    /// cancellation are swallowed) and hands the error back; the
    /// node's live version is unchanged.
    pub async fn done(mut self, err: Option<Error>) -> Result<u64> {
        let sink = self
            .sink
            .take()
            .ok_or_else(|| Error::invariant("done called twice"))?;
        match err {
            None => {
                let size = sink.done().await?;
                if let Some(size_tx) = self.size_tx.take() {
                    _ = size_tx.send(size);
                }
                match self.commit_rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::invariant("save task vanished before commit")),
                }
            }
            Some(err) => {
                sink.abort(Error::bad_arg("write abandoned by caller")).await;
                // The save task fails on the aborted stream; its error
                // is a follow-up of ours and is dropped.
                _ = self.commit_rx.await;
                Err(err)
            }
        }
    }
}
