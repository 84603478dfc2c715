// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Event routing: turns objId-level store events into per-node and
//! path-shaped tree events.
//!
//! The store delivers events keyed by object id; tree watchers want
//! paths that stay correct across renames and moves. Each `watch_tree`
//! subscription owns one [`ObjIdToPath`] map, seeded by a depth-first
//! walk of the watched subtree and corrected on every incoming event.
//! A cross-folder move arrives as a removal/addition pair sharing a
//! move label; the map converges whichever half arrives first.

use crate::error::Result;
use crate::folder::FolderNode;
use crate::kind::NodeKind;
use crate::path::join_rel;
use crate::storage::{MoveLabel, NodeEvent, ObjEvent, ObjId, Storage};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// A path-shaped event delivered to a tree watcher. For entry events
/// the path names the affected CHILD (its former path for removals, its
/// new path for additions and renames).
#[derive(Debug, Clone)]
pub struct TreeEvent {
    pub path: String,
    pub event: ObjEvent,
}

/// Observer of watched events; closures implement it.
pub trait Observer<E>: Send + Sync + 'static {
    fn on_event(&self, event: E);
}

impl<E, F> Observer<E> for F
where
    F: Fn(E) + Send + Sync + 'static,
{
    fn on_event(&self, event: E) {
        self(event)
    }
}

/// Handle on a watch subscription; detaching is idempotent. The
/// subscription also ends when the filesystem closes.
pub struct WatchHandle {
    detached: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    pub fn detach(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            self.task.abort();
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WatchHandle{{detached:{}}}", self.is_detached())
    }
}

enum PendingMove {
    NewPath(String),
    Obj(ObjId),
}

/// objId → consumer-visible relative path for one watched subtree, with
/// in-flight moves pending by label. Single-owner per subscription.
struct ObjIdToPath {
    paths: HashMap<ObjId, String>,
    pending: HashMap<MoveLabel, PendingMove>,
}

impl ObjIdToPath {
    fn new(root: ObjId) -> Self {
        let mut paths = HashMap::new();
        paths.insert(root, ".".to_string());
        ObjIdToPath {
            paths,
            pending: HashMap::new(),
        }
    }

    fn find_by_path(&self, path: &str) -> Option<ObjId> {
        self.paths
            .iter()
            .find(|(_, p)| p.as_str() == path)
            .map(|(id, _)| id.clone())
    }

    /// Rewrite `old` and every path under it to live under `new`.
    fn remap_prefix(&mut self, old: &str, new: &str) {
        let old_dir = format!("{old}/");
        for path in self.paths.values_mut() {
            if path == old {
                *path = new.to_string();
            } else if let Some(rest) = path.strip_prefix(&old_dir) {
                *path = format!("{new}/{rest}");
            }
        }
    }

    /// Drop `path` and everything under it.
    fn remove_prefix(&mut self, path: &str) {
        let dir = format!("{path}/");
        self.paths
            .retain(|_, p| p != path && !p.starts_with(&dir));
    }

    /// Apply one store event; returns the corrected event to emit, or
    /// `None` when the event does not touch the watched subtree.
    fn correct(&mut self, ev: NodeEvent) -> Option<TreeEvent> {
        if let Some(path) = self.paths.get(&ev.obj_id).cloned() {
            return self.correct_known(path, ev);
        }
        // Unknown object under a known parent: adopt it, unless it is
        // going away anyway.
        if matches!(ev.event, ObjEvent::Removed) {
            return None;
        }
        let parent_path = ev
            .parent_obj_id
            .as_ref()
            .and_then(|pid| self.paths.get(pid).cloned())?;
        let name = ev.name?;
        let path = join_rel(&parent_path, &name);
        self.paths.insert(ev.obj_id, path.clone());
        Some(TreeEvent {
            path,
            event: ev.event,
        })
    }

    fn correct_known(&mut self, path: String, ev: NodeEvent) -> Option<TreeEvent> {
        match &ev.event {
            ObjEvent::Removed => {
                self.remove_prefix(&path);
                self.paths.remove(&ev.obj_id);
                Some(TreeEvent {
                    path,
                    event: ev.event,
                })
            }
            ObjEvent::FileChange { .. } | ObjEvent::AttrsChange { .. } => Some(TreeEvent {
                path,
                event: ev.event,
            }),
            ObjEvent::EntryRenamed { old_name, new_name } => {
                let old_path = join_rel(&path, old_name);
                let new_path = join_rel(&path, new_name);
                if self.find_by_path(&old_path).is_some() {
                    self.remap_prefix(&old_path, &new_path);
                }
                Some(TreeEvent {
                    path: new_path,
                    event: ev.event,
                })
            }
            ObjEvent::EntryRemoved { name, move_label } => {
                let child_path = join_rel(&path, name);
                match move_label {
                    Some(label) => match self.pending.remove(label) {
                        // The addition half already landed; its remap
                        // took the subtree along.
                        Some(PendingMove::NewPath(_)) => {}
                        _ => {
                            if let Some(child_id) = self.find_by_path(&child_path) {
                                self.pending.insert(*label, PendingMove::Obj(child_id));
                            }
                        }
                    },
                    None => self.remove_prefix(&child_path),
                }
                Some(TreeEvent {
                    path: child_path,
                    event: ev.event,
                })
            }
            ObjEvent::EntryAdded {
                entry,
                child_obj_id,
                move_label,
            } => {
                let new_path = join_rel(&path, &entry.name);
                match move_label {
                    Some(label) => match self.pending.remove(label) {
                        Some(PendingMove::Obj(child_id)) => {
                            if let Some(old_path) = self.paths.get(&child_id).cloned() {
                                self.remap_prefix(&old_path, &new_path);
                            } else {
                                self.paths.insert(child_id, new_path.clone());
                            }
                        }
                        _ => {
                            // Addition half first: move the subtree now
                            // and leave a marker for the removal half.
                            if let Some(old_path) = self.paths.get(child_obj_id).cloned() {
                                self.remap_prefix(&old_path, &new_path);
                            } else {
                                self.paths.insert(child_obj_id.clone(), new_path.clone());
                            }
                            self.pending
                                .insert(*label, PendingMove::NewPath(new_path.clone()));
                        }
                    },
                    None => {
                        self.paths.insert(child_obj_id.clone(), new_path.clone());
                    }
                }
                Some(TreeEvent {
                    path: new_path,
                    event: ev.event,
                })
            }
        }
    }
}

/// Joins a watcher's root display path with a corrected relative path.
fn display_path(root: &str, rel: &str) -> String {
    if rel == "." {
        return root.to_string();
    }
    if root == "/" {
        format!("/{rel}")
    } else {
        format!("{root}/{rel}")
    }
}

/// Seed the map with a depth-first walk; files and links are leaves,
/// folders are recursed into.
fn seed_subtree<'a>(
    folder: &'a FolderNode,
    base: String,
    map: &'a mut ObjIdToPath,
) -> BoxFuture<'a, Result<()>> {
    async move {
        for (name, entry) in folder.entries_snapshot() {
            let path = join_rel(&base, &name);
            map.paths.insert(entry.obj_id.clone(), path.clone());
            if entry.kind == NodeKind::Folder {
                if let Some(child) = folder.get_folder_opt(&name).await? {
                    seed_subtree(&child, path, map).await?;
                }
            }
        }
        Ok(())
    }
    .boxed()
}

/// Spawn a tree watch over `folder`, delivering path-corrected events
/// until detach or close.
pub(crate) async fn spawn_tree_watch(
    storage: &Arc<dyn Storage>,
    folder: &FolderNode,
    root_display: String,
    mut close_rx: watch::Receiver<bool>,
    observer: Box<dyn Observer<TreeEvent>>,
) -> Result<WatchHandle> {
    // Subscribe before the seeding walk so no event falls in between.
    let mut events = storage.node_events();
    let mut map = ObjIdToPath::new(folder.obj_id());
    seed_subtree(folder, ".".to_string(), &mut map).await?;

    let detached = Arc::new(AtomicBool::new(false));
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = close_rx.changed() => {
                    if changed.is_err() || *close_rx.borrow() {
                        break;
                    }
                }
                received = events.recv() => {
                    match received {
                        Ok(ev) => {
                            if let Some(corrected) = map.correct(ev) {
                                observer.on_event(TreeEvent {
                                    path: display_path(&root_display, &corrected.path),
                                    event: corrected.event,
                                });
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!("tree watch lagged, {missed} events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });
    Ok(WatchHandle { detached, task })
}

/// Spawn a single-node watch delivering this object's events only.
pub(crate) fn spawn_node_watch(
    storage: &Arc<dyn Storage>,
    obj_id: ObjId,
    mut close_rx: watch::Receiver<bool>,
    observer: Box<dyn Observer<ObjEvent>>,
) -> WatchHandle {
    let mut events = storage.node_events();
    let detached = Arc::new(AtomicBool::new(false));
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = close_rx.changed() => {
                    if changed.is_err() || *close_rx.borrow() {
                        break;
                    }
                }
                received = events.recv() => {
                    match received {
                        Ok(ev) if ev.obj_id == obj_id => {
                            let ended = matches!(ev.event, ObjEvent::Removed);
                            observer.on_event(ev.event);
                            if ended {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!("node watch lagged, {missed} events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });
    WatchHandle { detached, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ListingEntry;

    fn folder_ev(folder: &str, event: ObjEvent) -> NodeEvent {
        NodeEvent {
            obj_id: ObjId::new(folder),
            parent_obj_id: None,
            name: None,
            event,
        }
    }

    fn map_with_two_folders() -> ObjIdToPath {
        let mut map = ObjIdToPath::new(ObjId::new("root"));
        map.paths.insert(ObjId::new("x"), "x".to_string());
        map.paths.insert(ObjId::new("y"), "y".to_string());
        map.paths.insert(ObjId::new("f"), "x/f".to_string());
        map
    }

    fn removal(name: &str, label: MoveLabel) -> ObjEvent {
        ObjEvent::EntryRemoved {
            name: name.to_string(),
            move_label: Some(label),
        }
    }

    fn addition(name: &str, child: &str, label: MoveLabel) -> ObjEvent {
        ObjEvent::EntryAdded {
            entry: ListingEntry {
                name: name.to_string(),
                kind: NodeKind::File,
            },
            child_obj_id: ObjId::new(child),
            move_label: Some(label),
        }
    }

    #[test]
    fn test_move_removal_then_addition() {
        let mut map = map_with_two_folders();

        let out = map.correct(folder_ev("x", removal("f", 7))).unwrap();
        assert_eq!(out.path, "x/f");
        let out = map.correct(folder_ev("y", addition("g", "f", 7))).unwrap();
        assert_eq!(out.path, "y/g");

        assert_eq!(map.paths.get(&ObjId::new("f")).unwrap(), "y/g");
        assert!(map.pending.is_empty());
    }

    #[test]
    fn test_move_addition_then_removal() {
        let mut map = map_with_two_folders();

        let out = map.correct(folder_ev("y", addition("g", "f", 7))).unwrap();
        assert_eq!(out.path, "y/g");
        let out = map.correct(folder_ev("x", removal("f", 7))).unwrap();
        assert_eq!(out.path, "x/f");

        assert_eq!(map.paths.get(&ObjId::new("f")).unwrap(), "y/g");
        assert!(map.pending.is_empty());
    }

    #[test]
    fn test_rename_remaps_descendants() {
        let mut map = ObjIdToPath::new(ObjId::new("root"));
        map.paths.insert(ObjId::new("d"), "d".to_string());
        map.paths.insert(ObjId::new("s"), "d/sub".to_string());
        map.paths.insert(ObjId::new("f"), "d/sub/f".to_string());

        let out = map
            .correct(folder_ev(
                "d",
                ObjEvent::EntryRenamed {
                    old_name: "sub".to_string(),
                    new_name: "renamed".to_string(),
                },
            ))
            .unwrap();
        assert_eq!(out.path, "d/renamed");
        assert_eq!(map.paths.get(&ObjId::new("s")).unwrap(), "d/renamed");
        assert_eq!(map.paths.get(&ObjId::new("f")).unwrap(), "d/renamed/f");
    }

    #[test]
    fn test_unknown_object_is_dropped() {
        let mut map = ObjIdToPath::new(ObjId::new("root"));
        let ev = NodeEvent {
            obj_id: ObjId::new("stranger"),
            parent_obj_id: Some(ObjId::new("nowhere")),
            name: Some("s".to_string()),
            event: ObjEvent::FileChange { version: 3 },
        };
        assert!(map.correct(ev).is_none());
    }

    #[test]
    fn test_unknown_object_with_known_parent_is_adopted() {
        let mut map = ObjIdToPath::new(ObjId::new("root"));
        let ev = NodeEvent {
            obj_id: ObjId::new("late"),
            parent_obj_id: Some(ObjId::new("root")),
            name: Some("late.txt".to_string()),
            event: ObjEvent::FileChange { version: 1 },
        };
        let out = map.correct(ev).unwrap();
        assert_eq!(out.path, "late.txt");
        assert_eq!(map.paths.get(&ObjId::new("late")).unwrap(), "late.txt");
    }

    #[test]
    fn test_removed_drops_subtree() {
        let mut map = ObjIdToPath::new(ObjId::new("root"));
        map.paths.insert(ObjId::new("d"), "d".to_string());
        map.paths.insert(ObjId::new("f"), "d/f".to_string());

        let out = map
            .correct(folder_ev("d", ObjEvent::Removed))
            .unwrap();
        assert_eq!(out.path, "d");
        assert!(!map.paths.contains_key(&ObjId::new("d")));
        assert!(!map.paths.contains_key(&ObjId::new("f")));
    }

    #[test]
    fn test_display_path() {
        assert_eq!(display_path("/", "."), "/");
        assert_eq!(display_path("/", "x/f"), "/x/f");
        assert_eq!(display_path("/sub", "x"), "/sub/x");
    }
}
