use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::common::types::now_millis;

use super::{ConnId, SharedStore, StoreError, StoreResult, Subscription};

/// In-process implementation of [`SharedStore`] over a mutex-guarded JSON
/// tree. Mirrors the semantics the core relies on from the real transport:
/// snapshots are delivered immediately on subscribe, empty nodes do not
/// exist (writing an empty object is the same as removing the node), and
/// push keys iterate in insertion order.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

struct Watcher {
    path: Vec<String>,
    tx: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
struct Inner {
    tree: Map<String, Value>,
    watchers: HashMap<u64, Watcher>,
    /// Per-connection list of paths to remove when the connection drops.
    hooks: HashMap<ConnId, Vec<Vec<String>>>,
    next_watcher_id: u64,
    next_conn_id: u64,
    push_seq: u64,
}

fn split_path(path: &str) -> StoreResult<Vec<String>> {
    if path.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    let segments: Vec<String> = path.split('/').map(str::to_string).collect();
    if segments.iter().any(String::is_empty) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

/// Drop nulls and empty objects recursively; a node with nothing left in it
/// does not exist.
fn sanitize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut cleaned = Map::new();
            for (key, child) in map {
                let child = sanitize(child);
                if !child.is_null() {
                    cleaned.insert(key, child);
                }
            }
            if cleaned.is_empty() {
                Value::Null
            } else {
                Value::Object(cleaned)
            }
        }
        other => other,
    }
}

/// True when one path is a prefix of the other: a mutation at one affects
/// the snapshot visible at the other.
fn paths_overlap(a: &[String], b: &[String]) -> bool {
    let len = a.len().min(b.len());
    a[..len] == b[..len]
}

impl Inner {
    fn snapshot_at(&self, segments: &[String]) -> Value {
        let (first, rest) = match segments.split_first() {
            Some(split) => split,
            None => return Value::Null,
        };
        let mut node = match self.tree.get(first) {
            Some(node) => node,
            None => return Value::Null,
        };
        for segment in rest {
            node = match node.get(segment) {
                Some(child) => child,
                None => return Value::Null,
            };
        }
        node.clone()
    }

    fn set_at(&mut self, segments: &[String], value: Value) {
        let value = sanitize(value);
        if value.is_null() {
            self.remove_at(segments);
            return;
        }
        let (leaf, parents) = match segments.split_last() {
            Some(split) => split,
            None => return,
        };
        let mut node = &mut self.tree;
        for segment in parents {
            let entry = node
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            node = match entry.as_object_mut() {
                Some(map) => map,
                None => return,
            };
        }
        node.insert(leaf.clone(), value);
    }

    fn merge_at(&mut self, segments: &[String], fields: Map<String, Value>) {
        let mut map = match self.snapshot_at(segments) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in fields {
            if value.is_null() {
                map.remove(&key);
            } else {
                map.insert(key, value);
            }
        }
        self.set_at(segments, Value::Object(map));
    }

    fn remove_at(&mut self, segments: &[String]) {
        remove_in(&mut self.tree, segments);
    }

    /// Collect (sender, snapshot) pairs for every watcher the mutation at
    /// `segments` can affect; stale watchers are dropped.
    fn notifications(&mut self, segments: &[String]) -> Vec<(mpsc::UnboundedSender<Value>, Value)> {
        let snapshots: Vec<(u64, Value)> = self
            .watchers
            .iter()
            .filter(|(_, watcher)| paths_overlap(&watcher.path, segments))
            .map(|(id, watcher)| (*id, self.snapshot_at(&watcher.path)))
            .collect();
        let mut out = Vec::with_capacity(snapshots.len());
        for (id, snapshot) in snapshots {
            if let Some(watcher) = self.watchers.get(&id) {
                if watcher.tx.is_closed() {
                    self.watchers.remove(&id);
                } else {
                    out.push((watcher.tx.clone(), snapshot));
                }
            }
        }
        out
    }
}

/// Remove the node at `segments`, pruning parents left empty.
fn remove_in(node: &mut Map<String, Value>, segments: &[String]) -> bool {
    match segments {
        [] => false,
        [leaf] => {
            node.remove(leaf);
            node.is_empty()
        }
        [head, rest @ ..] => {
            let Some(child) = node.get_mut(head).and_then(Value::as_object_mut) else {
                return false;
            };
            if remove_in(child, rest) {
                node.remove(head);
            }
            node.is_empty()
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<F>(&self, segments: &[String], op: F)
    where
        F: FnOnce(&mut Inner),
    {
        let pending = {
            let mut inner = self.lock();
            op(&mut inner);
            inner.notifications(segments)
        };
        for (tx, snapshot) in pending {
            let _ = tx.send(snapshot);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn read_once(&self, path: &str) -> StoreResult<Value> {
        let segments = split_path(path)?;
        Ok(self.lock().snapshot_at(&segments))
    }

    async fn write(&self, path: &str, value: Value) -> StoreResult<()> {
        let segments = split_path(path)?;
        self.mutate(&segments, |inner| inner.set_at(&segments, value));
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> StoreResult<()> {
        let segments = split_path(path)?;
        self.mutate(&segments, |inner| inner.merge_at(&segments, fields));
        Ok(())
    }

    async fn push(&self, path: &str) -> StoreResult<String> {
        split_path(path)?;
        let mut inner = self.lock();
        inner.push_seq += 1;
        // Millis prefix + sequence keeps lexicographic order = insertion order.
        Ok(format!("k{:013}{:06}", now_millis(), inner.push_seq))
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        let segments = split_path(path)?;
        self.mutate(&segments, |inner| inner.remove_at(&segments));
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> StoreResult<Subscription> {
        let segments = split_path(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.lock();
            let id = inner.next_watcher_id;
            inner.next_watcher_id += 1;
            let initial = inner.snapshot_at(&segments);
            let _ = tx.send(initial);
            inner.watchers.insert(
                id,
                Watcher {
                    path: segments,
                    tx,
                },
            );
            id
        };
        let store = self.inner.clone();
        let unsub = Box::new(move || {
            let mut inner = store.lock().unwrap_or_else(PoisonError::into_inner);
            inner.watchers.remove(&id);
        });
        Ok(Subscription::new(rx, unsub))
    }

    fn connect(&self) -> ConnId {
        let mut inner = self.lock();
        inner.next_conn_id += 1;
        let conn = ConnId(inner.next_conn_id);
        inner.hooks.insert(conn, Vec::new());
        conn
    }

    async fn on_disconnect_remove(&self, conn: ConnId, path: &str) -> StoreResult<()> {
        let segments = split_path(path)?;
        let mut inner = self.lock();
        match inner.hooks.get_mut(&conn) {
            Some(paths) => {
                paths.push(segments);
                Ok(())
            }
            None => Err(StoreError::Closed),
        }
    }

    async fn disconnect(&self, conn: ConnId) {
        let paths = {
            let mut inner = self.lock();
            inner.hooks.remove(&conn).unwrap_or_default()
        };
        for segments in paths {
            self.mutate(&segments, |inner| inner.remove_at(&segments));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = MemoryStore::new();
        store
            .write("rooms/r1/users/u1", json!({ "username": "Alice" }))
            .await
            .unwrap();
        let value = store.read_once("rooms/r1/users/u1").await.unwrap();
        assert_eq!(value["username"], "Alice");
    }

    #[tokio::test]
    async fn missing_path_reads_null() {
        let store = MemoryStore::new();
        assert!(store.read_once("rooms/nope").await.unwrap().is_null());
    }

    #[tokio::test]
    async fn empty_path_segment_is_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.read_once("rooms//users").await,
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn update_merges_without_touching_siblings() {
        let store = MemoryStore::new();
        store
            .write("rooms/r1", json!({ "name": "Test", "lastActivity": 1 }))
            .await
            .unwrap();
        let mut fields = Map::new();
        fields.insert("lastActivity".to_string(), json!(2));
        store.update("rooms/r1", fields).await.unwrap();

        let value = store.read_once("rooms/r1").await.unwrap();
        assert_eq!(value["name"], "Test");
        assert_eq!(value["lastActivity"], 2);
    }

    #[tokio::test]
    async fn empty_objects_do_not_exist() {
        let store = MemoryStore::new();
        store
            .write("rooms/r1", json!({ "name": "Test", "users": {} }))
            .await
            .unwrap();
        assert!(store.read_once("rooms/r1/users").await.unwrap().is_null());

        store
            .write("rooms/r1/users/u1", json!({ "username": "Alice" }))
            .await
            .unwrap();
        store.remove("rooms/r1/users/u1").await.unwrap();
        // Removing the only child prunes the parent node entirely.
        assert!(store.read_once("rooms/r1/users").await.unwrap().is_null());
        assert_eq!(store.read_once("rooms/r1").await.unwrap()["name"], "Test");
    }

    #[tokio::test]
    async fn subscribe_delivers_initial_and_changes() {
        let store = MemoryStore::new();
        store.write("rooms/r1/name", json!("Test")).await.unwrap();

        let mut sub = store.subscribe("rooms/r1").await.unwrap();
        let initial = sub.next().await.unwrap();
        assert_eq!(initial["name"], "Test");

        store
            .write("rooms/r1/users/u1", json!({ "username": "Alice" }))
            .await
            .unwrap();
        let after = sub.next().await.unwrap();
        assert_eq!(after["users"]["u1"]["username"], "Alice");
    }

    #[tokio::test]
    async fn unrelated_writes_do_not_notify() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("rooms/r1").await.unwrap();
        assert!(sub.next().await.unwrap().is_null());

        store.write("rooms/r2/name", json!("Other")).await.unwrap();
        store.write("rooms/r1/name", json!("Mine")).await.unwrap();
        // Only the overlapping write produces a snapshot.
        let next = sub.next().await.unwrap();
        assert_eq!(next["name"], "Mine");
    }

    #[tokio::test]
    async fn removing_an_ancestor_notifies_child_watchers() {
        let store = MemoryStore::new();
        store
            .write("rooms/r1/users/u1", json!({ "username": "Alice" }))
            .await
            .unwrap();
        let mut sub = store.subscribe("rooms/r1/users/u1").await.unwrap();
        assert!(!sub.next().await.unwrap().is_null());

        store.remove("rooms/r1").await.unwrap();
        assert!(sub.next().await.unwrap().is_null());
    }

    #[tokio::test]
    async fn disconnect_runs_registered_removals() {
        let store = MemoryStore::new();
        let conn = store.connect();
        store
            .write("rooms/r1/users/u1", json!({ "username": "Alice" }))
            .await
            .unwrap();
        store
            .on_disconnect_remove(conn, "rooms/r1/users/u1")
            .await
            .unwrap();

        store.disconnect(conn).await;
        assert!(
            store
                .read_once("rooms/r1/users/u1")
                .await
                .unwrap()
                .is_null()
        );
        // Hooks are one-shot: registering on a dead connection fails.
        assert!(matches!(
            store.on_disconnect_remove(conn, "rooms/r1/users/u1").await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn push_keys_are_unique_and_ordered() {
        let store = MemoryStore::new();
        let mut keys = Vec::new();
        for _ in 0..10 {
            keys.push(store.push("rooms/r1/messages").await.unwrap());
        }
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, keys);
    }
}
