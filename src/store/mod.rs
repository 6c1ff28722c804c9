pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryStore;

/// Failures of the shared-store transport.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Path was empty or contained an empty segment.
    #[error("invalid store path: {0}")]
    InvalidPath(String),

    /// A value could not be encoded for the wire tree.
    #[error("store value could not be encoded: {0}")]
    Codec(#[from] serde_json::Error),

    /// The underlying connection is gone.
    #[error("store connection closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Serialize a domain value into a store node.
pub fn encode<T: Serialize>(value: &T) -> StoreResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Handle for one client connection to the store; disconnect hooks are
/// registered against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) u64);

/// Live subscription to a subtree. Yields the current snapshot immediately,
/// then one snapshot per overlapping change. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Value>,
    unsub: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Value>,
        unsub: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            rx,
            unsub: Some(unsub),
        }
    }

    /// Next snapshot, or `None` once the store side is gone.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsub) = self.unsub.take() {
            unsub();
        }
    }
}

/// The shared reactive store this core is built atop: a hierarchical
/// key-value tree with atomic per-path writes, field merges, ordered push
/// keys, subtree subscriptions, and server-detected disconnect cleanup.
///
/// Paths are `/`-separated segments (`rooms/<roomId>/users/<userId>`).
/// Writes to a single key are observed in write order by all subscribers;
/// there is no cross-key transaction.
#[async_trait]
pub trait SharedStore: Clone + Send + Sync + 'static {
    /// One-shot snapshot of a subtree; `Value::Null` when absent.
    async fn read_once(&self, path: &str) -> StoreResult<Value>;

    /// Atomic set of a subtree.
    async fn write(&self, path: &str, value: Value) -> StoreResult<()>;

    /// Atomic merge of named fields without touching siblings.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> StoreResult<()>;

    /// Allocate a unique, insertion-ordered child key under `path`.
    async fn push(&self, path: &str) -> StoreResult<String>;

    /// Delete a subtree.
    async fn remove(&self, path: &str) -> StoreResult<()>;

    /// Continuous snapshot delivery for any change under `path`.
    async fn subscribe(&self, path: &str) -> StoreResult<Subscription>;

    /// Open a logical connection for disconnect-hook registration.
    fn connect(&self) -> ConnId;

    /// Guarantee `path` is removed server-side once `conn` is observed gone.
    async fn on_disconnect_remove(&self, conn: ConnId, path: &str) -> StoreResult<()>;

    /// Mark `conn` gone and run its registered cleanup actions.
    async fn disconnect(&self, conn: ConnId);
}
