//! Transactional access to persisted node rows.
//!
//! Transactions are short-lived and synchronous. They are opened, used
//! and saved between two `.await` points, never across one, which the
//! non-`Send` transaction type enforces.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nimbus_protocol::{Node, NodeId};
use tracing::trace;

use crate::error::SyncError;

/// Persistent metadata store.
pub trait MetadataStore: Send + Sync {
    /// Opens a serializable transaction.
    fn begin(&self) -> Box<dyn StoreTransaction + '_>;
}

/// A scoped unit of reads and writes. Writes become visible to other
/// transactions only after [`save`](StoreTransaction::save) succeeds.
pub trait StoreTransaction {
    fn exists(&self, id: &NodeId) -> bool;

    /// Returns the rows found for `ids`, skipping unknown ids.
    fn fetch(&self, ids: &[NodeId]) -> Vec<Node>;

    fn upsert(&mut self, node: Node);

    /// File rows with a draft revision or a pending upload id.
    fn nodes_with_pending_upload(&self) -> Vec<Node>;

    fn save(self: Box<Self>) -> Result<(), SyncError>;

    fn fetch_one(&self, id: &NodeId) -> Option<Node> {
        self.fetch(std::slice::from_ref(id)).into_iter().next()
    }
}

/// Runs `f` in a read-only transaction.
pub fn read<R>(store: &dyn MetadataStore, f: impl FnOnce(&dyn StoreTransaction) -> R) -> R {
    let tx = store.begin();
    f(tx.as_ref())
}

/// Runs `f` in a transaction and saves it if `f` succeeds.
pub fn write<R>(
    store: &dyn MetadataStore,
    f: impl FnOnce(&mut dyn StoreTransaction) -> Result<R, SyncError>,
) -> Result<R, SyncError> {
    let mut tx = store.begin();
    let out = f(tx.as_mut())?;
    tx.save()?;
    Ok(out)
}

/// Loads one node or fails with [`SyncError::NodeNotFound`].
pub fn load_node(store: &dyn MetadataStore, id: &NodeId) -> Result<Node, SyncError> {
    read(store, |tx| tx.fetch_one(id)).ok_or_else(|| SyncError::NodeNotFound(id.clone()))
}

/// Loads, edits and saves one node in a single transaction.
pub fn update_node<R>(
    store: &dyn MetadataStore,
    id: &NodeId,
    f: impl FnOnce(&mut Node) -> Result<R, SyncError>,
) -> Result<R, SyncError> {
    write(store, |tx| {
        let mut node = tx
            .fetch_one(id)
            .ok_or_else(|| SyncError::NodeNotFound(id.clone()))?;
        let out = f(&mut node)?;
        tx.upsert(node);
        Ok(out)
    })
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process [`MetadataStore`]. Transactions hold the store lock, so they
/// are fully serialized.
#[derive(Default)]
pub struct MemoryStore {
    nodes: Mutex<HashMap<NodeId, Node>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a row outside any transaction.
    pub fn insert(&self, node: Node) {
        self.lock().insert(node.id.clone(), node);
    }

    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Makes every following `save` fail until reset. Staged writes are
    /// discarded, committed rows stay intact.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MetadataStore for MemoryStore {
    fn begin(&self) -> Box<dyn StoreTransaction + '_> {
        Box::new(MemoryTransaction {
            rows: self.lock(),
            staged: HashMap::new(),
            store: self,
        })
    }
}

struct MemoryTransaction<'a> {
    rows: MutexGuard<'a, HashMap<NodeId, Node>>,
    staged: HashMap<NodeId, Node>,
    store: &'a MemoryStore,
}

impl MemoryTransaction<'_> {
    fn get(&self, id: &NodeId) -> Option<&Node> {
        self.staged.get(id).or_else(|| self.rows.get(id))
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn exists(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    fn fetch(&self, ids: &[NodeId]) -> Vec<Node> {
        ids.iter().filter_map(|id| self.get(id).cloned()).collect()
    }

    fn upsert(&mut self, node: Node) {
        self.staged.insert(node.id.clone(), node);
    }

    fn nodes_with_pending_upload(&self) -> Vec<Node> {
        let mut pending: Vec<Node> = self
            .rows
            .keys()
            .chain(self.staged.keys())
            .filter_map(|id| self.get(id))
            .filter(|n| n.has_pending_upload())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        pending.dedup_by(|a, b| a.id == b.id);
        pending
    }

    fn save(mut self: Box<Self>) -> Result<(), SyncError> {
        if self.store.fail_saves.load(Ordering::SeqCst) {
            return Err(SyncError::Store("save rejected".into()));
        }
        let staged = std::mem::take(&mut self.staged);
        trace!(rows = staged.len(), "saving transaction");
        self.rows.extend(staged);
        self.store.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
