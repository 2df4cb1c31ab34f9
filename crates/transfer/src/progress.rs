use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Point-in-time view of a progress node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub total: u64,
}

impl ProgressSnapshot {
    /// Completed fraction in `0.0..=1.0`. An empty node reports 0.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64
    }
}

/// Callback invoked with a node's snapshot after every change in its subtree.
pub type ProgressCallback = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

/// A node in a weighted progress tree.
///
/// A node owns `total` units. Some of those units are advanced directly,
/// the rest are delegated to children: a child attached with weight `w`
/// contributes `w * child.completed / child.total` units to its parent.
/// Updates are atomic, so stage tasks may advance their nodes from any
/// thread. Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct Progress {
    node: Arc<Node>,
}

struct Node {
    total: AtomicU64,
    completed: AtomicU64,
    finished: AtomicBool,
    children: Mutex<Vec<(Progress, u64)>>,
    parent: Mutex<Weak<Node>>,
    observers: Mutex<Vec<ProgressCallback>>,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self {
            node: Arc::new(Node {
                total: AtomicU64::new(total),
                completed: AtomicU64::new(0),
                finished: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
                parent: Mutex::new(Weak::new()),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a child of `total` units accounting for `weight` of this
    /// node's units.
    pub fn child(&self, total: u64, weight: u64) -> Progress {
        let child = Progress::new(total);
        self.attach(&child, weight);
        child
    }

    /// Attaches an existing node as a child with the given weight.
    pub fn attach(&self, child: &Progress, weight: u64) {
        *child
            .node
            .parent
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(&self.node);
        self.node
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((child.clone(), weight));
        self.notify();
    }

    /// Registers an observer for this node.
    ///
    /// Observers run synchronously on the updating thread and must not
    /// register further observers on the same node.
    pub fn observe(&self, callback: ProgressCallback) {
        self.node
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Advances this node's own units.
    pub fn advance(&self, units: u64) {
        if units == 0 {
            return;
        }
        self.node.completed.fetch_add(units, Ordering::AcqRel);
        self.notify();
    }

    /// Marks the node complete regardless of its remaining units.
    pub fn finish(&self) {
        if self.node.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify();
    }

    pub fn is_finished(&self) -> bool {
        self.node.finished.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.node.total.load(Ordering::Acquire)
    }

    /// Completed units including weighted child contributions, capped at
    /// `total`.
    pub fn completed(&self) -> u64 {
        let total = self.total();
        if self.is_finished() {
            return total;
        }
        let own = self.node.completed.load(Ordering::Acquire);
        let delegated: u64 = self
            .node
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(child, weight)| child.contribution(*weight))
            .sum();
        own.saturating_add(delegated).min(total)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.completed(),
            total: self.total(),
        }
    }

    fn contribution(&self, weight: u64) -> u64 {
        if self.is_finished() {
            return weight;
        }
        let total = self.total();
        if total == 0 {
            return 0;
        }
        let completed = self.completed();
        (u128::from(weight) * u128::from(completed) / u128::from(total)) as u64
    }

    fn notify(&self) {
        let snapshot = self.snapshot();
        {
            let observers = self
                .node
                .observers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for cb in observers.iter() {
                cb(snapshot);
            }
        }
        let parent = self
            .node
            .parent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade();
        if let Some(node) = parent {
            Progress { node }.notify();
        }
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Progress")
            .field("completed", &snapshot.completed)
            .field("total", &snapshot.total)
            .finish()
    }
}
