//! Shared node arena with merge "bubble-up"
//!
//! A [`NodeTable`] is the identity of a DAG: a mapping from key to node,
//! logically singular even when several graph handles reference overlapping
//! subgraphs. Merging two tables moves the smaller root table's entries into
//! the larger and leaves a forwarding pointer behind, so lookups through
//! either pre-merge handle chase to the same node instances.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::node::Node;

pub(crate) struct NodeTable<P> {
    entries: DashMap<Arc<str>, Arc<Node<P>>>,
    /// Set once this table has been absorbed into another; all lookups and
    /// inserts are then answered by the forward target.
    forward: RwLock<Option<Arc<NodeTable<P>>>>,
}

impl<P> NodeTable<P> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            forward: RwLock::new(None),
        })
    }

    /// Chase forwarding pointers to the table that currently owns the
    /// entries ("bubbling up").
    pub(crate) fn resolve(self: &Arc<Self>) -> Arc<Self> {
        let mut current = Arc::clone(self);
        loop {
            let next = current.forward.read().clone();
            match next {
                Some(target) => current = target,
                None => return current,
            }
        }
    }

    pub(crate) fn insert(self: &Arc<Self>, node: Arc<Node<P>>) {
        let root = self.resolve();
        root.entries.insert(Arc::clone(node.key()), node);
    }

    pub(crate) fn get(self: &Arc<Self>, key: &str) -> Option<Arc<Node<P>>> {
        let root = self.resolve();
        root.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    pub(crate) fn contains(self: &Arc<Self>, key: &str) -> bool {
        self.resolve().entries.contains_key(key)
    }

    pub(crate) fn len(self: &Arc<Self>) -> usize {
        self.resolve().entries.len()
    }

    /// Union two tables. The smaller root table's entries move into the
    /// larger; the drained table forwards to the survivor. Keys already
    /// present in the survivor win, so a subgraph shared by both sides keeps
    /// a single node instance per key.
    pub(crate) fn merge(a: &Arc<Self>, b: &Arc<Self>) -> Arc<Self> {
        let ra = a.resolve();
        let rb = b.resolve();
        if Arc::ptr_eq(&ra, &rb) {
            return ra;
        }

        let (survivor, absorbed) = if ra.entries.len() >= rb.entries.len() {
            (ra, rb)
        } else {
            (rb, ra)
        };

        let keys: Vec<Arc<str>> = absorbed.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((k, node)) = absorbed.entries.remove(&key) {
                survivor.entries.entry(k).or_insert(node);
            }
        }
        *absorbed.forward.write() = Some(Arc::clone(&survivor));
        survivor
    }
}
