//! Graph vertex: a keyed node with dependency and dependent edge sets
//!
//! Edge sets are kept mutually consistent (A in B's dependencies iff B in
//! A's dependents) by the [`Dag`](crate::graph::Dag) wiring methods; nothing
//! else mutates them.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::interner::intern;

#[derive(Debug, Default)]
struct Edges {
    dependencies: HashSet<Arc<str>>,
    dependents: HashSet<Arc<str>>,
}

/// A keyed vertex carrying a payload and its edge sets.
#[derive(Debug)]
pub struct Node<P> {
    key: Arc<str>,
    payload: P,
    edges: RwLock<Edges>,
}

impl<P> Node<P> {
    /// Create a node with no edges.
    pub fn new(key: &str, payload: P) -> Self {
        Self {
            key: intern(key),
            payload,
            edges: RwLock::new(Edges::default()),
        }
    }

    /// Declare a dependency key at construction time (builder style).
    ///
    /// The edge becomes live (and mutually consistent) when the node is
    /// registered via [`Dag::add_node`](crate::graph::Dag::add_node).
    pub fn depends_on(self, key: &str) -> Self {
        self.edges.write().dependencies.insert(intern(key));
        self
    }

    #[inline]
    pub fn key(&self) -> &Arc<str> {
        &self.key
    }

    #[inline]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Keys this node depends on (must complete first).
    pub fn dependency_keys(&self) -> Vec<Arc<str>> {
        self.edges.read().dependencies.iter().cloned().collect()
    }

    /// Reverse edges: keys that depend on this node.
    pub fn dependent_keys(&self) -> Vec<Arc<str>> {
        self.edges.read().dependents.iter().cloned().collect()
    }

    pub fn has_dependency(&self, key: &str) -> bool {
        self.edges.read().dependencies.contains(key)
    }

    pub fn has_dependents(&self) -> bool {
        !self.edges.read().dependents.is_empty()
    }

    pub(crate) fn add_dependency(&self, key: Arc<str>) {
        self.edges.write().dependencies.insert(key);
    }

    pub(crate) fn remove_dependency(&self, key: &str) {
        self.edges.write().dependencies.remove(key);
    }

    pub(crate) fn add_dependent(&self, key: Arc<str>) {
        self.edges.write().dependents.insert(key);
    }

    pub(crate) fn remove_dependent(&self, key: &str) {
        self.edges.write().dependents.remove(key);
    }
}
