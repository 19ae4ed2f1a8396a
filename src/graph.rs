//! Mergeable DAG container with pull-based topological enumeration
//!
//! A [`Dag`] is a handle onto a shared node arena: it stores its root key
//! and resolves every lookup through the (possibly bubbled-up) table.
//! Structural merges union the arenas of two handles; enumeration is an
//! incremental Kahn's algorithm pulled one ready node at a time, so a node
//! becomes dispatchable the instant its own dependencies finish.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::GraphError;
use crate::node::Node;
use crate::table::NodeTable;

/// Result of pulling the traversal protocol.
pub enum NextNode<P> {
    /// A node whose dependencies have all completed; returned at most once.
    /// Every `Ready` node must eventually be passed to `report_completion`.
    Ready(Arc<Node<P>>),
    /// No node is dispatchable right now; progress resumes only via
    /// `report_completion`.
    Waiting,
    /// Every reachable node has completed.
    Exhausted,
}

#[derive(Default)]
struct Traversal {
    reachable: HashSet<Arc<str>>,
    /// Unmet-dependency countdown per reachable node
    pending: HashMap<Arc<str>, usize>,
    ready: VecDeque<Arc<str>>,
    returned: HashSet<Arc<str>>,
    completed: HashSet<Arc<str>>,
}

/// A DAG handle: root key, shared node table, and traversal bookkeeping.
pub struct Dag<P> {
    root_key: Arc<str>,
    table: Arc<NodeTable<P>>,
    traversal: Mutex<Traversal>,
}

impl<P> Dag<P> {
    /// Create a graph owning a fresh table with `root` as its only node.
    pub fn new(root: Node<P>) -> Self {
        let table = NodeTable::new();
        let root_key = root.key().clone();
        table.insert(Arc::new(root));
        Self {
            root_key,
            table,
            traversal: Mutex::new(Traversal::default()),
        }
    }

    #[inline]
    pub fn root_key(&self) -> &Arc<str> {
        &self.root_key
    }

    /// O(1) lookup via the (possibly bubbled-up) node table.
    #[inline]
    pub fn get_node(&self, key: &str) -> Option<Arc<Node<P>>> {
        self.table.get(key)
    }

    /// Number of nodes in the backing table (across all merged handles).
    pub fn node_count(&self) -> usize {
        self.table.len()
    }

    /// Register a node under its key. Declared dependency keys must already
    /// be present; both edge directions are wired immediately.
    pub fn add_node(&self, node: Node<P>) -> Result<(), GraphError> {
        let deps = node.dependency_keys();
        for dep in &deps {
            if !self.table.contains(dep) {
                return Err(GraphError::NodeNotFound {
                    key: dep.to_string(),
                });
            }
        }
        let node = Arc::new(node);
        for dep in &deps {
            if let Some(dependency) = self.table.get(dep) {
                dependency.add_dependent(node.key().clone());
            }
        }
        self.table.insert(node);
        Ok(())
    }

    /// Make this graph's root depend on `other`'s root: `self` cannot
    /// proceed until `other`'s root completes. Tables are unioned.
    pub fn add_dependency_graph(&self, other: &Dag<P>) -> Result<(), GraphError> {
        let from = self.root_key.clone();
        self.wire_dependency(&from, other)
    }

    /// Symmetric merge: `other`'s root depends on this graph's root. Used to
    /// attach a successor graph at the root level.
    pub fn add_dependent_graph(&self, other: &Dag<P>) -> Result<(), GraphError> {
        let from = other.root_key.clone();
        other.wire_dependency(&from, self)
    }

    /// Wire `from_key` (a node of this graph) to depend on `other`'s root,
    /// merging the two tables. Rejected before any mutation if the edge
    /// would close a cycle.
    pub(crate) fn wire_dependency(
        &self,
        from_key: &Arc<str>,
        other: &Dag<P>,
    ) -> Result<(), GraphError> {
        // Walk forward from `other` first: if `from_key` is already reachable
        // along dependency edges, the new edge would close a loop.
        if let Some(path) = other.has_path(other.root_key(), from_key) {
            let mut cycle: Vec<Arc<str>> = Vec::with_capacity(path.len() + 1);
            cycle.push(from_key.clone());
            cycle.extend(path);
            return Err(GraphError::CycleDetected {
                path: format_path(&cycle),
            });
        }

        let table = NodeTable::merge(&self.table, &other.table);
        let from = table.get(from_key).ok_or_else(|| GraphError::NodeNotFound {
            key: from_key.to_string(),
        })?;
        let to = table
            .get(other.root_key())
            .ok_or_else(|| GraphError::NodeNotFound {
                key: other.root_key().to_string(),
            })?;

        from.add_dependency(to.key().clone());
        to.add_dependent(from.key().clone());
        Ok(())
    }

    /// Swap one dependency edge of `node_key` for another, keeping both
    /// directions consistent. Used when consumers are redirected to a proxy.
    pub(crate) fn replace_dependency(&self, node_key: &str, old_dep: &str, new_dep: &Arc<str>) {
        let (node, old, new) = match (
            self.table.get(node_key),
            self.table.get(old_dep),
            self.table.get(new_dep),
        ) {
            (Some(n), Some(o), Some(nw)) => (n, o, nw),
            _ => return,
        };
        node.remove_dependency(old_dep);
        old.remove_dependent(node_key);
        node.add_dependency(new_dep.clone());
        new.add_dependent(node.key().clone());
    }

    /// Check for a path from `from` to `to` along dependency edges (BFS),
    /// returning the full path (inclusive) when one exists.
    pub fn has_path(&self, from: &str, to: &str) -> Option<Vec<Arc<str>>> {
        let start = self.get_node(from)?;
        let start_key = start.key().clone();
        if from == to {
            return Some(vec![start_key]);
        }

        let mut visited: HashSet<Arc<str>> = HashSet::new();
        let mut predecessor: HashMap<Arc<str>, Arc<str>> = HashMap::new();
        let mut queue: VecDeque<Arc<str>> = VecDeque::new();

        visited.insert(start_key.clone());
        queue.push_back(start_key);

        while let Some(current) = queue.pop_front() {
            let node = match self.get_node(&current) {
                Some(n) => n,
                None => continue,
            };
            for next in node.dependency_keys() {
                if !visited.insert(next.clone()) {
                    continue;
                }
                predecessor.insert(next.clone(), current.clone());
                if &*next == to {
                    let mut path = vec![next.clone()];
                    let mut cursor = next;
                    while let Some(prev) = predecessor.get(&cursor).cloned() {
                        path.push(prev.clone());
                        cursor = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Keys reachable from the root along dependency edges: the handle's
    /// view of the shared arena, root first (DFS preorder).
    pub fn reachable_keys(&self) -> Vec<Arc<str>> {
        let mut visited: HashSet<Arc<str>> = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![self.root_key.clone()];

        while let Some(key) = stack.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            if let Some(node) = self.get_node(&key) {
                order.push(key);
                for dep in node.dependency_keys() {
                    if !visited.contains(&dep) {
                        stack.push(dep);
                    }
                }
            }
        }
        order
    }

    /// Compute the initial ready frontier and reset traversal bookkeeping.
    ///
    /// Single pass per call; not reentrant concurrently with itself.
    pub fn prepare_for_enumeration(&self) {
        let keys = self.reachable_keys();
        let mut guard = self.traversal.lock();
        let t = &mut *guard;
        *t = Traversal::default();

        for key in &keys {
            t.reachable.insert(key.clone());
        }
        for key in keys {
            let count = self
                .get_node(&key)
                .map(|n| n.dependency_keys().len())
                .unwrap_or(0);
            if count == 0 {
                t.ready.push_back(key.clone());
            }
            t.pending.insert(key, count);
        }
    }

    /// Pull one not-yet-returned ready node, or report `Waiting` (outstanding
    /// dependencies) versus `Exhausted` (whole reachable graph completed).
    pub fn get_next(&self) -> NextNode<P> {
        let mut guard = self.traversal.lock();
        let t = &mut *guard;

        while let Some(key) = t.ready.pop_front() {
            if !t.returned.insert(key.clone()) {
                continue;
            }
            if let Some(node) = self.get_node(&key) {
                return NextNode::Ready(node);
            }
        }

        if !t.reachable.is_empty() && t.completed.len() == t.reachable.len() {
            NextNode::Exhausted
        } else {
            NextNode::Waiting
        }
    }

    /// Mark a node complete: decrement the pending counters of its
    /// dependents; any dependent reaching zero joins the ready frontier.
    pub fn report_completion(&self, key: &str) {
        let node = match self.get_node(key) {
            Some(n) => n,
            None => return,
        };
        let mut guard = self.traversal.lock();
        let t = &mut *guard;

        if !t.reachable.contains(key) || !t.completed.insert(node.key().clone()) {
            return;
        }
        for dependent in node.dependent_keys() {
            if !t.reachable.contains(&dependent) {
                continue;
            }
            if let Some(count) = t.pending.get_mut(&dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    t.ready.push_back(dependent);
                }
            }
        }
    }
}

fn format_path(path: &[Arc<str>]) -> String {
    path.iter()
        .map(|k| k.as_ref())
        .collect::<Vec<&str>>()
        .join(" -> ")
}
