//! Error types for graph construction and group invocation

use std::sync::Arc;

use thiserror::Error;

/// Structural errors raised synchronously at graph-build time.
///
/// A rejected operation never mutates the graph.
#[derive(Error, Debug, Clone)]
pub enum GraphError {
    /// An edge insertion would close a cycle. The path names every node on
    /// the cycle, starting and ending at the same key ("X -> ... -> X").
    #[error("cycle detected: {path}")]
    CycleDetected { path: String },

    /// A node declared a dependency on a key that is not in the table.
    #[error("node '{key}' not found in graph")]
    NodeNotFound { key: String },
}

/// Failure of a single task node within one group invocation.
#[derive(Error, Debug, Clone)]
#[error("task '{key}' failed: {cause}")]
pub struct TaskFailure {
    /// Key of the node whose task failed
    pub key: Arc<str>,
    /// The cause produced by the task's own `invoke`
    pub cause: Arc<anyhow::Error>,
}

impl TaskFailure {
    pub fn new(key: Arc<str>, cause: anyhow::Error) -> Self {
        Self {
            key,
            cause: Arc::new(cause),
        }
    }
}

/// Terminal error of a group invocation.
///
/// A faulted invocation emits all values it could compute, then exactly one
/// of these.
#[derive(Error, Debug, Clone)]
pub enum GroupError {
    /// Exactly one task failed
    #[error(transparent)]
    Task(#[from] TaskFailure),

    /// Two or more independent tasks failed before the active policy could
    /// react; their causes are aggregated in observation order.
    #[error("composite failure: {} independent task failures", .causes.len())]
    Composite { causes: Vec<TaskFailure> },

    /// A structural change requested during the pre-invocation pass was
    /// rejected (e.g. a hook tried to close a cycle).
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl GroupError {
    /// Collapse a non-empty failure list into the terminal error shape:
    /// a single failure stays simple, several become a composite.
    pub(crate) fn from_failures(mut causes: Vec<TaskFailure>) -> Self {
        if causes.len() == 1 {
            GroupError::Task(causes.remove(0))
        } else {
            GroupError::Composite { causes }
        }
    }

    /// Keys of every failed task carried by this error.
    pub fn failed_keys(&self) -> Vec<Arc<str>> {
        match self {
            GroupError::Task(f) => vec![Arc::clone(&f.key)],
            GroupError::Composite { causes } => {
                causes.iter().map(|f| Arc::clone(&f.key)).collect()
            }
            GroupError::Graph(_) => Vec::new(),
        }
    }
}
