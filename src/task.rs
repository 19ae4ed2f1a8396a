//! The unit of asynchronous work a graph node wraps
//!
//! The surrounding SDK layer implements [`Task`] for each remote operation;
//! the mechanics of performing the work (HTTP calls, auth, payload encoding)
//! are opaque to this crate. A task produces exactly one value per group
//! invocation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::InvocationContext;
use crate::group::TaskGroup;

/// One produced value, tagged with the key of the node that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub key: Arc<str>,
    pub value: Value,
}

impl TaskOutput {
    pub fn new(key: Arc<str>, value: Value) -> Self {
        Self { key, value }
    }
}

/// Structural changes requested by a task's [`Task::prepare`] hook.
///
/// The hook records changes here instead of mutating the group re-entrantly;
/// the engine applies them in a bounded fixed-point pass, running `prepare`
/// on any newly introduced nodes until no node requests further change.
#[derive(Default)]
pub struct GraphMutation {
    pub(crate) dependencies: Vec<TaskGroup>,
    pub(crate) post_run_dependents: Vec<TaskGroup>,
}

impl GraphMutation {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Request a new structural dependency: the hooked node will not run
    /// until `group`'s root (and thus its whole graph) completes.
    pub fn add_dependency(&mut self, group: TaskGroup) {
        self.dependencies.push(group);
    }

    /// Request a new post-run dependent for the invoked group: `group` runs
    /// once the invocation (and its other post-run dependents) is done.
    pub fn add_post_run_dependent(&mut self, group: TaskGroup) {
        self.post_run_dependents.push(group);
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty() && self.post_run_dependents.is_empty()
    }
}

/// The task contract.
///
/// `invoke` is called at most once per node per group invocation, only after
/// every dependency has completed. Retries, if desired, belong inside an
/// individual task's own `invoke`; this layer never retries.
#[async_trait]
pub trait Task: Send + Sync {
    /// Pre-invocation graph-mutation hook; runs once per node per group
    /// invocation, before any work starts. The only place new structural
    /// edges may be added for that invocation.
    fn prepare(&self, _mutation: &mut GraphMutation) {}

    /// Perform the work, resolving to exactly one value.
    async fn invoke(&self, ctx: &InvocationContext) -> anyhow::Result<Value>;

    /// Runs once the whole group invocation has settled, successfully or
    /// not, to allow cleanup regardless of outcome.
    async fn post_run(&self, _group_faulted: bool) {}

    /// Last produced value, if the task tracks one itself. Seeds the entry
    /// cache consulted when `is_cached` is true.
    fn cached_result(&self) -> Option<Value> {
        None
    }

    /// When true, a previously produced value is reused instead of
    /// re-invoking when the node is shared by multiple dependents.
    fn is_cached(&self) -> bool {
        false
    }
}
