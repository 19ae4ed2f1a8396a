//! Task groups and transparent "run after" composition
//!
//! A [`TaskGroup`] is a DAG of task-wrapped nodes plus the handle callers
//! build against: dependency wiring merges groups structurally, while
//! "post-run dependents" splice a run-after relationship through a lazily
//! created proxy group without touching the consumers' declared edges.

use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::context::InvocationContext;
use crate::engine;
use crate::error::{GraphError, GroupError};
use crate::graph::Dag;
use crate::node::Node;
use crate::task::{GraphMutation, Task, TaskOutput};

/// Node payload: the wrapped task plus entry-level bookkeeping.
pub(crate) struct TaskEntry {
    pub(crate) task: Arc<dyn Task>,
    /// Last produced value, shared across invocations through the arena
    cached: RwLock<Option<Value>>,
    /// Synthesized proxy roots are excluded from the output sequence
    internal: bool,
}

impl TaskEntry {
    fn new(task: Arc<dyn Task>, internal: bool) -> Self {
        Self {
            task,
            cached: RwLock::new(None),
            internal,
        }
    }

    #[inline]
    pub(crate) fn is_internal(&self) -> bool {
        self.internal
    }

    /// Previously produced value: the entry cache, seeded from the task's
    /// own `cached_result` if it tracks one.
    pub(crate) fn cached_value(&self) -> Option<Value> {
        self.cached
            .read()
            .clone()
            .or_else(|| self.task.cached_result())
    }

    pub(crate) fn store_value(&self, value: Value) {
        *self.cached.write() = Some(value);
    }
}

/// Root task of a proxy group; produces nothing visible.
struct ProxyTask;

#[async_trait]
impl Task for ProxyTask {
    async fn invoke(&self, _ctx: &InvocationContext) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }
}

struct GroupInner {
    dag: Dag<TaskEntry>,
    /// Lazily created auxiliary group; its lifetime is tied to this group
    proxy: RwLock<Option<TaskGroup>>,
    /// Consumer node keys wired directly at our root while no proxy
    /// existed; redirected to the proxy root the moment one is created
    parents: Mutex<Vec<Arc<str>>>,
}

/// A DAG of task-wrapped nodes plus its execution engine handle.
///
/// Cheap to clone; clones share the same group.
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<GroupInner>,
}

impl TaskGroup {
    /// Create a group whose root node wraps `task` under `key`.
    pub fn new(key: &str, task: impl Task + 'static) -> Self {
        Self::build(key, Arc::new(task), false)
    }

    fn build(key: &str, task: Arc<dyn Task>, internal: bool) -> Self {
        let entry = TaskEntry::new(task, internal);
        Self {
            inner: Arc::new(GroupInner {
                dag: Dag::new(Node::new(key, entry)),
                proxy: RwLock::new(None),
                parents: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    pub fn root_key(&self) -> &Arc<str> {
        self.inner.dag.root_key()
    }

    #[inline]
    pub(crate) fn dag(&self) -> &Dag<TaskEntry> {
        &self.inner.dag
    }

    /// Whether `key` resolves through this group's (merged) node table.
    pub fn contains_task(&self, key: &str) -> bool {
        self.inner.dag.get_node(key).is_some()
    }

    pub(crate) fn has_proxy(&self) -> bool {
        self.inner.proxy.read().is_some()
    }

    /// The group actually traversed when this one is invoked or depended
    /// on: the proxy once one exists, otherwise the group itself.
    pub(crate) fn effective(&self) -> TaskGroup {
        self.inner.proxy.read().clone().unwrap_or_else(|| self.clone())
    }

    /// Structural composition: this group's root will not run until `other`
    /// (and, transitively, its declared post-run dependents) completes.
    pub fn add_dependency_task_group(&self, other: &TaskGroup) -> Result<(), GraphError> {
        let root = self.root_key().clone();
        self.wire_dependency_on(&root, other)
    }

    /// Wire `node_key` (a node of this group) to depend on `other`.
    pub(crate) fn wire_dependency_on(
        &self,
        node_key: &Arc<str>,
        other: &TaskGroup,
    ) -> Result<(), GraphError> {
        let target = other.effective();
        self.inner.dag.wire_dependency(node_key, target.dag())?;
        if !other.has_proxy() {
            other.inner.parents.lock().push(node_key.clone());
        }
        Ok(())
    }

    /// Non-structural composition: once this group is fully done, also run
    /// `other`, without re-declaring edges on any existing consumer.
    ///
    /// First use lazily creates this group's proxy and transparently
    /// redirects pre-existing consumers to it; from then on, depending on
    /// this group (or invoking it directly) implies running `other`.
    pub fn add_post_run_dependent_task_group(&self, other: &TaskGroup) -> Result<(), GraphError> {
        let proxy = self.ensure_proxy()?;

        // The dependent waits for this group itself...
        other.inner.dag.add_dependency_graph(&self.inner.dag)?;

        // ...and the proxy completes only after the dependent (including
        // the dependent's own post-run dependents, recursively).
        let target = other.effective();
        proxy.inner.dag.add_dependency_graph(target.dag())?;
        if !other.has_proxy() {
            other.inner.parents.lock().push(proxy.root_key().clone());
        }
        Ok(())
    }

    fn ensure_proxy(&self) -> Result<TaskGroup, GraphError> {
        if let Some(proxy) = self.inner.proxy.read().clone() {
            return Ok(proxy);
        }

        let proxy = Self::build(
            &format!("proxy:{}", self.root_key()),
            Arc::new(ProxyTask),
            true,
        );
        proxy.inner.dag.add_dependency_graph(&self.inner.dag)?;

        // Redirect every consumer edge wired at our root before the proxy
        // existed, so those consumers transitively run our dependents too.
        let parents: Vec<Arc<str>> = {
            let mut parents = self.inner.parents.lock();
            parents.drain(..).collect()
        };
        for parent_key in parents {
            self.inner
                .dag
                .replace_dependency(&parent_key, self.root_key(), proxy.root_key());
        }

        *self.inner.proxy.write() = Some(proxy.clone());
        Ok(proxy)
    }

    /// Fresh per-invocation configuration for this group.
    pub fn new_invocation_context(&self) -> InvocationContext {
        InvocationContext::new()
    }

    /// Invoke the group: a lazy, cold, ordered sequence of produced values.
    ///
    /// Subscribing (first poll) starts execution. Values arrive in
    /// settlement order; a faulted run emits every value it could compute,
    /// then exactly one terminal error.
    pub fn invoke_async(
        &self,
        ctx: InvocationContext,
    ) -> impl Stream<Item = Result<TaskOutput, GroupError>> + Send {
        engine::invoke_stream(self.clone(), ctx)
    }

    /// Convenience wrapper collecting the full output sequence.
    pub async fn invoke(&self, ctx: InvocationContext) -> Result<Vec<TaskOutput>, GroupError> {
        use futures::StreamExt;

        let mut stream = std::pin::pin!(self.invoke_async(ctx));
        let mut outputs = Vec::new();
        while let Some(item) = stream.next().await {
            outputs.push(item?);
        }
        Ok(outputs)
    }

    /// Apply structural changes recorded by a node's `prepare` hook.
    /// Returns whether anything changed.
    pub(crate) fn apply_mutation(
        &self,
        node_key: &Arc<str>,
        mutation: GraphMutation,
    ) -> Result<bool, GraphError> {
        let mut changed = false;
        for dep in mutation.dependencies {
            self.wire_dependency_on(node_key, &dep)?;
            changed = true;
        }
        for post in mutation.post_run_dependents {
            self.add_post_run_dependent_task_group(&post)?;
            changed = true;
        }
        Ok(changed)
    }
}
