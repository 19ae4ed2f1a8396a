//! Task group engine tests
//!
//! Covers ordering, laziness, result caching, `prepare`-hook graph growth,
//! post-run composition (both declaration orders), and settlement cleanup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};

use taskdag::{
    EventKind, GraphMutation, GroupError, InvocationContext, Task, TaskGroup,
};

// ============================================================================
// TEST HELPERS
// ============================================================================

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[derive(Clone, Default)]
struct Counters {
    prepared: Arc<AtomicUsize>,
    invoked: Arc<AtomicUsize>,
}

impl Counters {
    fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    fn invoked(&self) -> usize {
        self.invoked.load(Ordering::SeqCst)
    }
}

/// Task that optionally sleeps, then succeeds with its label or fails.
struct TestTask {
    label: &'static str,
    delay_ms: u64,
    fail: bool,
    cached: bool,
    counters: Counters,
}

impl TestTask {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            delay_ms: 0,
            fail: false,
            cached: false,
            counters: Counters::default(),
        }
    }

    fn counted(mut self, counters: &Counters) -> Self {
        self.counters = counters.clone();
        self
    }

    fn cached(mut self) -> Self {
        self.cached = true;
        self
    }
}

#[async_trait]
impl Task for TestTask {
    fn prepare(&self, _mutation: &mut GraphMutation) {
        self.counters.prepared.fetch_add(1, Ordering::SeqCst);
    }

    async fn invoke(&self, _ctx: &InvocationContext) -> anyhow::Result<Value> {
        self.counters.invoked.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail {
            anyhow::bail!("{} exploded", self.label);
        }
        Ok(json!(self.label))
    }

    fn is_cached(&self) -> bool {
        self.cached
    }
}

fn node(label: &'static str) -> TaskGroup {
    TaskGroup::new(label, TestTask::new(label))
}

/// Drain an invocation, returning emitted keys in order plus any errors.
async fn run(group: &TaskGroup, ctx: InvocationContext) -> (Vec<String>, Vec<GroupError>) {
    let mut stream = std::pin::pin!(group.invoke_async(ctx));
    let mut keys = Vec::new();
    let mut errors = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(output) => keys.push(output.key.to_string()),
            Err(err) => errors.push(err),
        }
    }
    (keys, errors)
}

fn position(keys: &[String], label: &str) -> usize {
    keys.iter()
        .position(|k| k == label)
        .unwrap_or_else(|| panic!("{label} not emitted in {keys:?}"))
}

// ============================================================================
// ORDERING AND LAZINESS
// ============================================================================

#[tokio::test]
async fn chain_emits_in_dependency_order() {
    init_tracing();
    let a = node("a");
    let b = node("b");
    let c = node("c");
    b.add_dependency_task_group(&a).unwrap();
    c.add_dependency_task_group(&b).unwrap();

    let (keys, errors) = run(&c, c.new_invocation_context()).await;
    assert!(errors.is_empty());
    assert_eq!(keys, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn diamond_emits_every_node_once_root_last() {
    let a = node("a");
    let b = node("b");
    let c = node("c");
    let d = node("d");
    b.add_dependency_task_group(&a).unwrap();
    c.add_dependency_task_group(&a).unwrap();
    d.add_dependency_task_group(&b).unwrap();
    d.add_dependency_task_group(&c).unwrap();

    let (keys, errors) = run(&d, d.new_invocation_context()).await;
    assert!(errors.is_empty());
    assert_eq!(keys.len(), 4);
    assert_eq!(keys[0], "a");
    assert_eq!(keys[3], "d");
}

#[tokio::test]
async fn invocation_is_cold_until_polled() {
    let counters = Counters::default();
    let group = TaskGroup::new("lazy", TestTask::new("lazy").counted(&counters));

    let stream = group.invoke_async(group.new_invocation_context());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counters.invoked(), 0, "nothing may run before first poll");
    drop(stream);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counters.invoked(), 0);

    let (keys, errors) = run(&group, group.new_invocation_context()).await;
    assert!(errors.is_empty());
    assert_eq!(keys, vec!["lazy"]);
    assert_eq!(counters.invoked(), 1);
}

#[tokio::test]
async fn collecting_invoke_returns_all_outputs() {
    let a = node("a");
    let b = node("b");
    b.add_dependency_task_group(&a).unwrap();

    let outputs = b.invoke(b.new_invocation_context()).await.unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].value, json!("a"));
    assert_eq!(outputs[1].value, json!("b"));
}

// ============================================================================
// RESULT CACHING
// ============================================================================

#[tokio::test]
async fn cached_task_is_invoked_once_across_invocations() {
    let counters = Counters::default();
    let shared = TaskGroup::new("shared", TestTask::new("shared").cached().counted(&counters));
    let consumer = node("consumer");
    consumer.add_dependency_task_group(&shared).unwrap();

    let (first, errors) = run(&consumer, consumer.new_invocation_context()).await;
    assert!(errors.is_empty());
    assert_eq!(first, vec!["shared", "consumer"]);

    let ctx = consumer.new_invocation_context();
    let (second, errors) = run(&consumer, ctx.clone()).await;
    assert!(errors.is_empty());
    assert_eq!(second, vec!["shared", "consumer"]);

    assert_eq!(counters.invoked(), 1, "cached task must not re-invoke");
    let cache_hits = ctx
        .events()
        .snapshot()
        .iter()
        .filter(|e| matches!(e.kind, EventKind::CacheHit { .. }))
        .count();
    assert_eq!(cache_hits, 1);
}

#[tokio::test]
async fn uncached_task_reinvokes_every_pass() {
    let counters = Counters::default();
    let group = TaskGroup::new("fresh", TestTask::new("fresh").counted(&counters));

    run(&group, group.new_invocation_context()).await;
    run(&group, group.new_invocation_context()).await;
    assert_eq!(counters.invoked(), 2);
}

// ============================================================================
// PREPARE-HOOK GRAPH GROWTH
// ============================================================================

/// Task whose `prepare` hook splices another group in, once.
struct ExpandingTask {
    label: &'static str,
    dependency: Mutex<Option<TaskGroup>>,
    post_run: Mutex<Option<TaskGroup>>,
}

impl ExpandingTask {
    fn with_dependency(label: &'static str, group: TaskGroup) -> Self {
        Self {
            label,
            dependency: Mutex::new(Some(group)),
            post_run: Mutex::new(None),
        }
    }

    fn with_post_run(label: &'static str, group: TaskGroup) -> Self {
        Self {
            label,
            dependency: Mutex::new(None),
            post_run: Mutex::new(Some(group)),
        }
    }
}

#[async_trait]
impl Task for ExpandingTask {
    fn prepare(&self, mutation: &mut GraphMutation) {
        if let Some(group) = self.dependency.lock().take() {
            mutation.add_dependency(group);
        }
        if let Some(group) = self.post_run.lock().take() {
            mutation.add_post_run_dependent(group);
        }
    }

    async fn invoke(&self, _ctx: &InvocationContext) -> anyhow::Result<Value> {
        Ok(json!(self.label))
    }
}

#[tokio::test]
async fn prepare_hook_dependency_runs_exactly_once() {
    let counters = Counters::default();
    let late = TaskGroup::new("late", TestTask::new("late").counted(&counters));
    let root = TaskGroup::new("root", ExpandingTask::with_dependency("root", late));

    let (keys, errors) = run(&root, root.new_invocation_context()).await;
    assert!(errors.is_empty());
    assert_eq!(keys, vec!["late", "root"]);
    assert_eq!(counters.prepared(), 1, "new node's prepare runs exactly once");
    assert_eq!(counters.invoked(), 1, "new node invoked exactly once");
    assert_eq!(keys.iter().filter(|k| *k == "late").count(), 1);
}

#[tokio::test]
async fn prepare_hook_post_run_dependent_runs_exactly_once() {
    let counters = Counters::default();
    let after = TaskGroup::new("after", TestTask::new("after").counted(&counters));
    let root = TaskGroup::new("root", ExpandingTask::with_post_run("root", after));

    let (keys, errors) = run(&root, root.new_invocation_context()).await;
    assert!(errors.is_empty());
    assert_eq!(keys, vec!["root", "after"]);
    assert_eq!(counters.prepared(), 1);
    assert_eq!(counters.invoked(), 1);
}

// ============================================================================
// POST-RUN COMPOSITION
// ============================================================================

#[tokio::test]
async fn direct_invocation_runs_post_run_dependents_after_the_group() {
    let base_dep = node("base-dep");
    let base = node("base");
    base.add_dependency_task_group(&base_dep).unwrap();

    let after_dep = node("after-dep");
    let after = node("after");
    after.add_dependency_task_group(&after_dep).unwrap();

    base.add_post_run_dependent_task_group(&after).unwrap();

    let (keys, errors) = run(&base, base.new_invocation_context()).await;
    assert!(errors.is_empty());
    assert_eq!(keys.len(), 4, "proxy root must not be emitted: {keys:?}");
    assert!(position(&keys, "base-dep") < position(&keys, "base"));
    assert!(position(&keys, "base") < position(&keys, "after"));
    assert!(position(&keys, "after-dep") < position(&keys, "after"));
}

#[tokio::test]
async fn pre_existing_consumer_observes_post_run_dependents() {
    let base = node("base");
    let consumer = node("consumer");
    consumer.add_dependency_task_group(&base).unwrap();

    // Attached after the consumer was wired: the consumer must still
    // transitively run it.
    let after = node("after");
    base.add_post_run_dependent_task_group(&after).unwrap();

    let (keys, errors) = run(&consumer, consumer.new_invocation_context()).await;
    assert!(errors.is_empty());
    assert!(position(&keys, "base") < position(&keys, "after"));
    assert!(position(&keys, "after") < position(&keys, "consumer"));
}

#[tokio::test]
async fn consumer_wired_after_the_post_run_dependent_sees_it_too() {
    let base = node("base");
    let after = node("after");
    base.add_post_run_dependent_task_group(&after).unwrap();

    let consumer = node("consumer");
    consumer.add_dependency_task_group(&base).unwrap();

    let (keys, errors) = run(&consumer, consumer.new_invocation_context()).await;
    assert!(errors.is_empty());
    assert!(position(&keys, "base") < position(&keys, "after"));
    assert!(position(&keys, "after") < position(&keys, "consumer"));
}

#[tokio::test]
async fn nested_post_run_dependents_compose_transitively() {
    let base = node("base");
    let first = node("first");
    let second = node("second");
    base.add_post_run_dependent_task_group(&first).unwrap();
    first.add_post_run_dependent_task_group(&second).unwrap();

    let (keys, errors) = run(&base, base.new_invocation_context()).await;
    assert!(errors.is_empty());
    assert_eq!(keys.len(), 3);
    assert!(position(&keys, "base") < position(&keys, "first"));
    assert!(position(&keys, "first") < position(&keys, "second"));
}

// ============================================================================
// SETTLEMENT CLEANUP
// ============================================================================

/// Task recording the fault flag its `post_run` received.
struct CleanupProbe {
    label: &'static str,
    fail: bool,
    observed: Arc<Mutex<Option<bool>>>,
}

#[async_trait]
impl Task for CleanupProbe {
    async fn invoke(&self, _ctx: &InvocationContext) -> anyhow::Result<Value> {
        if self.fail {
            anyhow::bail!("{} exploded", self.label);
        }
        Ok(json!(self.label))
    }

    async fn post_run(&self, group_faulted: bool) {
        *self.observed.lock() = Some(group_faulted);
    }
}

#[tokio::test]
async fn post_run_hook_reports_group_outcome() {
    let ok_flag = Arc::new(Mutex::new(None));
    let ok_group = TaskGroup::new(
        "ok",
        CleanupProbe {
            label: "ok",
            fail: false,
            observed: Arc::clone(&ok_flag),
        },
    );
    let (_, errors) = run(&ok_group, ok_group.new_invocation_context()).await;
    assert!(errors.is_empty());
    assert_eq!(*ok_flag.lock(), Some(false));

    let bad_flag = Arc::new(Mutex::new(None));
    let bad_group = TaskGroup::new(
        "bad",
        CleanupProbe {
            label: "bad",
            fail: true,
            observed: Arc::clone(&bad_flag),
        },
    );
    let (_, errors) = run(&bad_group, bad_group.new_invocation_context()).await;
    assert_eq!(errors.len(), 1);
    assert_eq!(*bad_flag.lock(), Some(true));
}

// ============================================================================
// EVENT LOG
// ============================================================================

#[tokio::test]
async fn event_log_traces_the_invocation() {
    let a = node("a");
    let b = node("b");
    b.add_dependency_task_group(&a).unwrap();

    let ctx = b.new_invocation_context();
    let (_, errors) = run(&b, ctx.clone()).await;
    assert!(errors.is_empty());

    let events = ctx.events().snapshot();
    assert!(matches!(events[0].kind, EventKind::GroupInvoked { task_count: 2 }));
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, EventKind::GroupCompleted { emitted: 2, .. })));

    let a_events = ctx.events().for_task("a");
    assert!(a_events
        .iter()
        .any(|e| matches!(e.kind, EventKind::TaskDispatched { .. })));
    assert!(a_events
        .iter()
        .any(|e| matches!(e.kind, EventKind::TaskCompleted { .. })));
}
