//! Group invocation engine
//!
//! Drives one invocation pass: the fixed-point `prepare` hook pass, the
//! readiness-based concurrent dispatch loop over the traversal protocol,
//! fault containment per the active termination policy, and the terminal
//! success/error of the output sequence.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, instrument, trace};

use crate::context::{InvocationContext, TerminationPolicy};
use crate::error::{GroupError, TaskFailure};
use crate::event_log::EventKind;
use crate::graph::{Dag, NextNode};
use crate::group::{TaskEntry, TaskGroup};
use crate::task::{GraphMutation, TaskOutput};

/// Build the cold output sequence: nothing runs until the stream is first
/// polled, at which point the driver is spawned and values arrive in
/// settlement order.
pub(crate) fn invoke_stream(
    group: TaskGroup,
    ctx: InvocationContext,
) -> impl Stream<Item = Result<TaskOutput, GroupError>> + Send {
    stream::once(async move {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(group, ctx, tx));
        UnboundedReceiverStream::new(rx)
    })
    .flatten()
}

#[instrument(skip_all, fields(root = %group.root_key()))]
async fn drive(
    group: TaskGroup,
    ctx: InvocationContext,
    tx: mpsc::UnboundedSender<Result<TaskOutput, GroupError>>,
) {
    let started = Instant::now();

    // Structural growth happens here and only here for this invocation.
    if let Err(err) = run_prepare_pass(&group) {
        ctx.events().emit(EventKind::GroupFailed {
            error: err.to_string(),
            failed_tasks: Vec::new(),
        });
        let _ = tx.send(Err(GroupError::Graph(err)));
        return;
    }

    // Resolve the effective root once: the proxy, if one exists, so a
    // direct invocation also runs the group's post-run dependents.
    let root = group.effective();
    let dag = root.dag();

    dag.prepare_for_enumeration();
    let reachable = dag.reachable_keys();
    let reachable_set: HashSet<Arc<str>> = reachable.iter().cloned().collect();

    ctx.events().emit(EventKind::GroupInvoked {
        task_count: reachable.len(),
    });
    for key in &reachable {
        if let Some(node) = dag.get_node(key) {
            ctx.events().emit(EventKind::TaskScheduled {
                task_id: key.clone(),
                dependencies: node.dependency_keys(),
            });
        }
    }

    // Fan-in coordinator: dispatched work settles onto this channel.
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(Arc<str>, anyhow::Result<Value>)>();
    let mut in_flight: usize = 0;
    let mut halted = false;
    let mut skipped: HashSet<Arc<str>> = HashSet::new();
    let mut emitted: usize = 0;
    let mut dispatched_at: HashMap<Arc<str>, Instant> = HashMap::new();

    loop {
        // Dispatch every newly-ready node immediately and concurrently.
        if !halted {
            while let NextNode::Ready(node) = dag.get_next() {
                let key = node.key().clone();
                let entry = node.payload();
                dispatched_at.insert(key.clone(), Instant::now());
                in_flight += 1;

                if entry.task.is_cached() {
                    if let Some(value) = entry.cached_value() {
                        ctx.events().emit(EventKind::CacheHit {
                            task_id: key.clone(),
                        });
                        let _ = done_tx.send((key, Ok(value)));
                        continue;
                    }
                }

                ctx.events().emit(EventKind::TaskDispatched {
                    task_id: key.clone(),
                });
                trace!(task = %key, "dispatching");
                let task = Arc::clone(&entry.task);
                let task_ctx = ctx.clone();
                let done = done_tx.clone();
                tokio::spawn(async move {
                    let result = task.invoke(&task_ctx).await;
                    let _ = done.send((key, result));
                });
            }
        }

        if in_flight == 0 {
            break;
        }
        let (key, result) = match done_rx.recv().await {
            Some(settled) => settled,
            None => break,
        };
        in_flight -= 1;
        let duration_ms = dispatched_at
            .get(&key)
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        match result {
            Ok(value) => {
                let node = dag.get_node(&key);
                let internal = node
                    .as_ref()
                    .map(|n| n.payload().is_internal())
                    .unwrap_or(false);
                if let Some(node) = &node {
                    node.payload().store_value(value.clone());
                }
                dag.report_completion(&key);
                ctx.events().emit(EventKind::TaskCompleted {
                    task_id: key.clone(),
                    duration_ms,
                });
                if !internal {
                    emitted += 1;
                    let _ = tx.send(Ok(TaskOutput::new(key, value)));
                }
            }
            Err(cause) => {
                debug!(task = %key, error = %cause, "task failed");
                ctx.events().emit(EventKind::TaskFailed {
                    task_id: key.clone(),
                    error: cause.to_string(),
                    duration_ms,
                });
                ctx.record_failure(TaskFailure::new(key.clone(), cause));

                // Failure propagates only along forward edges: everything
                // that transitively required this node can never run.
                let closure = forward_closure(dag, &key, &reachable_set);
                for blocked in &closure {
                    if skipped.insert(blocked.clone()) {
                        ctx.events().emit(EventKind::TaskSkipped {
                            task_id: blocked.clone(),
                            blocked_by: key.clone(),
                        });
                    }
                }
                if !closure.is_empty() {
                    match ctx.termination_policy() {
                        TerminationPolicy::CompleteInProgress => halted = true,
                        TerminationPolicy::StopAtLca => {
                            if let Some(lca) = lowest_common_ancestor(dag, &key, &reachable_set) {
                                debug!(task = %key, lca = %lca, "failure funnels through LCA");
                                ctx.record_lca(lca);
                            }
                        }
                    }
                }
            }
        }
    }

    // Invocation has settled; give every node its cleanup hook, then
    // terminate the sequence.
    let failures = ctx.failures();
    let faulted = !failures.is_empty();
    let cleanups = reachable.iter().filter_map(|k| dag.get_node(k)).map(|node| {
        let task = Arc::clone(&node.payload().task);
        async move { task.post_run(faulted).await }
    });
    futures::future::join_all(cleanups).await;

    if faulted {
        let error = GroupError::from_failures(failures);
        ctx.events().emit(EventKind::GroupFailed {
            error: error.to_string(),
            failed_tasks: error.failed_keys(),
        });
        let _ = tx.send(Err(error));
    } else {
        ctx.events().emit(EventKind::GroupCompleted {
            emitted,
            total_duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}

/// Run `prepare` on every node, applying requested structural changes and
/// hooking newly discovered nodes, until no node requests further change.
fn run_prepare_pass(group: &TaskGroup) -> Result<(), crate::error::GraphError> {
    let mut hooked: HashSet<Arc<str>> = HashSet::new();
    loop {
        let root = group.effective();
        let keys = root.dag().reachable_keys();
        let mut changed = false;

        for key in keys {
            if !hooked.insert(key.clone()) {
                continue;
            }
            let node = match root.dag().get_node(&key) {
                Some(n) => n,
                None => continue,
            };
            let mut mutation = GraphMutation::new();
            node.payload().task.prepare(&mut mutation);
            if mutation.is_empty() {
                continue;
            }
            if group.apply_mutation(&key, mutation)? {
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }
    }
}

/// Transitive dependents of `from` within this invocation's reachable view.
fn forward_closure(
    dag: &Dag<TaskEntry>,
    from: &Arc<str>,
    reachable: &HashSet<Arc<str>>,
) -> Vec<Arc<str>> {
    let mut visited: HashSet<Arc<str>> = HashSet::new();
    let mut queue: VecDeque<Arc<str>> = VecDeque::new();
    let mut closure = Vec::new();

    visited.insert(from.clone());
    queue.push_back(from.clone());

    while let Some(key) = queue.pop_front() {
        if let Some(node) = dag.get_node(&key) {
            for dependent in node.dependent_keys() {
                if reachable.contains(&dependent) && visited.insert(dependent.clone()) {
                    closure.push(dependent.clone());
                    queue.push_back(dependent);
                }
            }
        }
    }
    closure
}

/// The lowest common ancestor of a failure: the nearest node through which
/// every blocked path must pass (the nearest post-dominator of `failed`
/// toward the effective root).
fn lowest_common_ancestor(
    dag: &Dag<TaskEntry>,
    failed: &Arc<str>,
    reachable: &HashSet<Arc<str>>,
) -> Option<Arc<str>> {
    let blocked = forward_closure(dag, failed, reachable);
    if blocked.is_empty() {
        return None;
    }
    let mut region: HashSet<Arc<str>> = blocked.into_iter().collect();
    region.insert(failed.clone());

    // Post-order over dependent edges: every node is listed after all of
    // its in-region dependents, so one pass computes the post-dominators.
    let order = post_order(dag, failed, &region);
    let mut pdom: HashMap<Arc<str>, HashSet<Arc<str>>> = HashMap::new();

    for key in order {
        let node = match dag.get_node(&key) {
            Some(n) => n,
            None => continue,
        };
        let mut meet: Option<HashSet<Arc<str>>> = None;
        for dependent in node.dependent_keys() {
            if !region.contains(&dependent) {
                continue;
            }
            if let Some(ds) = pdom.get(&dependent) {
                meet = Some(match meet {
                    None => ds.clone(),
                    Some(acc) => acc.intersection(ds).cloned().collect(),
                });
            }
        }
        let mut set = meet.unwrap_or_default();
        set.insert(key.clone());
        pdom.insert(key, set);
    }

    let candidates: HashSet<Arc<str>> = pdom
        .get(failed)?
        .iter()
        .filter(|k| *k != failed)
        .cloned()
        .collect();

    // The nearest post-dominator is the one all other candidates dominate.
    candidates
        .iter()
        .find(|c| pdom.get(*c).map(|s| s.len()) == Some(candidates.len()))
        .cloned()
}

/// Iterative DFS post-order from `start` along dependent edges, restricted
/// to `region`.
fn post_order(
    dag: &Dag<TaskEntry>,
    start: &Arc<str>,
    region: &HashSet<Arc<str>>,
) -> Vec<Arc<str>> {
    let mut visited: HashSet<Arc<str>> = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(Arc<str>, bool)> = vec![(start.clone(), false)];

    while let Some((key, children_done)) = stack.pop() {
        if children_done {
            order.push(key);
            continue;
        }
        if !visited.insert(key.clone()) {
            continue;
        }
        stack.push((key.clone(), true));
        if let Some(node) = dag.get_node(&key) {
            for dependent in node.dependent_keys() {
                if region.contains(&dependent) && !visited.contains(&dependent) {
                    stack.push((dependent, false));
                }
            }
        }
    }
    order
}
