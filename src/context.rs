//! Per-invocation configuration and observation state

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TaskFailure;
use crate::event_log::EventLog;

/// How aggressively to stop dispatching new work after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationPolicy {
    /// On first failure, stop starting any new node; nodes already in
    /// flight settle naturally and their values are still emitted.
    #[default]
    CompleteInProgress,
    /// On failure, only the branch that must funnel through the failure's
    /// lowest common ancestor stops; every node reachable without passing
    /// through the LCA keeps running. Strictly less conservative than
    /// [`TerminationPolicy::CompleteInProgress`].
    StopAtLca,
}

#[derive(Default)]
struct Observations {
    failures: Mutex<Vec<TaskFailure>>,
    lca_key: Mutex<Option<Arc<str>>>,
}

/// Per-invocation state: the selected termination policy, the accumulated
/// failure list, the LCA key once computed, and the invocation's event log.
///
/// Cheap to clone; clones share the observation state, so a handle kept by
/// the caller reflects what the engine recorded.
#[derive(Clone, Default)]
pub struct InvocationContext {
    policy: TerminationPolicy,
    observations: Arc<Observations>,
    events: EventLog,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the termination policy for this invocation.
    pub fn with_termination_policy(mut self, policy: TerminationPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[inline]
    pub fn termination_policy(&self) -> TerminationPolicy {
        self.policy
    }

    /// Failures observed so far, in settlement order.
    pub fn failures(&self) -> Vec<TaskFailure> {
        self.observations.failures.lock().clone()
    }

    /// The lowest-common-ancestor key computed for the active failure, if
    /// the LCA policy ran and one exists.
    pub fn lca_key(&self) -> Option<Arc<str>> {
        self.observations.lca_key.lock().clone()
    }

    /// The invocation's execution event log.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub(crate) fn record_failure(&self, failure: TaskFailure) {
        self.observations.failures.lock().push(failure);
    }

    pub(crate) fn record_lca(&self, key: Arc<str>) {
        let mut lca = self.observations.lca_key.lock();
        if lca.is_none() {
            *lca = Some(key);
        }
    }
}
