//! Event log for group invocations
//!
//! Provides an audit trail of one invocation pass.
//! - Event: envelope with id + timestamp + kind
//! - EventKind: group-level and task-level variants
//! - EventLog: thread-safe, append-only log

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Single event in the invocation log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since the log was created (ms)
    pub timestamp_ms: u64,
    /// Event type and data
    pub kind: EventKind,
}

/// All event types emitted by the engine.
///
/// Uses Arc<str> for task_id fields to enable zero-cost cloning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // GROUP LEVEL
    // ═══════════════════════════════════════════
    GroupInvoked {
        task_count: usize,
    },
    GroupCompleted {
        emitted: usize,
        total_duration_ms: u64,
    },
    GroupFailed {
        error: String,
        failed_tasks: Vec<Arc<str>>,
    },

    // ═══════════════════════════════════════════
    // TASK LEVEL
    // ═══════════════════════════════════════════
    TaskScheduled {
        task_id: Arc<str>,
        dependencies: Vec<Arc<str>>,
    },
    TaskDispatched {
        task_id: Arc<str>,
    },
    TaskCompleted {
        task_id: Arc<str>,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: Arc<str>,
        error: String,
        duration_ms: u64,
    },
    /// Never dispatched: a failed ancestor blocked it under the active policy
    TaskSkipped {
        task_id: Arc<str>,
        blocked_by: Arc<str>,
    },
    /// A cached result was reused instead of re-invoking
    CacheHit {
        task_id: Arc<str>,
    },
}

impl EventKind {
    /// Extract task_id if the event is task-related
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskScheduled { task_id, .. }
            | Self::TaskDispatched { task_id }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskSkipped { task_id, .. }
            | Self::CacheHit { task_id } => Some(task_id),
            _ => None,
        }
    }
}

/// Thread-safe, append-only event log.
///
/// Clones share the same underlying log.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    next_id: Arc<AtomicU64>,
    start: Instant,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            start: Instant::now(),
        }
    }

    /// Append an event, stamping a monotonic id and elapsed timestamp.
    pub fn emit(&self, kind: EventKind) {
        let event = Event {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: self.start.elapsed().as_millis() as u64,
            kind,
        };
        self.events.write().push(event);
    }

    /// Copy of the full log, in emission order.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Events for one task, in emission order.
    pub fn for_task(&self, task_id: &str) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind.task_id() == Some(task_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
