//! Domain types for the Flotilla state store.
//!
//! These types represent the persisted view of provisioned nodes and of
//! external resources that could not be released. All types are
//! serializable to/from JSON for storage in redb tables.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

// ── Node ──────────────────────────────────────────────────────────

/// A node that was provisioned by a capacity source and merged into the
/// cluster registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    /// Name of the capacity source that created this node.
    pub source: String,
    /// Demand label the node was provisioned for (`None` = untagged).
    pub label: Option<String>,
    /// Human-readable description carried over from the planned capacity.
    pub description: String,
    /// Number of executors the node offers.
    pub executors: u32,
    /// Executors currently running work.
    pub busy_executors: u32,
    /// Tasks queued specifically for this node.
    pub pending_tasks: u32,
    /// Whether the node has ever run work.
    pub has_run_work: bool,
    /// Unix timestamp (seconds) since which the node has been idle.
    /// `None` while any executor is busy.
    pub idle_since: Option<u64>,
    /// Unix timestamp (seconds) when the node was registered.
    pub registered_at: u64,
}

impl NodeRecord {
    /// Build a fresh, idle record.
    pub fn new(
        id: impl Into<NodeId>,
        source: impl Into<String>,
        label: Option<String>,
        executors: u32,
        now: u64,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            label,
            description: String::new(),
            executors,
            busy_executors: 0,
            pending_tasks: 0,
            has_run_work: false,
            idle_since: Some(now),
            registered_at: now,
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// True when no executor is busy and nothing is queued for the node.
    pub fn is_idle(&self) -> bool {
        self.busy_executors == 0 && self.pending_tasks == 0
    }

    /// Seconds the node has been idle at `now`, if it is idle.
    pub fn idle_for(&self, now: u64) -> Option<u64> {
        if !self.is_idle() {
            return None;
        }
        self.idle_since.map(|since| now.saturating_sub(since))
    }

    /// Apply an activity report from the job scheduler.
    ///
    /// The idle clock starts on the first report with no busy executors
    /// and keeps its original start while the node stays idle.
    pub fn apply_activity(&mut self, busy_executors: u32, pending_tasks: u32, now: u64) {
        self.busy_executors = busy_executors.min(self.executors);
        self.pending_tasks = pending_tasks;
        if busy_executors > 0 {
            self.has_run_work = true;
        }
        if self.is_idle() {
            self.idle_since.get_or_insert(now);
        } else {
            self.idle_since = None;
        }
    }
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Leaks ─────────────────────────────────────────────────────────

/// An external resource that outlived its node because release failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeakRecord {
    pub node_id: NodeId,
    pub source: String,
    /// Release error as reported by the source.
    pub error: String,
    /// Unix timestamp (seconds) when the failure was recorded.
    pub recorded_at: u64,
}
