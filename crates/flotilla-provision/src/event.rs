//! Provisioning events.
//!
//! The loop and the reaper report everything they do as a
//! `ProvisionEvent`. Sinks decide what to do with them; `EventLog` logs
//! each event through `tracing` and keeps a bounded history for status
//! endpoints and tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::label::{Label, SourceName, display_label};
use crate::planned::PlannedId;

/// How a removed node's external resource fared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released,
    /// The node had no release handle.
    NothingToRelease,
    /// Release failed; the external resource may still exist.
    Leaked { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProvisionEvent {
    TickStarted {
        tick: u64,
    },
    TickFinished {
        tick: u64,
        requested: usize,
        registered: usize,
        failed: usize,
    },
    ProvisionRequested {
        source: SourceName,
        label: Option<Label>,
        planned: PlannedId,
        executors: u32,
        description: String,
    },
    /// No configured source can serve this label.
    DemandUnmet {
        label: Option<Label>,
        excess: u32,
    },
    RequestFailed {
        source: SourceName,
        label: Option<Label>,
        error: String,
    },
    ProvisionSucceeded {
        source: SourceName,
        label: Option<Label>,
        planned: PlannedId,
        node: String,
    },
    ProvisionFailed {
        source: SourceName,
        label: Option<Label>,
        planned: PlannedId,
        error: String,
    },
    ProvisionTimedOut {
        source: SourceName,
        label: Option<Label>,
        planned: PlannedId,
        error: String,
    },
    /// A node arrived after its planned capacity had timed out.
    LateCompletionDiscarded {
        source: SourceName,
        planned: PlannedId,
        node: String,
    },
    DuplicateNodeIgnored {
        source: SourceName,
        planned: PlannedId,
        node: String,
    },
    NodeRemoved {
        node: String,
        source: String,
        reason: String,
        release: ReleaseOutcome,
    },
}

/// Consumer of provisioning events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProvisionEvent);
}

/// Logs every event and keeps the most recent ones in memory.
#[derive(Clone)]
pub struct EventLog {
    history: Arc<Mutex<VecDeque<ProvisionEvent>>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Recent events, oldest first.
    pub fn snapshot(&self) -> Vec<ProvisionEvent> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: ProvisionEvent) {
        trace_event(&event);
        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }
}

fn trace_event(event: &ProvisionEvent) {
    match event {
        ProvisionEvent::TickStarted { tick } => debug!(tick, "provisioning tick started"),
        ProvisionEvent::TickFinished {
            tick,
            requested,
            registered,
            failed,
        } => debug!(tick, requested, registered, failed, "provisioning tick finished"),
        ProvisionEvent::ProvisionRequested {
            source,
            label,
            planned,
            executors,
            description,
        } => info!(
            %source,
            label = %display_label(label.as_ref()),
            %planned,
            executors,
            %description,
            "provision requested"
        ),
        ProvisionEvent::DemandUnmet { label, excess } => warn!(
            label = %display_label(label.as_ref()),
            excess,
            "no capacity source can provision label"
        ),
        ProvisionEvent::RequestFailed {
            source,
            label,
            error,
        } => warn!(
            %source,
            label = %display_label(label.as_ref()),
            %error,
            "capacity source request failed"
        ),
        ProvisionEvent::ProvisionSucceeded {
            source,
            label,
            planned,
            node,
        } => info!(
            %source,
            label = %display_label(label.as_ref()),
            %planned,
            %node,
            "node provisioned"
        ),
        ProvisionEvent::ProvisionFailed {
            source,
            label,
            planned,
            error,
        } => warn!(
            %source,
            label = %display_label(label.as_ref()),
            %planned,
            %error,
            "provisioning failed"
        ),
        ProvisionEvent::ProvisionTimedOut {
            source,
            label,
            planned,
            error,
        } => warn!(
            %source,
            label = %display_label(label.as_ref()),
            %planned,
            %error,
            "provisioning timed out"
        ),
        ProvisionEvent::LateCompletionDiscarded {
            source,
            planned,
            node,
        } => warn!(%source, %planned, %node, "discarding node that completed after timeout"),
        ProvisionEvent::DuplicateNodeIgnored {
            source,
            planned,
            node,
        } => warn!(%source, %planned, %node, "node already registered, ignoring"),
        ProvisionEvent::NodeRemoved {
            node,
            source,
            reason,
            release,
        } => match release {
            ReleaseOutcome::Leaked { error } => warn!(
                %node,
                %source,
                %reason,
                %error,
                "node removed but its resource could not be released"
            ),
            _ => info!(%node, %source, %reason, ?release, "node removed"),
        },
    }
}
