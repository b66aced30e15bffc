//! Planned capacity — the handoff for one in-flight node creation.
//!
//! A capacity source answers `provision` with `PlannedCapacity` entries
//! and keeps the matching `Completer`. The creation work runs wherever the
//! source likes (typically a spawned task) and resolves the completer
//! exactly once. The loop never awaits the result: it calls
//! `Completion::poll` on every tick and gets an immediate answer.
//!
//! ```text
//! source ── provision() ──▶ PlannedCapacity { completion } ──▶ loop (poll each tick)
//!   └── Completer ── complete(node) / fail(err) ──────────────────▲
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::ProvisionCompletionError;
use crate::node::RealizedNode;

static NEXT_PLANNED_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a planned capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PlannedId(u64);

impl PlannedId {
    fn next() -> Self {
        Self(NEXT_PLANNED_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlannedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "planned-{}", self.0)
    }
}

type CompletionResult = Result<RealizedNode, ProvisionCompletionError>;

/// One in-progress node creation, as promised by a capacity source.
#[derive(Debug)]
pub struct PlannedCapacity {
    pub id: PlannedId,
    pub description: String,
    /// Executors the source expects the node to offer.
    pub promised_executors: u32,
    pub completion: Completion,
    pub created_at: Instant,
}

impl PlannedCapacity {
    /// Create a pending planned capacity and the completer that resolves it.
    pub fn new(description: impl Into<String>, promised_executors: u32) -> (Self, Completer) {
        let (tx, rx) = oneshot::channel();
        let id = PlannedId::next();
        let planned = Self {
            id,
            description: description.into(),
            promised_executors,
            completion: Completion {
                state: CompletionInner::Waiting(rx),
            },
            created_at: Instant::now(),
        };
        (planned, Completer { id, tx })
    }

    /// Create a planned capacity that is already resolved.
    ///
    /// Useful for sources whose creation is effectively instantaneous.
    pub fn resolved(
        description: impl Into<String>,
        promised_executors: u32,
        result: Result<RealizedNode, ProvisionCompletionError>,
    ) -> Self {
        let (planned, completer) = Self::new(description, promised_executors);
        match result {
            Ok(node) => {
                let _ = completer.complete(node);
            }
            Err(e) => {
                completer.fail(e);
            }
        }
        planned
    }

    /// Time since the source handed this planned capacity over.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Result of a non-blocking poll.
#[derive(Debug)]
pub enum CompletionState {
    /// Creation still in progress.
    Pending,
    /// Resolved on this poll. Returned exactly once.
    Ready(CompletionResult),
    /// Already resolved on an earlier poll.
    Spent,
}

#[derive(Debug)]
enum CompletionInner {
    Waiting(oneshot::Receiver<CompletionResult>),
    Spent,
}

/// Receiving half of a planned capacity's single-resolution channel.
#[derive(Debug)]
pub struct Completion {
    state: CompletionInner,
}

impl Completion {
    /// Check for a result without blocking.
    ///
    /// A completer dropped without resolving reads as
    /// `ProvisionCompletionError::Abandoned`.
    pub fn poll(&mut self) -> CompletionState {
        let CompletionInner::Waiting(rx) = &mut self.state else {
            return CompletionState::Spent;
        };
        match rx.try_recv() {
            Ok(result) => {
                self.state = CompletionInner::Spent;
                CompletionState::Ready(result)
            }
            Err(TryRecvError::Empty) => CompletionState::Pending,
            Err(TryRecvError::Closed) => {
                self.state = CompletionInner::Spent;
                CompletionState::Ready(Err(ProvisionCompletionError::Abandoned))
            }
        }
    }
}

/// Sending half, held by the capacity source.
#[derive(Debug)]
pub struct Completer {
    id: PlannedId,
    tx: oneshot::Sender<CompletionResult>,
}

impl Completer {
    pub fn id(&self) -> PlannedId {
        self.id
    }

    /// Deliver the realized node.
    ///
    /// Hands the node back if nobody is waiting any more (the planned
    /// capacity was dropped), so the caller can release it.
    pub fn complete(self, node: RealizedNode) -> Result<(), RealizedNode> {
        match self.tx.send(Ok(node)) {
            Ok(()) => Ok(()),
            Err(Ok(node)) => Err(node),
            Err(Err(_)) => Ok(()),
        }
    }

    /// Deliver a failure. Returns false if nobody is waiting any more.
    pub fn fail(self, error: ProvisionCompletionError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// True once the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
