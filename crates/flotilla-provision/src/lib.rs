//! flotilla-provision — elastic capacity provisioning core.
//!
//! Capacity sources promise nodes as `PlannedCapacity`; the provisioning
//! loop tracks every promise in the `ProvisioningLedger` until it resolves,
//! and registers the resulting nodes in a `ClusterRegistry`.
//!
//! # Tick
//!
//! ```text
//! poll planned capacity      → register nodes / record failures
//! for each label with demand:
//!     remaining = excess - promised(label)
//!     for source in configuration order while remaining > 0:
//!         if source.can_provision(label):
//!             planned += source.provision(label, remaining)
//! ```
//!
//! Requests for a label stop as soon as the sum of promises covers its
//! excess, so slow-booting nodes are never requested twice.

pub mod access;
pub mod demand;
pub mod error;
pub mod event;
pub mod label;
pub mod ledger;
pub mod node;
pub mod planned;
pub mod provisioner;
pub mod registry;
pub mod source;

pub use access::{AccessGuard, Action, Actor, Authorizer, GrantTable};
pub use demand::{Demand, DemandBoard, DemandSignal, SmoothedDemand};
pub use error::{
    ConfigError, MutationError, PermissionDeniedError, ProvisionCompletionError,
    ProvisionRequestError, ProvisionTimeoutError, RegisterError, RegistryError, RegistryResult,
    ReleaseError,
};
pub use event::{EventLog, EventSink, ProvisionEvent, ReleaseOutcome};
pub use label::{Label, SourceName, display_label};
pub use ledger::{LedgerEntry, ProvisioningLedger};
pub use node::{
    BoxFuture, FnRelease, RealizedNode, ReleaseHandle, RetentionDecision, RetentionPolicy,
    release_node,
};
pub use planned::{Completer, Completion, CompletionState, PlannedCapacity, PlannedId};
pub use provisioner::{OutstandingView, ProvisionerHandle, ProvisioningLoop, TickReport};
pub use registry::{ClusterRegistry, DetachedNode, Registration, Registry};
pub use source::{CapacitySource, SourceSet};
