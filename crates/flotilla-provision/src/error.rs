//! Provisioning error types.
//!
//! Each class is recovered locally: none of them stops the control loop.

use std::time::Duration;

use thiserror::Error;

use crate::access::Action;
use crate::node::RealizedNode;
use crate::planned::PlannedId;

/// A capacity source's `can_provision` or `provision` call failed.
///
/// The loop skips the source for the rest of the tick and retries it on
/// the next one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionRequestError {
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("source panicked: {0}")]
    Panicked(String),
}

/// An accepted planned capacity resolved to failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionCompletionError {
    #[error("node creation failed: {0}")]
    Failed(String),

    /// The source dropped the completer without resolving it.
    #[error("node creation abandoned by source")]
    Abandoned,

    #[error("registry rejected node: {0}")]
    Registry(String),
}

impl ProvisionCompletionError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// A planned capacity did not resolve within the configured bound.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("planned capacity {planned} did not complete within {waited:?}")]
pub struct ProvisionTimeoutError {
    pub planned: PlannedId,
    pub waited: Duration,
}

/// A node left the registry but its external resource could not be freed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to release node {node}: {reason}")]
pub struct ReleaseError {
    pub node: String,
    pub reason: String,
}

impl ReleaseError {
    pub fn new(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            reason: reason.into(),
        }
    }
}

/// A mutation was attempted without the required grant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("actor {actor} may not {action} on source {source_name}")]
pub struct PermissionDeniedError {
    pub actor: String,
    pub action: Action,
    pub source_name: String,
}

/// Errors raised at the cluster registry boundary.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("state store error: {0}")]
    State(#[from] flotilla_state::StateError),

    #[error("node not found: {0}")]
    NodeNotFound(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A node the registry could not take. The node is handed back so its
/// external resource can still be released.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RegisterError {
    #[source]
    pub error: RegistryError,
    pub node: RealizedNode,
}

/// Errors from manually triggered mutations (provision or remove).
#[derive(Debug, Error)]
pub enum MutationError {
    #[error(transparent)]
    PermissionDenied(#[from] PermissionDeniedError),

    #[error("unknown capacity source: {0}")]
    UnknownSource(String),

    #[error("source {source_name} cannot provision label {label}")]
    UnsupportedLabel { source_name: String, label: String },

    #[error("excess workload must be at least 1")]
    ZeroWorkload,

    #[error(transparent)]
    Request(#[from] ProvisionRequestError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Invalid configuration of the source set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid source name {0:?}: expected [A-Za-z0-9_-]+")]
    InvalidSourceName(String),

    #[error("duplicate source name: {0}")]
    DuplicateSource(String),

    #[error("invalid label {0:?}")]
    InvalidLabel(String),
}
