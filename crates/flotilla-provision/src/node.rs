//! Realized nodes and the contracts that govern their removal.
//!
//! A `RealizedNode` is what a planned capacity resolves to: the persisted
//! record plus the node's retention policy and the provider-specific
//! handle that frees its external resource. Once the node is merged into
//! the registry, the registry owns both.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

use flotilla_state::NodeRecord;

use crate::error::ReleaseError;

/// Boxed, sendable future used at the provider seams.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Outcome of a retention check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetentionDecision {
    Keep,
    Remove { reason: String },
}

impl RetentionDecision {
    pub fn remove(reason: impl Into<String>) -> Self {
        Self::Remove {
            reason: reason.into(),
        }
    }
}

/// Per-node strategy deciding when an idle provisioned node is torn down.
pub trait RetentionPolicy: Send + Sync {
    /// Decide whether to keep the node, given its current record.
    ///
    /// `now` is a unix timestamp in seconds.
    fn check(&self, node: &NodeRecord, now: u64) -> RetentionDecision;

    /// Short description for status output.
    fn describe(&self) -> String;
}

/// Provider-specific release of the external resource behind a node.
pub trait ReleaseHandle: Send {
    /// Free the resource. Consumes the handle: release runs at most once.
    fn release(self: Box<Self>) -> BoxFuture<Result<(), ReleaseError>>;
}

/// Release handle built from a closure producing the release future.
pub struct FnRelease<F>(F);

impl<F, Fut> FnRelease<F>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ReleaseError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, Fut> ReleaseHandle for FnRelease<F>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ReleaseError>> + Send + 'static,
{
    fn release(self: Box<Self>) -> BoxFuture<Result<(), ReleaseError>> {
        Box::pin((self.0)())
    }
}

/// A node produced by a capacity source, ready to be registered.
pub struct RealizedNode {
    pub record: NodeRecord,
    pub retention: Box<dyn RetentionPolicy>,
    pub release: Option<Box<dyn ReleaseHandle>>,
}

impl RealizedNode {
    pub fn new(record: NodeRecord, retention: Box<dyn RetentionPolicy>) -> Self {
        Self {
            record,
            retention,
            release: None,
        }
    }

    /// Attach the handle that frees the node's external resource.
    pub fn with_release(mut self, release: impl ReleaseHandle + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }
}

impl fmt::Debug for RealizedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealizedNode")
            .field("record", &self.record)
            .field("retention", &self.retention.describe())
            .field("release", &self.release.is_some())
            .finish()
    }
}

/// Run a node's release handle, if it has one.
pub async fn release_node(
    node_id: &str,
    release: Option<Box<dyn ReleaseHandle>>,
) -> Result<(), ReleaseError> {
    match release {
        Some(handle) => handle.release().await.map_err(|mut e| {
            if e.node.is_empty() {
                e.node = node_id.to_string();
            }
            e
        }),
        None => Ok(()),
    }
}
