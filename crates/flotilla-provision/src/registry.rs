//! Cluster registry boundary.
//!
//! The registry is the authoritative set of live nodes. Provisioning only
//! ever touches it through `register` (after a planned capacity resolves)
//! and `detach` / `detach_expired` (when a node is removed); all are safe
//! against repeated calls for the same identity.
//!
//! `Registry` persists node records in the `StateStore` and keeps each
//! node's retention policy and release handle in memory.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use flotilla_state::{LeakRecord, NodeId, NodeRecord, StateStore};

use crate::error::{RegisterError, RegistryError, RegistryResult};
use crate::node::{RealizedNode, ReleaseHandle, RetentionDecision, RetentionPolicy};

/// Result of a registration attempt.
#[derive(Debug)]
pub enum Registration {
    Added,
    /// A node with the same identity is already registered. Nothing
    /// changed; the rejected node comes back to the caller.
    Duplicate(RealizedNode),
}

impl Registration {
    pub fn is_added(&self) -> bool {
        matches!(self, Registration::Added)
    }
}

/// A node that has left the registry, with what is needed to release it.
pub struct DetachedNode {
    pub record: NodeRecord,
    pub release: Option<Box<dyn ReleaseHandle>>,
}

pub trait ClusterRegistry: Send + Sync {
    /// Add a node. Duplicate identities are ignored, not overwritten.
    fn register(&self, node: RealizedNode) -> Result<Registration, RegisterError>;

    /// Remove a node from scheduling. Returns `None` if it was not present.
    fn detach(&self, node_id: &str) -> RegistryResult<Option<DetachedNode>>;

    /// Detach the node only if its retention policy, checked against the
    /// current record at `now`, still says to remove it. Returns the node
    /// and the policy's reason.
    fn detach_expired(
        &self,
        node_id: &str,
        now: u64,
    ) -> RegistryResult<Option<(DetachedNode, String)>>;

    fn get(&self, node_id: &str) -> RegistryResult<Option<NodeRecord>>;

    fn list(&self) -> RegistryResult<Vec<NodeRecord>>;

    /// Apply an activity report (busy executors, queued tasks) for a node.
    fn update_activity(
        &self,
        node_id: &str,
        busy_executors: u32,
        pending_tasks: u32,
        now: u64,
    ) -> RegistryResult<NodeRecord>;

    /// Ask every node's retention policy for a decision.
    fn evaluate_retention(&self, now: u64) -> RegistryResult<Vec<(NodeRecord, RetentionDecision)>>;

    /// Remember an external resource that could not be released.
    fn record_leak(&self, leak: &LeakRecord) -> RegistryResult<()>;
}

struct NodeHandles {
    retention: Box<dyn RetentionPolicy>,
    release: Option<Box<dyn ReleaseHandle>>,
}

/// `StateStore`-backed cluster registry.
pub struct Registry {
    store: StateStore,
    handles: Mutex<HashMap<NodeId, NodeHandles>>,
    /// Policy for records restored from a previous run, whose in-memory
    /// handles are gone.
    orphan_policy: Option<Box<dyn RetentionPolicy>>,
}

impl Registry {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            handles: Mutex::new(HashMap::new()),
            orphan_policy: None,
        }
    }

    /// Retention policy applied to nodes found in the store at startup.
    ///
    /// Without one, such nodes are kept until removed manually.
    pub fn with_orphan_policy(mut self, policy: Box<dyn RetentionPolicy>) -> Self {
        self.orphan_policy = Some(policy);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Log nodes persisted by an earlier run. Returns their IDs.
    pub fn orphans(&self) -> RegistryResult<Vec<NodeId>> {
        let handles = self.lock();
        let orphans: Vec<NodeId> = self
            .store
            .list_nodes()?
            .into_iter()
            .filter(|n| !handles.contains_key(&n.id))
            .map(|n| n.id)
            .collect();
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "registry holds nodes without release handles");
        }
        Ok(orphans)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, NodeHandles>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn decide(
        &self,
        handles: &HashMap<NodeId, NodeHandles>,
        record: &NodeRecord,
        now: u64,
    ) -> RetentionDecision {
        match (handles.get(&record.id), &self.orphan_policy) {
            (Some(h), _) => h.retention.check(record, now),
            (None, Some(policy)) => policy.check(record, now),
            (None, None) => RetentionDecision::Keep,
        }
    }

    /// Drop the record and hand out the release handle. Caller holds the lock.
    fn detach_locked(
        &self,
        handles: &mut HashMap<NodeId, NodeHandles>,
        record: NodeRecord,
    ) -> RegistryResult<DetachedNode> {
        self.store.delete_node(&record.id)?;
        let node_handles = handles.remove(&record.id);
        info!(node_id = %record.id, source = %record.source, "node detached");
        Ok(DetachedNode {
            record,
            release: node_handles.and_then(|h| h.release),
        })
    }
}

impl ClusterRegistry for Registry {
    fn register(&self, node: RealizedNode) -> Result<Registration, RegisterError> {
        let mut handles = self.lock();
        match self.store.insert_node_if_absent(&node.record) {
            Ok(true) => {}
            Ok(false) => {
                debug!(node_id = %node.record.id, "duplicate registration ignored");
                return Ok(Registration::Duplicate(node));
            }
            Err(e) => {
                return Err(RegisterError {
                    error: e.into(),
                    node,
                });
            }
        }
        info!(
            node_id = %node.record.id,
            source = %node.record.source,
            executors = node.record.executors,
            retention = %node.retention.describe(),
            "node registered"
        );
        handles.insert(
            node.record.id,
            NodeHandles {
                retention: node.retention,
                release: node.release,
            },
        );
        Ok(Registration::Added)
    }

    fn detach(&self, node_id: &str) -> RegistryResult<Option<DetachedNode>> {
        let mut handles = self.lock();
        let Some(record) = self.store.get_node(node_id)? else {
            handles.remove(node_id);
            return Ok(None);
        };
        self.detach_locked(&mut handles, record).map(Some)
    }

    fn detach_expired(
        &self,
        node_id: &str,
        now: u64,
    ) -> RegistryResult<Option<(DetachedNode, String)>> {
        let mut handles = self.lock();
        let Some(record) = self.store.get_node(node_id)? else {
            return Ok(None);
        };
        let RetentionDecision::Remove { reason } = self.decide(&handles, &record, now) else {
            debug!(%node_id, "node no longer due for removal");
            return Ok(None);
        };
        let detached = self.detach_locked(&mut handles, record)?;
        Ok(Some((detached, reason)))
    }

    fn get(&self, node_id: &str) -> RegistryResult<Option<NodeRecord>> {
        Ok(self.store.get_node(node_id)?)
    }

    fn list(&self) -> RegistryResult<Vec<NodeRecord>> {
        Ok(self.store.list_nodes()?)
    }

    fn update_activity(
        &self,
        node_id: &str,
        busy_executors: u32,
        pending_tasks: u32,
        now: u64,
    ) -> RegistryResult<NodeRecord> {
        let _handles = self.lock();
        let mut record = self
            .store
            .get_node(node_id)?
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;
        record.apply_activity(busy_executors, pending_tasks, now);
        self.store.put_node(&record)?;
        debug!(%node_id, busy_executors, pending_tasks, "node activity updated");
        Ok(record)
    }

    fn evaluate_retention(&self, now: u64) -> RegistryResult<Vec<(NodeRecord, RetentionDecision)>> {
        let handles = self.lock();
        let records = self.store.list_nodes()?;
        let decisions = records
            .into_iter()
            .map(|record| {
                let decision = self.decide(&handles, &record, now);
                (record, decision)
            })
            .collect();
        Ok(decisions)
    }

    fn record_leak(&self, leak: &LeakRecord) -> RegistryResult<()> {
        self.store.put_leak(leak)?;
        warn!(node_id = %leak.node_id, source = %leak.source, error = %leak.error, "leaked resource recorded");
        Ok(())
    }
}
