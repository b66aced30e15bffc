//! Reaper — periodic retention sweep and two-phase node removal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use flotilla_provision::{
    AccessGuard, Action, Actor, ClusterRegistry, DetachedNode, EventSink, MutationError,
    ProvisionEvent, RegistryError, RegistryResult, ReleaseOutcome, RetentionDecision, SourceName,
    release_node,
};
use flotilla_state::{LeakRecord, NodeId, epoch_secs};

/// Result of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub evaluated: usize,
    /// Nodes detached from the registry during this sweep.
    pub removed: Vec<NodeId>,
    /// Release tasks of the removed nodes. Dropping them does not cancel
    /// the release.
    pub releases: Vec<JoinHandle<ReleaseOutcome>>,
}

pub struct Reaper {
    registry: Arc<dyn ClusterRegistry>,
    events: Arc<dyn EventSink>,
    guard: AccessGuard,
}

impl Reaper {
    pub fn new(registry: Arc<dyn ClusterRegistry>, events: Arc<dyn EventSink>) -> Self {
        Self {
            registry,
            events,
            guard: AccessGuard::default(),
        }
    }

    /// Guard consulted by manual removal.
    pub fn with_access_guard(mut self, guard: AccessGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Evaluate every node's retention policy at the current time.
    pub fn sweep(&self) -> RegistryResult<SweepReport> {
        self.sweep_at(epoch_secs())
    }

    /// Evaluate every node's retention policy at `now` and remove the
    /// nodes whose policy says so.
    ///
    /// The decision is taken again at detach time, against the record as
    /// it is then, so activity reported mid-sweep keeps the node.
    ///
    /// Must be called from within a tokio runtime.
    pub fn sweep_at(&self, now: u64) -> RegistryResult<SweepReport> {
        let decisions = self.registry.evaluate_retention(now)?;
        let mut report = SweepReport {
            evaluated: decisions.len(),
            ..Default::default()
        };

        for (record, decision) in decisions {
            if !matches!(decision, RetentionDecision::Remove { .. }) {
                continue;
            }
            match self.registry.detach_expired(&record.id, now) {
                Ok(Some((detached, reason))) => {
                    report.releases.push(self.spawn_release(detached, reason));
                    report.removed.push(record.id);
                }
                Ok(None) => debug!(node_id = %record.id, "node kept after recheck"),
                Err(e) => error!(node_id = %record.id, error = %e, "failed to detach node"),
            }
        }
        Ok(report)
    }

    /// Remove a node on behalf of `actor`.
    ///
    /// The actor needs a grant on the node's source. The returned handle
    /// resolves once the release attempt has finished.
    pub fn remove_node(
        &self,
        actor: &Actor,
        node_id: &str,
        reason: &str,
    ) -> Result<JoinHandle<ReleaseOutcome>, MutationError> {
        let record = self
            .registry
            .get(node_id)?
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;
        let source = SourceName::new(record.source.as_str())
            .map_err(|_| MutationError::UnknownSource(record.source.clone()))?;
        self.guard.check(actor, Action::Remove, &source)?;

        info!(%actor, %node_id, %reason, "manual node removal");
        let detached = self
            .registry
            .detach(node_id)?
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;
        Ok(self.spawn_release(detached, format!("removed by {actor}: {reason}")))
    }

    /// Second phase of removal: the node is already detached.
    fn spawn_release(&self, detached: DetachedNode, reason: String) -> JoinHandle<ReleaseOutcome> {
        let registry = self.registry.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let DetachedNode { record, release } = detached;
            let outcome = if release.is_none() {
                ReleaseOutcome::NothingToRelease
            } else {
                match release_node(&record.id, release).await {
                    Ok(()) => ReleaseOutcome::Released,
                    Err(e) => {
                        let leak = LeakRecord {
                            node_id: record.id.clone(),
                            source: record.source.clone(),
                            error: e.to_string(),
                            recorded_at: epoch_secs(),
                        };
                        if let Err(store_err) = registry.record_leak(&leak) {
                            error!(node_id = %record.id, error = %store_err, "failed to record leaked resource");
                        }
                        ReleaseOutcome::Leaked {
                            error: e.to_string(),
                        }
                    }
                }
            };

            events.emit(ProvisionEvent::NodeRemoved {
                node: record.id,
                source: record.source,
                reason,
                release: outcome.clone(),
            });
            outcome
        })
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "reaper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.sweep() {
                        Ok(report) if !report.removed.is_empty() => {
                            info!(
                                evaluated = report.evaluated,
                                removed = report.removed.len(),
                                "retention sweep removed nodes"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "retention sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("reaper shutting down");
                    break;
                }
            }
        }
    }
}
