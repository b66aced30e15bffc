//! Simulated capacity source.
//!
//! Boots fake nodes after a fixed delay without talking to any provider.
//! Useful for local runs and for exercising the loop end to end.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use flotilla_provision::{
    CapacitySource, FnRelease, Label, PlannedCapacity, ProvisionRequestError, RealizedNode,
    ReleaseError, RetentionPolicy, SourceName, release_node,
};
use flotilla_retention::{Always, IdleTimeout, SingleUse};
use flotilla_state::{NodeRecord, epoch_secs};

use crate::config::{RetentionMode, SourceConfig};

pub struct SimulatedSource {
    name: SourceName,
    labels: Vec<Label>,
    untagged: bool,
    executors_per_node: u32,
    max_nodes: u32,
    boot_delay: Duration,
    retention: RetentionMode,
    idle_timeout: Duration,
    /// Nodes booting or live.
    nodes: Arc<AtomicU32>,
    next_node: AtomicU64,
}

impl SimulatedSource {
    pub fn from_config(config: &SourceConfig) -> anyhow::Result<Self> {
        let labels = config
            .labels
            .iter()
            .map(|l| Label::new(l.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: SourceName::new(config.name.as_str())?,
            labels,
            untagged: config.untagged,
            executors_per_node: config.executors_per_node.max(1),
            max_nodes: config.max_nodes,
            boot_delay: config.boot_delay(),
            retention: config.retention,
            idle_timeout: config.idle_timeout(),
            nodes: Arc::new(AtomicU32::new(0)),
            next_node: AtomicU64::new(1),
        })
    }

    /// Continue node numbering after the nodes this source created in an
    /// earlier run, so new IDs never collide with persisted records.
    pub fn resume_after(self, existing: &[NodeRecord]) -> Self {
        let prefix = format!("{}-", self.name);
        let last = existing
            .iter()
            .filter(|r| r.source == self.name.as_str())
            .filter_map(|r| r.id.strip_prefix(&prefix)?.parse::<u64>().ok())
            .max();
        if let Some(last) = last {
            debug!(source = %self.name, last, "resuming node numbering");
            self.next_node.store(last + 1, Ordering::SeqCst);
        }
        self
    }

    /// Nodes currently booting or live.
    pub fn node_count(&self) -> u32 {
        self.nodes.load(Ordering::SeqCst)
    }

    fn retention_policy(&self) -> Box<dyn RetentionPolicy> {
        match self.retention {
            RetentionMode::Idle => Box::new(IdleTimeout::new(self.idle_timeout)),
            RetentionMode::Always => Box::new(Always),
            RetentionMode::Once => Box::new(SingleUse),
        }
    }

    /// Reserve up to `wanted` node slots under `max_nodes`.
    fn reserve(&self, wanted: u32) -> u32 {
        let mut granted = 0;
        let _ = self
            .nodes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                granted = wanted.min(self.max_nodes.saturating_sub(current));
                Some(current + granted)
            });
        granted
    }
}

impl CapacitySource for SimulatedSource {
    fn name(&self) -> &SourceName {
        &self.name
    }

    fn display_name(&self) -> String {
        format!("Simulated ({})", self.name)
    }

    fn can_provision(&self, label: Option<&Label>) -> bool {
        match label {
            None => self.untagged,
            Some(label) => self.labels.contains(label),
        }
    }

    fn provision(
        &self,
        label: Option<&Label>,
        excess_workload: u32,
    ) -> Result<Vec<PlannedCapacity>, ProvisionRequestError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ProvisionRequestError::Unavailable(e.to_string()))?;

        let wanted = excess_workload.div_ceil(self.executors_per_node);
        let count = self.reserve(wanted);
        if count < wanted {
            debug!(source = %self.name, wanted, count, max_nodes = self.max_nodes, "node limit reached");
        }

        let mut planned = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let n = self.next_node.fetch_add(1, Ordering::SeqCst);
            let node_id = format!("{}-{n}", self.name);
            let (capacity, completer) =
                PlannedCapacity::new(format!("simulated node {node_id}"), self.executors_per_node);

            let record = NodeRecord::new(
                node_id.clone(),
                self.name.as_str(),
                label.map(|l| l.to_string()),
                self.executors_per_node,
                0,
            )
            .with_description(format!("simulated node of {}", self.name));
            let retention = self.retention_policy();
            let nodes = self.nodes.clone();
            let boot_delay = self.boot_delay;

            runtime.spawn(async move {
                tokio::time::sleep(boot_delay).await;

                let mut record = record;
                record.registered_at = epoch_secs();
                record.idle_since = Some(record.registered_at);
                let counter = nodes.clone();
                let release_id = node_id.clone();
                let node = RealizedNode::new(record, retention).with_release(FnRelease::new(
                    move || async move {
                        counter
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
                            .map(|_| ())
                            .map_err(|_| ReleaseError::new(release_id, "node count already zero"))
                    },
                ));

                // The loop stopped waiting; give the slot back.
                if let Err(node) = completer.complete(node) {
                    if let Err(e) = release_node(&node_id, node.release).await {
                        warn!(%node_id, error = %e, "failed to release unclaimed node");
                    }
                }
            });
            planned.push(capacity);
        }
        Ok(planned)
    }
}
