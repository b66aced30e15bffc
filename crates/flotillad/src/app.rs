//! Wiring of the daemon's subsystems from configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use flotilla_api::ApiState;
use flotilla_provision::{
    AccessGuard, CapacitySource, ClusterRegistry, DemandBoard, DemandSignal, EventLog, GrantTable,
    ProvisionerHandle, ProvisioningLoop, Registry, SmoothedDemand, SourceSet, provisioner,
};
use flotilla_retention::{Always, Reaper};
use flotilla_state::{NodeRecord, StateStore};

use crate::config::{FlotillaConfig, SourceKind};
use crate::simulated::SimulatedSource;

/// Everything the daemon runs, assembled but not started.
pub struct App {
    pub provisioner: ProvisionerHandle,
    pub reaper: Arc<Reaper>,
    pub registry: Arc<Registry>,
    pub demand: DemandBoard,
    pub events: EventLog,
    pub store: StateStore,
    tick_interval: Duration,
    retention_interval: Duration,
}

impl App {
    pub fn build(config: &FlotillaConfig, store: StateStore) -> anyhow::Result<Self> {
        // Records left by an earlier run have no release handle; keep them
        // until an operator removes them.
        let registry = Arc::new(Registry::new(store.clone()).with_orphan_policy(Box::new(Always)));
        let orphans = registry.orphans()?;
        if !orphans.is_empty() {
            info!(count = orphans.len(), "restored nodes from previous run");
        }

        let sources = build_sources(config, &registry.list()?)?;
        info!(count = sources.len(), "capacity sources configured");

        let guard = match &config.access.grants {
            Some(grants) => AccessGuard::new(Arc::new(GrantTable::from_config(grants))),
            None => AccessGuard::allow_all(),
        };

        let demand = DemandBoard::new();
        let signal: Arc<dyn DemandSignal> = if config.demand.smoothing > 0.0 {
            Arc::new(SmoothedDemand::new(demand.clone(), config.demand.smoothing))
        } else {
            Arc::new(demand.clone())
        };
        let events = EventLog::new(config.daemon.event_history);

        let mut provisioner =
            ProvisioningLoop::new(sources, registry.clone(), signal, Arc::new(events.clone()))
                .with_access_guard(guard.clone());
        if let Some(timeout) = config.completion_timeout() {
            provisioner = provisioner.with_completion_timeout(timeout);
        }

        let reaper = Reaper::new(registry.clone(), Arc::new(events.clone()))
            .with_access_guard(guard);

        Ok(Self {
            provisioner: provisioner.into_handle(),
            reaper: Arc::new(reaper),
            registry,
            demand,
            events,
            store,
            tick_interval: config.tick_interval(),
            retention_interval: config.retention_interval(),
        })
    }

    pub fn router(&self) -> Router {
        let registry: Arc<dyn ClusterRegistry> = self.registry.clone();
        flotilla_api::build_router(ApiState {
            provisioner: self.provisioner.clone(),
            registry,
            reaper: self.reaper.clone(),
            demand: self.demand.clone(),
            events: self.events.clone(),
            store: self.store.clone(),
        })
    }

    /// Start the provisioning loop and the reaper.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let handle = self.provisioner.clone();
        let tick_interval = self.tick_interval;
        let loop_shutdown = shutdown.clone();
        let loop_handle = tokio::spawn(async move {
            provisioner::run(handle, tick_interval, loop_shutdown).await;
        });

        let reaper = self.reaper.clone();
        let retention_interval = self.retention_interval;
        let reaper_handle = tokio::spawn(async move {
            reaper.run(retention_interval, shutdown).await;
        });

        vec![loop_handle, reaper_handle]
    }
}

fn build_sources(config: &FlotillaConfig, existing: &[NodeRecord]) -> anyhow::Result<SourceSet> {
    let mut sources = SourceSet::new();
    for source_config in &config.sources {
        let source: Arc<dyn CapacitySource> = match source_config.kind {
            SourceKind::Simulated => Arc::new(
                SimulatedSource::from_config(source_config)?.resume_after(existing),
            ),
        };
        info!(
            source = %source.name(),
            labels = ?source_config.labels,
            untagged = source_config.untagged,
            "capacity source added"
        );
        sources.insert(source)?;
    }
    Ok(sources)
}
