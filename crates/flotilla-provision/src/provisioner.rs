//! Provisioning loop — turns unmet demand into planned capacity and
//! planned capacity into registered nodes.
//!
//! Each tick:
//!
//! ```text
//! 1. poll outstanding planned capacity (non-blocking)
//!      ok      → register node, clear ledger promise
//!      failed  → clear ledger promise, emit failure
//!      timeout → clear ledger promise, move to abandoned
//! 2. poll abandoned planned capacity; late nodes are released, never registered
//!
//! A node the registry turns away (duplicate identity, store failure) is
//! released the same way; a failed release is recorded as a leak.
//! 3. for each demanded label:
//!      remaining = excess - ledger.promised_for_label(label)
//!      ask capable sources in configuration order until remaining is covered
//! ```
//!
//! Ticks are serialized by the `ProvisionerHandle` mutex, which makes the
//! ledger and poll-set updates a critical section.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use flotilla_state::{LeakRecord, epoch_secs};

use crate::access::{AccessGuard, Action, Actor};
use crate::demand::{Demand, DemandSignal};
use crate::error::{
    MutationError, ProvisionCompletionError, ProvisionRequestError, ProvisionTimeoutError,
    RegisterError,
};
use crate::event::{EventSink, ProvisionEvent};
use crate::label::{Label, SourceName, display_label};
use crate::ledger::ProvisioningLedger;
use crate::node::{RealizedNode, release_node};
use crate::planned::{Completion, CompletionState, PlannedCapacity, PlannedId};
use crate::registry::{ClusterRegistry, Registration};
use crate::source::{CapacitySource, SourceSet, guarded_can_provision, guarded_provision};

/// Shared handle to the loop. Holding the lock serializes ticks and manual
/// triggers.
pub type ProvisionerHandle = Arc<Mutex<ProvisioningLoop>>;

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    /// Planned capacities accepted from sources.
    pub requested: usize,
    pub promised_executors: u32,
    pub registered: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub late_discarded: usize,
    /// Sources whose calls failed this tick.
    pub source_failures: usize,
    /// Labels no source could serve.
    pub unmet: Vec<Option<Label>>,
}

/// Status view of one outstanding planned capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutstandingView {
    pub planned: PlannedId,
    pub source: SourceName,
    pub label: Option<Label>,
    pub promised_executors: u32,
    pub description: String,
    pub age_secs: u64,
}

struct Outstanding {
    planned: PlannedCapacity,
    source: SourceName,
    label: Option<Label>,
}

struct Abandoned {
    planned: PlannedId,
    source: SourceName,
    completion: Completion,
}

pub struct ProvisioningLoop {
    sources: SourceSet,
    ledger: ProvisioningLedger,
    outstanding: Vec<Outstanding>,
    abandoned: Vec<Abandoned>,
    registry: Arc<dyn ClusterRegistry>,
    demand: Arc<dyn DemandSignal>,
    events: Arc<dyn EventSink>,
    guard: AccessGuard,
    completion_timeout: Option<Duration>,
    tick: u64,
}

impl ProvisioningLoop {
    pub fn new(
        sources: SourceSet,
        registry: Arc<dyn ClusterRegistry>,
        demand: Arc<dyn DemandSignal>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            sources,
            ledger: ProvisioningLedger::new(),
            outstanding: Vec::new(),
            abandoned: Vec::new(),
            registry,
            demand,
            events,
            guard: AccessGuard::default(),
            completion_timeout: None,
            tick: 0,
        }
    }

    /// Give up on planned capacity that has not resolved after `timeout`.
    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = Some(timeout);
        self
    }

    /// Guard consulted by manual provisioning.
    pub fn with_access_guard(mut self, guard: AccessGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Wrap into a shareable handle.
    pub fn into_handle(self) -> ProvisionerHandle {
        Arc::new(Mutex::new(self))
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn sources(&self) -> &SourceSet {
        &self.sources
    }

    pub fn ledger(&self) -> &ProvisioningLedger {
        &self.ledger
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn outstanding(&self) -> Vec<OutstandingView> {
        self.outstanding
            .iter()
            .map(|o| OutstandingView {
                planned: o.planned.id,
                source: o.source.clone(),
                label: o.label.clone(),
                promised_executors: o.planned.promised_executors,
                description: o.planned.description.clone(),
                age_secs: o.planned.age().as_secs(),
            })
            .collect()
    }

    // ── Reconfiguration ────────────────────────────────────────────

    /// Add a source at the end of the evaluation order.
    pub fn add_source(
        &mut self,
        source: Arc<dyn CapacitySource>,
    ) -> Result<(), crate::error::ConfigError> {
        self.sources.insert(source)
    }

    /// Remove a source. Its outstanding planned capacity is still polled.
    pub fn remove_source(&mut self, name: &str) -> Option<Arc<dyn CapacitySource>> {
        self.sources.remove(name)
    }

    // ── Tick ───────────────────────────────────────────────────────

    /// Run one evaluation round.
    pub async fn tick(&mut self) -> TickReport {
        self.tick += 1;
        let mut report = TickReport {
            tick: self.tick,
            ..Default::default()
        };
        self.events.emit(ProvisionEvent::TickStarted { tick: self.tick });

        self.poll_outstanding(&mut report);
        self.poll_abandoned(&mut report);

        let mut failed_sources = HashSet::new();
        for demand in self.demand.sample() {
            if demand.excess == 0 {
                continue;
            }
            self.evaluate(&demand, &mut failed_sources, &mut report);
        }
        report.source_failures = failed_sources.len();

        self.events.emit(ProvisionEvent::TickFinished {
            tick: self.tick,
            requested: report.requested,
            registered: report.registered,
            failed: report.failed + report.timed_out,
        });
        report
    }

    fn evaluate(
        &mut self,
        demand: &Demand,
        failed_sources: &mut HashSet<SourceName>,
        report: &mut TickReport,
    ) {
        let label = demand.label.as_ref();
        let already = self.ledger.promised_for_label(label);
        let remaining = demand.excess.saturating_sub(already);
        if remaining == 0 {
            debug!(
                label = %display_label(label),
                excess = demand.excess,
                already,
                "demand covered by in-flight capacity"
            );
            return;
        }

        let candidates: Vec<Arc<dyn CapacitySource>> = self.sources.iter().cloned().collect();
        let mut granted = 0u32;
        let mut capable = false;
        let mut skipped = false;

        for source in candidates {
            if granted >= remaining {
                break;
            }
            let name = source.name().clone();
            if failed_sources.contains(&name) {
                skipped = true;
                continue;
            }

            match guarded_can_provision(source.as_ref(), label) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    self.request_failed(&name, label, e);
                    failed_sources.insert(name);
                    skipped = true;
                    continue;
                }
            }
            capable = true;

            match guarded_provision(source.as_ref(), label, remaining - granted) {
                Ok(planned) => {
                    let (executors, ids) = self.accept(&name, label, planned);
                    granted = granted.saturating_add(executors);
                    report.requested += ids.len();
                    report.promised_executors = report.promised_executors.saturating_add(executors);
                }
                Err(e) => {
                    self.request_failed(&name, label, e);
                    failed_sources.insert(name);
                }
            }
        }

        // A source that errored this tick may still serve the label.
        if !capable && !skipped {
            self.events.emit(ProvisionEvent::DemandUnmet {
                label: label.cloned(),
                excess: demand.excess,
            });
            report.unmet.push(label.cloned());
        }
    }

    /// Track planned capacity returned by a source.
    fn accept(
        &mut self,
        source: &SourceName,
        label: Option<&Label>,
        planned: Vec<PlannedCapacity>,
    ) -> (u32, Vec<PlannedId>) {
        let mut executors = 0u32;
        let mut ids = Vec::with_capacity(planned.len());
        for p in planned {
            self.ledger.record(source, label, p.id, p.promised_executors);
            executors = executors.saturating_add(p.promised_executors);
            ids.push(p.id);
            self.events.emit(ProvisionEvent::ProvisionRequested {
                source: source.clone(),
                label: label.cloned(),
                planned: p.id,
                executors: p.promised_executors,
                description: p.description.clone(),
            });
            self.outstanding.push(Outstanding {
                planned: p,
                source: source.clone(),
                label: label.cloned(),
            });
        }
        (executors, ids)
    }

    fn request_failed(&self, source: &SourceName, label: Option<&Label>, error: ProvisionRequestError) {
        self.events.emit(ProvisionEvent::RequestFailed {
            source: source.clone(),
            label: label.cloned(),
            error: error.to_string(),
        });
    }

    fn poll_outstanding(&mut self, report: &mut TickReport) {
        let timeout = self.completion_timeout;
        for mut entry in std::mem::take(&mut self.outstanding) {
            let id = entry.planned.id;
            match entry.planned.completion.poll() {
                CompletionState::Pending => {
                    let age = entry.planned.age();
                    match timeout {
                        Some(limit) if age >= limit => {
                            self.ledger.resolve(id);
                            let error = ProvisionTimeoutError {
                                planned: id,
                                waited: age,
                            };
                            self.events.emit(ProvisionEvent::ProvisionTimedOut {
                                source: entry.source.clone(),
                                label: entry.label.clone(),
                                planned: id,
                                error: error.to_string(),
                            });
                            report.timed_out += 1;
                            self.abandoned.push(Abandoned {
                                planned: id,
                                source: entry.source,
                                completion: entry.planned.completion,
                            });
                        }
                        _ => self.outstanding.push(entry),
                    }
                }
                CompletionState::Ready(Ok(node)) => {
                    self.ledger.resolve(id);
                    self.merge(&entry.source, entry.label, id, node, report);
                }
                CompletionState::Ready(Err(error)) => {
                    self.ledger.resolve(id);
                    self.completion_failed(&entry.source, entry.label, id, error, report);
                }
                CompletionState::Spent => {
                    self.ledger.resolve(id);
                }
            }
        }
    }

    fn merge(
        &mut self,
        source: &SourceName,
        label: Option<Label>,
        planned: PlannedId,
        node: RealizedNode,
        report: &mut TickReport,
    ) {
        let node_id = node.record.id.clone();
        match self.registry.register(node) {
            Ok(Registration::Added) => {
                report.registered += 1;
                self.events.emit(ProvisionEvent::ProvisionSucceeded {
                    source: source.clone(),
                    label,
                    planned,
                    node: node_id,
                });
            }
            Ok(Registration::Duplicate(node)) => {
                self.events.emit(ProvisionEvent::DuplicateNodeIgnored {
                    source: source.clone(),
                    planned,
                    node: node_id,
                });
                discard(&self.registry, node);
            }
            Err(RegisterError { error, node }) => {
                let error = ProvisionCompletionError::Registry(error.to_string());
                self.completion_failed(source, label, planned, error, report);
                discard(&self.registry, node);
            }
        }
    }

    fn completion_failed(
        &self,
        source: &SourceName,
        label: Option<Label>,
        planned: PlannedId,
        error: ProvisionCompletionError,
        report: &mut TickReport,
    ) {
        report.failed += 1;
        self.events.emit(ProvisionEvent::ProvisionFailed {
            source: source.clone(),
            label,
            planned,
            error: error.to_string(),
        });
    }

    fn poll_abandoned(&mut self, report: &mut TickReport) {
        let events = &self.events;
        let registry = &self.registry;
        self.abandoned.retain_mut(|entry| match entry.completion.poll() {
            CompletionState::Pending => true,
            CompletionState::Ready(Ok(node)) => {
                events.emit(ProvisionEvent::LateCompletionDiscarded {
                    source: entry.source.clone(),
                    planned: entry.planned,
                    node: node.record.id.clone(),
                });
                report.late_discarded += 1;
                discard(registry, node);
                false
            }
            CompletionState::Ready(Err(error)) => {
                debug!(planned = %entry.planned, %error, "abandoned planned capacity failed");
                false
            }
            CompletionState::Spent => false,
        });
    }

    // ── Manual trigger ─────────────────────────────────────────────

    /// Provision on behalf of `actor`, bypassing demand evaluation.
    ///
    /// The permission check happens before any source call or ledger
    /// change.
    pub fn provision_manually(
        &mut self,
        actor: &Actor,
        source_name: &str,
        label: Option<Label>,
        excess_workload: u32,
    ) -> Result<Vec<PlannedId>, MutationError> {
        let source = self
            .sources
            .get(source_name)
            .cloned()
            .ok_or_else(|| MutationError::UnknownSource(source_name.to_string()))?;
        let name = source.name().clone();
        self.guard.check(actor, Action::Provision, &name)?;

        if excess_workload == 0 {
            return Err(MutationError::ZeroWorkload);
        }
        let label = label.as_ref();
        if !guarded_can_provision(source.as_ref(), label)? {
            return Err(MutationError::UnsupportedLabel {
                source_name: name.to_string(),
                label: display_label(label),
            });
        }

        let planned = match guarded_provision(source.as_ref(), label, excess_workload) {
            Ok(planned) => planned,
            Err(e) => {
                self.request_failed(&name, label, e.clone());
                return Err(e.into());
            }
        };
        let (executors, ids) = self.accept(&name, label, planned);
        info!(
            %actor,
            source = %name,
            label = %display_label(label),
            excess_workload,
            executors,
            "manual provisioning requested"
        );
        Ok(ids)
    }
}

/// Release a node that will never be registered.
/// Release a node that will never be registered. Runs in the background.
fn discard(registry: &Arc<dyn ClusterRegistry>, node: RealizedNode) {
    let RealizedNode { record, release, .. } = node;
    if release.is_none() {
        return;
    }
    let registry = registry.clone();
    tokio::spawn(async move {
        let Err(e) = release_node(&record.id, release).await else {
            debug!(node_id = %record.id, "discarded node released");
            return;
        };
        warn!(node_id = %record.id, error = %e, "failed to release discarded node");
        let leak = LeakRecord {
            node_id: record.id.clone(),
            source: record.source,
            error: e.to_string(),
            recorded_at: epoch_secs(),
        };
        if let Err(store_err) = registry.record_leak(&leak) {
            error!(node_id = %record.id, error = %store_err, "failed to record leaked resource");
        }
    });
}

/// Drive ticks every `interval` until `shutdown` fires.
pub async fn run(
    handle: ProvisionerHandle,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_ms = interval.as_millis() as u64, "provisioning loop started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let report = handle.lock().await.tick().await;
                if report.requested > 0 || report.registered > 0 || report.failed > 0 {
                    debug!(?report, "provisioning tick");
                }
            }
            _ = shutdown.changed() => {
                info!("provisioning loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use flotilla_state::{NodeRecord, StateError, StateStore};

    use crate::access::GrantTable;
    use crate::demand::DemandBoard;
    use crate::error::{RegistryError, RegistryResult, ReleaseError};
    use crate::event::EventLog;
    use crate::node::{FnRelease, RetentionDecision, RetentionPolicy};
    use crate::planned::Completer;
    use crate::registry::{DetachedNode, Registry};

    struct Keep;

    impl RetentionPolicy for Keep {
        fn check(&self, _node: &NodeRecord, _now: u64) -> RetentionDecision {
            RetentionDecision::Keep
        }

        fn describe(&self) -> String {
            "keep".to_string()
        }
    }

    /// Source whose answers are scripted by the test.
    struct ScriptedSource {
        name: SourceName,
        labels: Vec<Option<Label>>,
        /// Promised executors of each planned capacity returned per call.
        promises: Vec<u32>,
        failures_left: AtomicUsize,
        panic: bool,
        calls: AtomicUsize,
        last_excess: AtomicU32,
        completers: StdMutex<Vec<(Completer, u32)>>,
        next_node: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(name: &str, labels: Vec<Option<Label>>, promises: Vec<u32>) -> Self {
            Self {
                name: SourceName::new(name).unwrap(),
                labels,
                promises,
                failures_left: AtomicUsize::new(0),
                panic: false,
                calls: AtomicUsize::new(0),
                last_excess: AtomicU32::new(0),
                completers: StdMutex::new(Vec::new()),
                next_node: AtomicUsize::new(0),
            }
        }

        fn failing_first(self, n: usize) -> Self {
            self.failures_left.store(n, Ordering::SeqCst);
            self
        }

        fn panicking(mut self) -> Self {
            self.panic = true;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn take_completers(&self) -> Vec<(Completer, u32)> {
            std::mem::take(&mut *self.completers.lock().unwrap())
        }

        fn node(&self, executors: u32) -> RealizedNode {
            let n = self.next_node.fetch_add(1, Ordering::SeqCst);
            RealizedNode::new(
                NodeRecord::new(format!("{}-{n}", self.name), self.name.as_str(), None, executors, 1000),
                Box::new(Keep),
            )
        }

        fn complete_all(&self) {
            for (completer, executors) in self.take_completers() {
                completer.complete(self.node(executors)).unwrap();
            }
        }

        fn fail_all(&self) {
            for (completer, _) in self.take_completers() {
                assert!(completer.fail(ProvisionCompletionError::failed("boot failed")));
            }
        }
    }

    impl CapacitySource for ScriptedSource {
        fn name(&self) -> &SourceName {
            &self.name
        }

        fn can_provision(&self, label: Option<&Label>) -> bool {
            self.labels.iter().any(|l| l.as_ref() == label)
        }

        fn provision(
            &self,
            _label: Option<&Label>,
            excess_workload: u32,
        ) -> Result<Vec<PlannedCapacity>, ProvisionRequestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_excess.store(excess_workload, Ordering::SeqCst);
            if self.panic {
                panic!("scripted panic");
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProvisionRequestError::Unavailable("api down".to_string()));
            }
            let mut planned = Vec::new();
            for &executors in &self.promises {
                let (p, completer) = PlannedCapacity::new(format!("{} node", self.name), executors);
                self.completers.lock().unwrap().push((completer, executors));
                planned.push(p);
            }
            Ok(planned)
        }
    }

    struct Harness {
        provisioner: ProvisioningLoop,
        board: DemandBoard,
        events: EventLog,
        registry: Arc<Registry>,
    }

    fn harness(sources: Vec<Arc<ScriptedSource>>) -> Harness {
        let board = DemandBoard::new();
        let events = EventLog::new(1024);
        let registry = Arc::new(Registry::new(StateStore::open_in_memory().unwrap()));
        let set = SourceSet::from_sources(
            sources
                .into_iter()
                .map(|s| s as Arc<dyn CapacitySource>),
        )
        .unwrap();
        let provisioner = ProvisioningLoop::new(
            set,
            registry.clone(),
            Arc::new(board.clone()),
            Arc::new(events.clone()),
        );
        Harness {
            provisioner,
            board,
            events,
            registry,
        }
    }

    fn gpu() -> Option<Label> {
        Some(Label::new("gpu").unwrap())
    }

    /// The ledger must equal the exact sum of outstanding promises per key.
    fn assert_ledger_consistent(provisioner: &ProvisioningLoop) {
        let mut expected: BTreeMap<(SourceName, Option<Label>), u32> = BTreeMap::new();
        for o in provisioner.outstanding() {
            *expected.entry((o.source, o.label)).or_default() += o.promised_executors;
        }
        let actual: BTreeMap<_, _> = provisioner
            .ledger()
            .entries()
            .into_iter()
            .map(|e| ((e.source, e.label), e.promised_executors))
            .collect();
        assert_eq!(actual, expected);
        assert_eq!(provisioner.ledger().outstanding(), provisioner.outstanding().len());
    }

    fn count_events(events: &EventLog, pred: impl Fn(&ProvisionEvent) -> bool) -> usize {
        events.snapshot().iter().filter(|e| pred(e)).count()
    }

    #[tokio::test]
    async fn gpu_demand_met_by_two_planned_nodes() {
        let source = Arc::new(ScriptedSource::new("sim", vec![gpu()], vec![2, 1]));
        let mut h = harness(vec![source.clone()]);
        h.board.set(gpu(), 3);

        let report = h.provisioner.tick().await;
        assert_eq!(report.requested, 2);
        assert_eq!(report.promised_executors, 3);
        assert_eq!(h.provisioner.ledger().promised_for_label(gpu().as_ref()), 3);
        assert_ledger_consistent(&h.provisioner);

        source.complete_all();
        let report = h.provisioner.tick().await;
        assert_eq!(report.registered, 2);
        // Demand is still 3 on the board but the scheduler has not yet
        // reported the new nodes; with the ledger cleared the loop asks again.
        assert_eq!(h.registry.list().unwrap().len(), 2);

        h.board.clear();
        source.complete_all();
        h.provisioner.tick().await;
        assert_eq!(h.provisioner.ledger().promised_for_label(gpu().as_ref()), 0);
        assert_eq!(h.registry.list().unwrap().len(), 4);
        assert_ledger_consistent(&h.provisioner);
    }

    #[tokio::test]
    async fn in_flight_capacity_suppresses_further_requests() {
        let first = Arc::new(ScriptedSource::new("first", vec![None], vec![3]));
        let second = Arc::new(ScriptedSource::new("second", vec![None], vec![3]));
        let mut h = harness(vec![first.clone(), second.clone()]);
        h.board.set(None, 3);

        for _ in 0..3 {
            h.provisioner.tick().await;
            assert_ledger_consistent(&h.provisioner);
        }

        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
        assert_eq!(h.provisioner.ledger().promised_for_label(None), 3);
    }

    #[tokio::test]
    async fn remaining_demand_spills_to_next_source() {
        let first = Arc::new(ScriptedSource::new("first", vec![None], vec![1]));
        let second = Arc::new(ScriptedSource::new("second", vec![None], vec![2]));
        let third = Arc::new(ScriptedSource::new("third", vec![None], vec![5]));
        let mut h = harness(vec![first.clone(), second.clone(), third.clone()]);
        h.board.set(None, 3);

        h.provisioner.tick().await;

        assert_eq!(first.last_excess.load(Ordering::SeqCst), 3);
        assert_eq!(second.last_excess.load(Ordering::SeqCst), 2);
        assert_eq!(third.calls(), 0);
        assert_ledger_consistent(&h.provisioner);
    }

    #[tokio::test]
    async fn partially_covered_demand_requests_only_the_difference() {
        let source = Arc::new(ScriptedSource::new("sim", vec![None], vec![2]));
        let mut h = harness(vec![source.clone()]);
        h.board.set(None, 2);
        h.provisioner.tick().await;

        h.board.set(None, 5);
        h.provisioner.tick().await;

        assert_eq!(source.calls(), 2);
        assert_eq!(source.last_excess.load(Ordering::SeqCst), 3);
        assert_ledger_consistent(&h.provisioner);
    }

    #[tokio::test]
    async fn duplicate_resolution_registers_once() {
        let source = Arc::new(ScriptedSource::new("sim", vec![None], vec![1, 1]));
        let mut h = harness(vec![source.clone()]);
        h.board.set(None, 2);
        h.provisioner.tick().await;
        h.board.clear();

        // Both planned capacities resolve to the same node identity.
        let released = Arc::new(AtomicUsize::new(0));
        for (completer, executors) in source.take_completers() {
            let counter = released.clone();
            let node = RealizedNode::new(
                NodeRecord::new("same-node", "sim", None, executors, 1000),
                Box::new(Keep),
            )
            .with_release(FnRelease::new(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ReleaseError>(())
            }));
            completer.complete(node).unwrap();
        }
        let report = h.provisioner.tick().await;

        assert_eq!(report.registered, 1);
        assert_eq!(h.registry.list().unwrap().len(), 1);

        // The turned-away node is released.
        wait_for(|| released.load(Ordering::SeqCst) == 1).await;
        assert_eq!(h.provisioner.ledger().outstanding(), 0);
        assert_eq!(
            count_events(&h.events, |e| matches!(e, ProvisionEvent::DuplicateNodeIgnored { .. })),
            1
        );

        // Further ticks change nothing.
        h.provisioner.tick().await;
        assert_eq!(h.registry.list().unwrap().len(), 1);
        assert_ledger_consistent(&h.provisioner);

        // The registered node kept its own handle.
        let detached = h.registry.detach("same-node").unwrap().unwrap();
        release_node("same-node", detached.release).await.unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    /// Registry whose store is gone: every registration fails.
    #[derive(Default)]
    struct BrokenRegistry {
        leaks: StdMutex<Vec<LeakRecord>>,
    }

    impl ClusterRegistry for BrokenRegistry {
        fn register(&self, node: RealizedNode) -> Result<Registration, RegisterError> {
            Err(RegisterError {
                error: StateError::Transaction("disk full".to_string()).into(),
                node,
            })
        }

        fn detach(&self, _node_id: &str) -> RegistryResult<Option<DetachedNode>> {
            Ok(None)
        }

        fn detach_expired(
            &self,
            _node_id: &str,
            _now: u64,
        ) -> RegistryResult<Option<(DetachedNode, String)>> {
            Ok(None)
        }

        fn get(&self, _node_id: &str) -> RegistryResult<Option<NodeRecord>> {
            Ok(None)
        }

        fn list(&self) -> RegistryResult<Vec<NodeRecord>> {
            Ok(Vec::new())
        }

        fn update_activity(
            &self,
            node_id: &str,
            _busy_executors: u32,
            _pending_tasks: u32,
            _now: u64,
        ) -> RegistryResult<NodeRecord> {
            Err(RegistryError::NodeNotFound(node_id.to_string()))
        }

        fn evaluate_retention(
            &self,
            _now: u64,
        ) -> RegistryResult<Vec<(NodeRecord, RetentionDecision)>> {
            Ok(Vec::new())
        }

        fn record_leak(&self, leak: &LeakRecord) -> RegistryResult<()> {
            self.leaks.lock().unwrap().push(leak.clone());
            Ok(())
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn rejected_node_is_released() {
        let source = Arc::new(ScriptedSource::new("sim", vec![None], vec![1, 1]));
        let registry = Arc::new(BrokenRegistry::default());
        let board = DemandBoard::new();
        let events = EventLog::new(64);
        let mut provisioner = ProvisioningLoop::new(
            SourceSet::from_sources([source.clone() as Arc<dyn CapacitySource>]).unwrap(),
            registry.clone(),
            Arc::new(board.clone()),
            Arc::new(events.clone()),
        );
        board.set(None, 2);
        provisioner.tick().await;
        board.clear();

        let released = Arc::new(AtomicUsize::new(0));
        let mut completers = source.take_completers().into_iter();
        let (ok, _) = completers.next().unwrap();
        let counter = released.clone();
        ok.complete(source.node(1).with_release(FnRelease::new(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), ReleaseError>(())
        })))
        .unwrap();
        let (stuck, _) = completers.next().unwrap();
        stuck
            .complete(source.node(1).with_release(FnRelease::new(|| async {
                Err(ReleaseError::new("", "vm api unreachable"))
            })))
            .unwrap();

        let report = provisioner.tick().await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.registered, 0);
        assert_eq!(provisioner.ledger().outstanding(), 0);
        assert_eq!(
            count_events(&events, |e| matches!(e, ProvisionEvent::ProvisionFailed { .. })),
            2
        );

        wait_for(|| {
            released.load(Ordering::SeqCst) == 1 && registry.leaks.lock().unwrap().len() == 1
        })
        .await;
        let leaks = registry.leaks.lock().unwrap();
        assert!(leaks[0].node_id.starts_with("sim-"));
        assert_eq!(leaks[0].source, "sim");
        assert!(leaks[0].error.contains("vm api unreachable"));
    }

    #[tokio::test]
    async fn failing_source_isolated_and_retried_next_tick() {
        let flaky = Arc::new(ScriptedSource::new("flaky", vec![None], vec![1]).failing_first(1));
        let steady = Arc::new(ScriptedSource::new("steady", vec![None], vec![1]));
        let mut h = harness(vec![flaky.clone(), steady.clone()]);
        h.board.set(None, 2);

        let report = h.provisioner.tick().await;
        assert_eq!(report.source_failures, 1);
        assert_eq!(flaky.calls(), 1);
        assert_eq!(steady.calls(), 1);
        assert_eq!(h.provisioner.ledger().promised_for_label(None), 1);

        let report = h.provisioner.tick().await;
        assert_eq!(report.source_failures, 0);
        assert_eq!(flaky.calls(), 2);
        assert_eq!(h.provisioner.ledger().promised_for_label(None), 2);
        assert_eq!(
            count_events(&h.events, |e| matches!(e, ProvisionEvent::RequestFailed { .. })),
            1
        );
        assert_ledger_consistent(&h.provisioner);
    }

    #[tokio::test]
    async fn panicking_source_does_not_stop_the_tick() {
        let broken = Arc::new(ScriptedSource::new("broken", vec![None], vec![1]).panicking());
        let steady = Arc::new(ScriptedSource::new("steady", vec![None], vec![1]));
        let mut h = harness(vec![broken.clone(), steady.clone()]);
        h.board.set(None, 1);

        let report = h.provisioner.tick().await;
        assert_eq!(report.source_failures, 1);
        assert_eq!(steady.calls(), 1);
        assert_eq!(h.provisioner.ledger().promised_for_label(None), 1);
    }

    #[tokio::test]
    async fn failed_source_skipped_for_other_labels_in_same_tick() {
        let flaky = Arc::new(
            ScriptedSource::new("flaky", vec![None, gpu()], vec![1]).failing_first(1),
        );
        let mut h = harness(vec![flaky.clone()]);
        h.board.set(None, 1);
        h.board.set(gpu(), 1);

        h.provisioner.tick().await;
        assert_eq!(flaky.calls(), 1);

        h.provisioner.tick().await;
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn no_capable_source_reports_unmet_demand() {
        let source = Arc::new(ScriptedSource::new("gpu-only", vec![gpu()], vec![1]));
        let mut h = harness(vec![source.clone()]);
        h.board.set(None, 1);

        let report = h.provisioner.tick().await;

        assert_eq!(source.calls(), 0);
        assert_eq!(report.unmet, vec![None]);
        assert!(h.provisioner.ledger().entries().is_empty());
        assert_eq!(
            count_events(&h.events, |e| matches!(
                e,
                ProvisionEvent::DemandUnmet { label: None, excess: 1 }
            )),
            1
        );
    }

    #[tokio::test]
    async fn failed_completion_clears_ledger_and_rerequests() {
        let source = Arc::new(ScriptedSource::new("sim", vec![None], vec![1]));
        let mut h = harness(vec![source.clone()]);
        h.board.set(None, 1);

        h.provisioner.tick().await;
        assert_eq!(source.calls(), 1);

        source.fail_all();
        let report = h.provisioner.tick().await;

        assert_eq!(report.failed, 1);
        assert!(h.registry.list().unwrap().is_empty());
        assert_eq!(
            count_events(&h.events, |e| matches!(e, ProvisionEvent::ProvisionFailed { .. })),
            1
        );
        // Unchanged demand was re-requested once the failed promise cleared.
        assert_eq!(source.calls(), 2);
        assert_eq!(h.provisioner.ledger().promised_for_label(None), 1);
        assert_ledger_consistent(&h.provisioner);
    }

    #[tokio::test]
    async fn dropped_completer_counts_as_failure() {
        let source = Arc::new(ScriptedSource::new("sim", vec![None], vec![1]));
        let mut h = harness(vec![source.clone()]);
        h.board.set(None, 1);
        h.provisioner.tick().await;
        h.board.clear();

        drop(source.take_completers());
        let report = h.provisioner.tick().await;
        assert_eq!(report.failed, 1);
        assert_eq!(h.provisioner.ledger().outstanding(), 0);
    }

    #[tokio::test]
    async fn timed_out_capacity_is_discarded_when_it_lands() {
        let source = Arc::new(ScriptedSource::new("slow", vec![None], vec![1]));
        let mut h = harness(vec![source.clone()]);
        h.provisioner = h.provisioner.with_completion_timeout(Duration::ZERO);
        h.board.set(None, 1);
        h.provisioner.tick().await;
        h.board.clear();

        let report = h.provisioner.tick().await;
        assert_eq!(report.timed_out, 1);
        assert_eq!(h.provisioner.ledger().outstanding(), 0);

        let (released_tx, released_rx) = tokio::sync::oneshot::channel();
        let (completer, executors) = source.take_completers().pop().unwrap();
        let node = source.node(executors).with_release(FnRelease::new(move || async move {
            let _ = released_tx.send(());
            Ok::<(), ReleaseError>(())
        }));
        completer.complete(node).unwrap();

        let report = h.provisioner.tick().await;
        assert_eq!(report.late_discarded, 1);
        assert_eq!(report.registered, 0);
        assert!(h.registry.list().unwrap().is_empty());

        tokio::time::timeout(Duration::from_secs(1), released_rx)
            .await
            .expect("late node released")
            .unwrap();
    }

    #[tokio::test]
    async fn manual_provision_requires_grant() {
        let source = Arc::new(ScriptedSource::new("sim", vec![None], vec![1]));
        let mut h = harness(vec![source.clone()]);
        let mut grants = GrantTable::new();
        grants.grant("alice", "sim");
        h.provisioner = h
            .provisioner
            .with_access_guard(AccessGuard::new(Arc::new(grants)));

        let err = h
            .provisioner
            .provision_manually(&Actor::new("mallory"), "sim", None, 1)
            .unwrap_err();
        assert!(matches!(err, MutationError::PermissionDenied(_)));
        assert_eq!(source.calls(), 0);
        assert!(h.provisioner.ledger().entries().is_empty());

        let ids = h
            .provisioner
            .provision_manually(&Actor::new("alice"), "sim", None, 1)
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert!(h.provisioner.ledger().contains(ids[0]));
        assert_ledger_consistent(&h.provisioner);
    }

    #[tokio::test]
    async fn manual_provision_validates_request() {
        let source = Arc::new(ScriptedSource::new("sim", vec![None], vec![1]).failing_first(1));
        let mut h = harness(vec![source.clone()]);
        let actor = Actor::new("alice");

        assert!(matches!(
            h.provisioner.provision_manually(&actor, "nope", None, 1),
            Err(MutationError::UnknownSource(_))
        ));
        assert!(matches!(
            h.provisioner.provision_manually(&actor, "sim", None, 0),
            Err(MutationError::ZeroWorkload)
        ));
        assert!(matches!(
            h.provisioner.provision_manually(&actor, "sim", gpu(), 1),
            Err(MutationError::UnsupportedLabel { .. })
        ));
        assert!(matches!(
            h.provisioner.provision_manually(&actor, "sim", None, 1),
            Err(MutationError::Request(ProvisionRequestError::Unavailable(_)))
        ));
        assert!(h.provisioner.ledger().entries().is_empty());
    }

    #[tokio::test]
    async fn removed_source_outstanding_still_resolves() {
        let source = Arc::new(ScriptedSource::new("sim", vec![None], vec![1]));
        let mut h = harness(vec![source.clone()]);
        h.board.set(None, 1);
        h.provisioner.tick().await;
        h.board.clear();

        assert!(h.provisioner.remove_source("sim").is_some());
        source.complete_all();
        let report = h.provisioner.tick().await;
        assert_eq!(report.registered, 1);
        assert!(h.provisioner.sources().is_empty());
    }

    #[tokio::test]
    async fn run_ticks_until_shutdown() {
        let h = harness(Vec::new());
        let handle = h.provisioner.into_handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(handle.clone(), Duration::from_millis(5), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(handle.lock().await.ticks() > 0);
    }
}
