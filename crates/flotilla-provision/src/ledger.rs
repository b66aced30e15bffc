//! Provisioning ledger — executor capacity already promised by in-flight
//! planned capacity, per `(source, label)`.
//!
//! The loop consults the ledger before asking for more capacity so that a
//! label whose demand is already covered by outstanding requests is not
//! requested again. Entries are keyed by planned ID, which makes
//! resolution idempotent: resolving the same planned capacity twice
//! subtracts its promise once.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::label::{Label, SourceName};
use crate::planned::PlannedId;

type LedgerKey = (SourceName, Option<Label>);

/// Read-only view of one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub source: SourceName,
    pub label: Option<Label>,
    /// Sum of promised executors of unresolved planned capacity.
    pub promised_executors: u32,
    pub outstanding: usize,
}

#[derive(Debug, Default)]
pub struct ProvisioningLedger {
    /// Per-key promises, keyed by planned ID.
    entries: BTreeMap<LedgerKey, HashMap<PlannedId, u32>>,
    /// Reverse index from planned ID to its key.
    index: HashMap<PlannedId, LedgerKey>,
}

impl ProvisioningLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a promise. Recording the same planned ID again is ignored.
    pub fn record(
        &mut self,
        source: &SourceName,
        label: Option<&Label>,
        planned: PlannedId,
        executors: u32,
    ) {
        if self.index.contains_key(&planned) {
            return;
        }
        let key = (source.clone(), label.cloned());
        self.entries
            .entry(key.clone())
            .or_default()
            .insert(planned, executors);
        self.index.insert(planned, key);
    }

    /// Clear the promise of a resolved planned capacity.
    ///
    /// Returns the executors that were released, or `None` if the planned
    /// ID was not (or no longer) tracked.
    pub fn resolve(&mut self, planned: PlannedId) -> Option<u32> {
        let key = self.index.remove(&planned)?;
        let promises = self.entries.get_mut(&key)?;
        let executors = promises.remove(&planned);
        if promises.is_empty() {
            self.entries.remove(&key);
        }
        executors
    }

    /// Executors promised for `(source, label)`.
    pub fn promised(&self, source: &SourceName, label: Option<&Label>) -> u32 {
        self.entries
            .get(&(source.clone(), label.cloned()))
            .map_or(0, |p| p.values().sum())
    }

    /// Executors promised for `label` across all sources.
    pub fn promised_for_label(&self, label: Option<&Label>) -> u32 {
        self.entries
            .iter()
            .filter(|((_, l), _)| l.as_ref() == label)
            .map(|(_, p)| p.values().sum::<u32>())
            .sum()
    }

    /// Number of unresolved planned capacities tracked.
    pub fn outstanding(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, planned: PlannedId) -> bool {
        self.index.contains_key(&planned)
    }

    /// All non-empty entries, ordered by source then label.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries
            .iter()
            .map(|((source, label), promises)| LedgerEntry {
                source: source.clone(),
                label: label.clone(),
                promised_executors: promises.values().sum(),
                outstanding: promises.len(),
            })
            .collect()
    }
}
