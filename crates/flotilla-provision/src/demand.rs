//! Demand signal consumed by the provisioning loop.
//!
//! Demand is produced outside Flotilla (the job scheduler knows how many
//! executors each label is short of). The loop samples a `DemandSignal`
//! once per tick.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::label::Label;

/// Unmet executor demand for one label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demand {
    pub label: Option<Label>,
    /// Executors needed beyond what the cluster can currently run.
    pub excess: u32,
}

impl Demand {
    pub fn new(label: Option<Label>, excess: u32) -> Self {
        Self { label, excess }
    }
}

/// Source of per-label demand, sampled once per tick.
pub trait DemandSignal: Send + Sync {
    fn sample(&self) -> Vec<Demand>;
}

/// Shared, externally updated demand table.
///
/// The job scheduler (or the REST API on its behalf) sets the current
/// excess per label; the loop reads it. Setting 0 clears the label.
#[derive(Clone, Default)]
pub struct DemandBoard {
    demand: Arc<RwLock<BTreeMap<Option<Label>, u32>>>,
}

impl DemandBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, label: Option<Label>, excess: u32) {
        let mut demand = self.demand.write().unwrap_or_else(|e| e.into_inner());
        if excess == 0 {
            demand.remove(&label);
        } else {
            demand.insert(label, excess);
        }
    }

    pub fn clear(&self) {
        self.demand
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl DemandSignal for DemandBoard {
    fn sample(&self) -> Vec<Demand> {
        self.demand
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(label, excess)| Demand::new(label.clone(), *excess))
            .collect()
    }
}

/// Exponential moving average over another demand signal.
///
/// Damps a noisy load signal so that short spikes do not trigger
/// provisioning:
///
/// ```text
/// smoothed = decay * previous + (1 - decay) * sample
/// excess   = round(smoothed)
/// ```
///
/// A decay of 0 passes the signal through unchanged.
pub struct SmoothedDemand<S> {
    inner: S,
    decay: f64,
    averages: Mutex<BTreeMap<Option<Label>, f64>>,
}

impl<S: DemandSignal> SmoothedDemand<S> {
    /// Wrap `inner`. `decay` is clamped to `[0, 0.99]`.
    pub fn new(inner: S, decay: f64) -> Self {
        Self {
            inner,
            decay: decay.clamp(0.0, 0.99),
            averages: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<S: DemandSignal> DemandSignal for SmoothedDemand<S> {
    fn sample(&self) -> Vec<Demand> {
        let raw: BTreeMap<Option<Label>, u32> = self
            .inner
            .sample()
            .into_iter()
            .map(|d| (d.label, d.excess))
            .collect();

        let mut averages = self.averages.lock().unwrap_or_else(|e| e.into_inner());
        for label in raw.keys() {
            averages.entry(label.clone()).or_insert(0.0);
        }

        let mut out = Vec::new();
        averages.retain(|label, avg| {
            let sample = raw.get(label).copied().unwrap_or(0) as f64;
            *avg = self.decay * *avg + (1.0 - self.decay) * sample;
            let excess = avg.round() as u32;
            if excess > 0 {
                out.push(Demand::new(label.clone(), excess));
            }
            // Forget labels whose average has decayed away.
            *avg >= 0.01
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu() -> Option<Label> {
        Some(Label::new("gpu").unwrap())
    }

    #[test]
    fn board_set_and_clear() {
        let board = DemandBoard::new();
        board.set(gpu(), 3);
        board.set(None, 1);

        let mut sampled = board.sample();
        sampled.sort_by(|a, b| a.label.cmp(&b.label));
        assert_eq!(sampled, vec![Demand::new(None, 1), Demand::new(gpu(), 3)]);

        board.set(gpu(), 0);
        assert_eq!(board.sample(), vec![Demand::new(None, 1)]);

        board.clear();
        assert!(board.sample().is_empty());
    }

    #[test]
    fn zero_decay_passes_through() {
        let board = DemandBoard::new();
        board.set(gpu(), 5);
        let smoothed = SmoothedDemand::new(board, 0.0);
        assert_eq!(smoothed.sample(), vec![Demand::new(gpu(), 5)]);
    }

    #[test]
    fn spike_is_damped() {
        let board = DemandBoard::new();
        board.set(gpu(), 10);
        let smoothed = SmoothedDemand::new(board.clone(), 0.9);

        // First sample: 0.9 * 0 + 0.1 * 10 = 1.
        assert_eq!(smoothed.sample(), vec![Demand::new(gpu(), 1)]);

        // Spike disappears: 0.9 * 1 = 0.9, rounds to 1.
        board.clear();
        assert_eq!(smoothed.sample(), vec![Demand::new(gpu(), 1)]);
        // 0.81, 0.729, ... eventually below 0.5.
        let mut rounds = 0;
        while !smoothed.sample().is_empty() {
            rounds += 1;
            assert!(rounds < 20);
        }
    }

    #[test]
    fn sustained_demand_converges() {
        let board = DemandBoard::new();
        board.set(None, 4);
        let smoothed = SmoothedDemand::new(board, 0.5);

        let mut last = Vec::new();
        for _ in 0..10 {
            last = smoothed.sample();
        }
        assert_eq!(last, vec![Demand::new(None, 4)]);
    }
}
