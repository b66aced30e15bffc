//! Capacity sources — the provider contract driven by the loop.
//!
//! One implementation per backend (cloud API, VM launcher, simulator).
//! Sources are registered in a `SourceSet` that keeps configuration order,
//! which is also the order the loop asks them for capacity.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::{ConfigError, ProvisionRequestError};
use crate::label::{Label, SourceName};
use crate::planned::PlannedCapacity;

/// A named provider of compute capacity.
pub trait CapacitySource: Send + Sync {
    /// Unique name of this source.
    fn name(&self) -> &SourceName;

    /// Human-readable name for status output.
    fn display_name(&self) -> String {
        self.name().to_string()
    }

    /// Path of this source relative to the API root.
    fn url(&self) -> String {
        format!("cloud/{}", self.name())
    }

    /// True if this source can create nodes carrying `label`.
    ///
    /// Must be side-effect free: it is called every tick for every active
    /// label.
    fn can_provision(&self, label: Option<&Label>) -> bool;

    /// Start creating nodes for `excess_workload` executors of `label`.
    ///
    /// `excess_workload` is at least 1. The call must return promptly:
    /// creation itself continues in the background and is reported through
    /// the returned planned capacity. An empty list means the source
    /// declined.
    fn provision(
        &self,
        label: Option<&Label>,
        excess_workload: u32,
    ) -> Result<Vec<PlannedCapacity>, ProvisionRequestError>;
}

/// Call `can_provision`, turning a panic into a request error.
pub fn guarded_can_provision(
    source: &dyn CapacitySource,
    label: Option<&Label>,
) -> Result<bool, ProvisionRequestError> {
    catch_unwind(AssertUnwindSafe(|| source.can_provision(label))).map_err(panic_error)
}

/// Call `provision`, turning a panic into a request error.
pub fn guarded_provision(
    source: &dyn CapacitySource,
    label: Option<&Label>,
    excess_workload: u32,
) -> Result<Vec<PlannedCapacity>, ProvisionRequestError> {
    catch_unwind(AssertUnwindSafe(|| source.provision(label, excess_workload)))
        .map_err(panic_error)?
}

fn panic_error(payload: Box<dyn Any + Send>) -> ProvisionRequestError {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    ProvisionRequestError::Panicked(msg)
}

/// Ordered set of capacity sources with unique names.
#[derive(Clone, Default)]
pub struct SourceSet {
    sources: Vec<Arc<dyn CapacitySource>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from sources in configuration order.
    pub fn from_sources(
        sources: impl IntoIterator<Item = Arc<dyn CapacitySource>>,
    ) -> Result<Self, ConfigError> {
        let mut set = Self::new();
        for source in sources {
            set.insert(source)?;
        }
        Ok(set)
    }

    /// Append a source. Fails if the name is already taken.
    pub fn insert(&mut self, source: Arc<dyn CapacitySource>) -> Result<(), ConfigError> {
        if self.get(source.name().as_str()).is_some() {
            return Err(ConfigError::DuplicateSource(source.name().to_string()));
        }
        self.sources.push(source);
        Ok(())
    }

    /// Remove a source by name, returning it.
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn CapacitySource>> {
        let idx = self.sources.iter().position(|s| s.name().as_str() == name)?;
        Some(self.sources.remove(idx))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CapacitySource>> {
        self.sources.iter().find(|s| s.name().as_str() == name)
    }

    /// Sources in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CapacitySource>> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
