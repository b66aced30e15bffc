//! Access guard for provisioning mutations.
//!
//! Manual provisioning and manual node removal are checked against a single
//! permission scoped to the capacity source involved: an actor either may
//! mutate a source or may not. Reads and the automatic loop are never
//! checked.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PermissionDeniedError;
use crate::label::SourceName;

/// The identity on whose behalf a mutation is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
}

impl Actor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Mutations covered by the provision permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Provision,
    Remove,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Provision => f.write_str("provision"),
            Action::Remove => f.write_str("remove"),
        }
    }
}

/// Pure authorization decision.
pub trait Authorizer: Send + Sync {
    fn permits(&self, actor: &Actor, action: Action, source: &SourceName) -> bool;
}

/// Sources an actor is granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    All,
    Sources(HashSet<String>),
}

/// Static actor → grant table, usually loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct GrantTable {
    grants: HashMap<String, Grant>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `actor → [source names]`; `"*"` grants every source.
    pub fn from_config(config: &HashMap<String, Vec<String>>) -> Self {
        let mut table = Self::new();
        for (actor, sources) in config {
            if sources.iter().any(|s| s == "*") {
                table.grant_all(actor);
            } else {
                for source in sources {
                    table.grant(actor, source);
                }
            }
        }
        table
    }

    pub fn grant_all(&mut self, actor: &str) -> &mut Self {
        self.grants.insert(actor.to_string(), Grant::All);
        self
    }

    pub fn grant(&mut self, actor: &str, source: &str) -> &mut Self {
        let grant = self
            .grants
            .entry(actor.to_string())
            .or_insert_with(|| Grant::Sources(HashSet::new()));
        if let Grant::Sources(sources) = grant {
            sources.insert(source.to_string());
        }
        self
    }
}

impl Authorizer for GrantTable {
    fn permits(&self, actor: &Actor, _action: Action, source: &SourceName) -> bool {
        match self.grants.get(&actor.name) {
            Some(Grant::All) => true,
            Some(Grant::Sources(sources)) => sources.contains(source.as_str()),
            None => false,
        }
    }
}

struct AllowAll;

impl Authorizer for AllowAll {
    fn permits(&self, _actor: &Actor, _action: Action, _source: &SourceName) -> bool {
        true
    }
}

/// Gate called at every mutation entry point.
#[derive(Clone)]
pub struct AccessGuard {
    authorizer: Arc<dyn Authorizer>,
}

impl AccessGuard {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }

    /// Guard that permits everything (single-user setups and tests).
    pub fn allow_all() -> Self {
        Self::new(Arc::new(AllowAll))
    }

    pub fn check(
        &self,
        actor: &Actor,
        action: Action,
        source: &SourceName,
    ) -> Result<(), PermissionDeniedError> {
        if self.authorizer.permits(actor, action, source) {
            return Ok(());
        }
        warn!(%actor, %action, %source, "permission denied");
        Err(PermissionDeniedError {
            actor: actor.name.clone(),
            action,
            source_name: source.to_string(),
        })
    }
}

impl Default for AccessGuard {
    fn default() -> Self {
        Self::allow_all()
    }
}
