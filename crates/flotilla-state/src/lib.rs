//! flotilla-state — embedded state store for Flotilla.
//!
//! Backed by [redb](https://docs.rs/redb), persists the records of nodes
//! that were provisioned into the cluster and of external resources whose
//! release failed.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by node ID. Registration uses a single write transaction that
//! checks for an existing key before inserting, so duplicate identities
//! are rejected atomically.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
