//! flotilla-retention — decides when provisioned nodes go away.
//!
//! Every registered node carries a `RetentionPolicy`. The `Reaper`
//! periodically asks each policy for a decision and removes nodes in two
//! phases:
//!
//! ```text
//! Reaper::sweep
//!   ├── registry.evaluate_retention(now)
//!   └── for each Remove decision:
//!         1. registry.detach(id)     node leaves scheduling immediately
//!         2. spawn release future    failure → LeakRecord + Leaked event
//! ```
//!
//! A failed release never puts the node back; the leaked resource is
//! recorded in the state store for an operator to clean up.

pub mod policy;
pub mod reaper;

pub use policy::{Always, IdleTimeout, SingleUse};
pub use reaper::{Reaper, SweepReport};
