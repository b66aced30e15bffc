//! redb table definitions for the Flotilla state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Registered node records keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Leaked-resource records keyed by `{node_id}`.
pub const LEAKS: TableDefinition<&str, &[u8]> = TableDefinition::new("leaks");
