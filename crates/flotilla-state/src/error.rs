//! Errors raised by the node and leak tables.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The database file could not be created or opened.
    #[error("cannot open state database: {0}")]
    Open(String),

    /// A redb transaction failed to begin or commit. A failed commit
    /// leaves the node and leak tables unchanged.
    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("state table unavailable: {0}")]
    Table(String),

    /// Reading, inserting or removing a key failed.
    #[error("state storage error: {0}")]
    Storage(String),

    /// A node or leak record could not be encoded to, or decoded from, JSON.
    #[error("malformed state record: {0}")]
    Record(String),
}
