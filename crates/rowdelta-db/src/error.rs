//! Error types for the `RowDelta` facade.

use rowdelta_storage::ChangeEventId;

/// Errors from database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Relational store error (fetch or batch write failed)
    #[error("Store error: {0}")]
    Store(#[from] rowdelta_core::StoreError),

    /// Change ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] rowdelta_storage::LedgerError),

    /// State history error
    #[error("State error: {0}")]
    State(#[from] rowdelta_storage::StateError),

    /// Invalid table declaration
    #[error("Invalid table: {0}")]
    InvalidTable(#[from] rowdelta_core::TableSpecError),

    /// Change event not found
    #[error("Change event {0} not found")]
    EventNotFound(ChangeEventId),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}
