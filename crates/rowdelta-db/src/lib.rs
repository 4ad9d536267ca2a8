//! Unified facade for `RowDelta`.
//!
//! Provides a single entry point ([`RowDelta`]) that ties together the
//! change-detecting merge engine, the change ledger, the state history and
//! the rollback controller.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rowdelta_core::{row_of, InMemoryStore, TableSpec, Value};
//! use rowdelta_db::{IngestRequest, RowDelta};
//!
//! let store = Arc::new(InMemoryStore::new());
//! store.create_table("orders", "pk").unwrap();
//! let db = RowDelta::open(store).unwrap();
//!
//! let orders = TableSpec::new("orders", "pk").with_business_columns(["amt"]);
//! let rows = vec![row_of([("pk", Value::from(1)), ("amt", Value::from(100))])];
//! let report = db
//!     .ingest(IngestRequest::new("etl").with_table(orders, rows))
//!     .unwrap();
//! assert_eq!(report.totals.inserted, 1);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod audit;
mod builder;
mod config;
mod db;
mod error;
mod ingest;
pub mod merge;
mod rollback;

pub use audit::{AuditLog, ColumnDiff, ConflictRecord};
pub use builder::RowDeltaBuilder;
pub use config::{MergeOptions, RowDeltaConfig};
pub use db::RowDelta;
pub use error::DbError;
pub use ingest::{IngestReport, IngestRequest, TableBatch, TableReport, INGEST_SOURCE};
pub use merge::{DiffSummary, MergeEngine, MergeOutcome, MergeProgress, MergeStats};
pub use rollback::{
    RollbackController, RollbackOutcome, RollbackStatus, RollbackToSummary, ROLLBACK_SOURCE,
};
