//! # `RowDelta` Core
//!
//! Building blocks shared by the ledger, the state store and the merge
//! engine.
//!
//! This crate provides:
//! - **Values**: a tagged scalar [`Value`] and the [`Row`] image type
//! - **Fingerprints**: versioned SHA-256 row digests and column diffs
//! - **Tables**: [`TableSpec`] declarations of merge targets
//! - **Store**: the [`RelationalStore`] boundary and an in-memory implementation
//!
//! ## Example
//!
//! ```rust
//! use rowdelta_core::{fingerprint, row_of, Value};
//!
//! let a = row_of([("amt", Value::from(150)), ("note", Value::Null)]);
//! let b = row_of([("note", Value::from("")), ("amt", Value::from(150.0))]);
//! assert_eq!(fingerprint(&a, &["amt", "note"]), fingerprint(&b, &["note", "amt"]));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod fingerprint;
pub mod store;
pub mod table;
pub mod testing;
pub mod value;

// Re-export key types
pub use fingerprint::{diff_columns, fingerprint, FINGERPRINT_HEX_LEN, FINGERPRINT_VERSION};
pub use store::{InMemoryStore, RelationalStore, StoreError};
pub use table::{TableSpec, TableSpecError};
pub use value::{column_value, row_of, Row, Value};
