//! # `RowDelta` Storage
//!
//! Durability layer for `RowDelta`: the append-only change ledger and the
//! versioned state history.
//!
//! Both concerns are traits ([`ChangeLedger`], [`StateStore`]) with an
//! in-memory implementation for tests and embedding, and a filesystem
//! implementation that writes JSON documents atomically.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod id;
mod io;

/// Change ledger - change events and append-only row changes
pub mod ledger;

/// State history - immutable state images and the HEAD pointer
pub mod state;

// Re-export key types
pub use ledger::{
    BeginEvent, ChangeCounts, ChangeEvent, ChangeEventId, ChangeLedger, EventStatus,
    FileSystemLedger, InMemoryLedger, LedgerError, RowChange, RowOp,
};
pub use state::{
    FileSystemStateStore, HeadPointer, InMemoryStateStore, StateError, StateImage, StateImageId,
    StateStore,
};
