//! Upsert/merge engine and its result types.

mod engine;
mod summary;

pub use engine::{MergeEngine, MergeProgress, ProgressFn};
pub use summary::{
    ColumnChangeSummary, ConflictRow, DiffSummary, MergeOutcome, MergeStats, RejectReason,
    RejectedRow,
};
