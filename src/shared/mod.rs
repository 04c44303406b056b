//! Shared data model and messaging
//!
//! Types exchanged between the detection workers, the collector, the
//! result cache and the storage layer.

pub mod messages;
pub mod types;

pub use messages::{ReportKind, WorkerReport};
pub use types::{
    match_rate, unix_now, BatchStats, Correction, DetectionRecord, Progress, ResultRecord,
    StoredResult, Task, TaskStatus, VerifyOutcome,
};
