//! Per-source fetch orchestration: the periodic sweep, the source adapters,
//! and the workers that diff upstream listings against stored chapters.

pub mod adapter;
pub mod persistence;
pub mod schedule;
pub mod scheduler;
pub mod worker;

pub use adapter::{AdapterError, AdapterRegistry, HttpSourceAdapter, RemoteChapter, SourceAdapter};
pub use persistence::{DueSource, NewChapter, PostgresSyncStore, SyncOutcome, SyncRepository};
pub use schedule::SyncScheduleConfig;
pub use scheduler::{PeriodicSweep, SweepConfig, SweepLeadership};
pub use worker::{DispatchStatus, SyncWorker, SyncWorkerConfig};
