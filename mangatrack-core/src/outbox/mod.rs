//! Offline sync: the client-side intent log and the server-side reconciler
//! that replays it with last-writer-wins semantics.

pub mod action;
pub mod client;
pub mod reconciler;

pub use action::{
    ActionPayload, ChapterReadPayload, LibraryAddPayload, LibraryDeletePayload,
    LibraryUpdatePayload, OutboxAction, SettingUpdatePayload, push_deduped,
};
pub use client::{
    ActionResult, MemoryOutboxStorage, Outbox, OutboxStorage, ReplayStatus, ReplaySummary,
    ReplayTransport,
};
pub use reconciler::{PostgresReconcilerStore, Reconciler, ReconcilerStore};
