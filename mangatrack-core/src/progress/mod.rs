//! Progress / read-state engine: atomic chapter progression, XP and levels,
//! seasonal buckets, terminal status rules, and anti-abuse soft signals.

pub mod achievements;
pub mod engine;
pub mod memory;
pub mod persistence;
pub mod status;
pub mod trust;
pub mod xp;

pub use engine::{ProgressCommand, ProgressEngine, ProgressOutcome, ProgressStore};
pub use memory::InMemoryProgressStore;
pub use persistence::PostgresProgressStore;
pub use status::{resolve_entry_update, IncomingEntryState, ResolvedEntryState, StoredEntryState};
pub use trust::{TrustConfig, ViolationKind};
