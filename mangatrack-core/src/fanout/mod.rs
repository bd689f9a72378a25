//! Fan-out notification pipeline: one `chapter_detected` event becomes
//! at-most-one notification per subscribed user, with burst coalescing and
//! load shedding.

pub mod health;
pub mod persistence;
pub mod pipeline;

pub use health::{HealthThresholds, NotificationHealth};
pub use persistence::{FanoutRepository, PostgresFanoutStore, Subscriber};
pub use pipeline::{
    CoalesceSlot, DeliveryWorker, FanoutConfig, FanoutOutcome, FanoutPipeline, FanoutWorker,
    MemoryCoalesceSlot, RedisCoalesceSlot,
};
