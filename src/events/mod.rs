//! Lifecycle event system
//!
//! Adapters and companion subsystems publish typed events through a shared
//! [`EventBus`]. Subscribers can take everything, a glob-matched subset
//! (`"ssh:*"`), or a subset further narrowed by attribute filters.

mod bus;
mod event;

pub use bus::{EventBus, EventFilter};
pub use event::{Event, EventPayload, PoolMetrics};
