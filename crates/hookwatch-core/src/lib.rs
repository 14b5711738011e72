//! Core building blocks for monitoring agent instrumentation streams.
//!
//! This crate provides:
//! - `Event`, `Session` - Shared data contracts
//! - `ConnectionStatus` - Connection state published to consumers
//! - `EventBatcher` - Time-windowed, order-preserving batching
//! - `BoundedEventStore` - Capped newest-first history with FIFO eviction
//! - `RealtimeChannel` - Contract for live-subscription channels
//! - `Subscription` - Idempotent disposer returned by every subscribe call

pub mod batcher;
pub mod channel;
pub mod event;
pub mod event_store;
pub mod status;
pub mod subscription;

pub use batcher::{BatchMetrics, BatcherConfig, EventBatcher};
pub use channel::{ChannelStatus, RealtimeChannel, StatusCallback, SystemCallback, SystemMessage};
pub use event::{
    DateRange, Event, EventFilter, EventType, InvalidEvent, Session, SessionFilter, SessionStatus,
    SessionSummary,
};
pub use event_store::{BoundedEventStore, InsertOutcome, StoreUpdate};
pub use status::{ConnectionQuality, ConnectionState, ConnectionStatus};
pub use subscription::{SubscriberSet, Subscription};
