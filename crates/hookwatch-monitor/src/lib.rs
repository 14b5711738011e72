//! Live monitoring on top of a hookwatch backend.
//!
//! Provides:
//! - `ConnectionManager` - health checks, reconnect backoff and channel tracking
//! - `Monitor` - wires backend events through the batcher into the bounded store

pub mod connection;
pub mod monitor;

pub use connection::{
    BackendProbe, ConnectionManager, ConnectionManagerConfig, HealthProbe, backoff_delay,
    classify_failure,
};
pub use monitor::{Monitor, MonitorConfig};
