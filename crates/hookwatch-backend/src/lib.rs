//! Backend clients for the hookwatch monitor.
//!
//! Provides:
//! - `BackendClient` - the uniform async contract
//! - `LocalBackend` - self-hosted HTTP API plus JSON frame socket
//! - `ManagedBackend` - PostgREST queries plus a Phoenix realtime channel
//! - `BackendRegistry` - configuration-driven construction and memoization

pub mod config;
pub mod error;
pub mod factory;
mod http;
pub mod local;
pub mod managed;
pub mod protocol;
pub mod socket;
mod status;
pub mod traits;

pub use config::{
    BackendConfig, BackendMode, LocalSettings, ManagedSettings, ResolvedConfig, Tuning,
    TuningOverrides, ValidationReport, validate_backend_config,
};
pub use error::{BackendError, Result};
pub use factory::{BackendBuilder, BackendRegistry, CreatedBackend, build_backend};
pub use local::LocalBackend;
pub use managed::ManagedBackend;
pub use traits::{
    BackendClient, BackendMetadata, Capabilities, ConnectionInfo, EventListener, SessionListener,
    StatusListener,
};
