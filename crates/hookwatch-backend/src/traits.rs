//! The uniform backend contract.

use std::sync::Arc;

use async_trait::async_trait;
use hookwatch_core::{
    ConnectionState, Event, EventFilter, RealtimeChannel, Session, SessionFilter, SessionSummary,
    Subscription,
};
use serde::Serialize;

use crate::{config::BackendMode, error::Result};

/// Connection status listener.
pub type StatusListener = Box<dyn Fn(ConnectionState) + Send + Sync>;
/// Live event listener.
pub type EventListener = Box<dyn Fn(&Event) + Send + Sync>;
/// Live session listener.
pub type SessionListener = Box<dyn Fn(&Session) + Send + Sync>;

/// Feature flags advertised by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub realtime: bool,
    pub sockets: bool,
    pub analytics: bool,
    pub export: bool,
}

/// Where the backend lives and whether it answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub endpoint: String,
    pub realtime_endpoint: Option<String>,
    pub reachable: bool,
    pub status: ConnectionState,
}

/// Backend self-description for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendMetadata {
    pub kind: BackendMode,
    pub version: String,
    pub capabilities: Capabilities,
    pub connection_info: ConnectionInfo,
}

impl BackendMetadata {
    /// Metadata reported when the backend cannot be reached.
    #[must_use]
    pub fn degraded(kind: BackendMode, endpoint: impl Into<String>, status: ConnectionState) -> Self {
        Self {
            kind,
            version: "unknown".to_string(),
            capabilities: Capabilities::default(),
            connection_info: ConnectionInfo {
                endpoint: endpoint.into(),
                realtime_endpoint: None,
                reachable: false,
                status,
            },
        }
    }
}

/// Trait implemented by every backend transport.
///
/// Consumers hold an `Arc<dyn BackendClient>` and never branch on the
/// concrete implementation.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> BackendMode;

    /// Establish the transport. Concurrent callers share one handshake.
    async fn connect(&self) -> Result<()>;

    /// Tear down the transport. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Current transport state.
    fn connection_status(&self) -> ConnectionState;

    /// Called on every state transition.
    fn on_connection_status_change(&self, listener: StatusListener) -> Subscription;

    /// Historical events, newest first.
    async fn get_events(&self, filter: &EventFilter) -> Result<Vec<Event>>;

    /// Sessions, most recently started first.
    async fn get_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>>;

    /// Per-session aggregates. An empty id list performs no I/O.
    async fn get_session_summaries(&self, session_ids: &[String]) -> Result<Vec<SessionSummary>>;

    /// Called once per live event.
    fn subscribe_to_events(&self, listener: EventListener) -> Subscription;

    /// Called once per live session update.
    fn subscribe_to_sessions(&self, listener: SessionListener) -> Subscription;

    /// Cheap reachability probe. Never fails; errors map to `false`.
    async fn health_check(&self) -> bool;

    /// Self-description. Falls back to degraded metadata instead of failing.
    async fn get_metadata(&self) -> BackendMetadata;

    /// The channel carrying live data, for the connection manager to keep
    /// alive.
    fn live_channel(&self) -> Arc<dyn RealtimeChannel>;
}
