//! Self-hosted backend: HTTP API plus a JSON frame socket.

use std::{
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::SecondsFormat;
use hookwatch_core::{
    ChannelStatus, ConnectionState, Event, EventFilter, RealtimeChannel, Session, SessionFilter,
    SessionSummary, StatusCallback, SubscriberSet, Subscription, SystemCallback, SystemMessage,
};
use reqwest::{Url, header::HeaderMap};
use serde::Deserialize;
use tokio::runtime::Handle;

use crate::{
    config::{BackendMode, LocalSettings, endpoint},
    error::Result,
    http::HttpClient,
    protocol::SocketFrame,
    socket::{SocketConnection, redacted},
    status::ClientStatus,
    traits::{
        BackendClient, BackendMetadata, Capabilities, ConnectionInfo, EventListener,
        SessionListener, StatusListener,
    },
};

/// Topic reported by the self-hosted socket channel.
pub const SOCKET_TOPIC: &str = "local:socket";

/// List endpoints answer either with a bare array or a keyed object.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Bare(Vec<T>),
    Events { events: Vec<T> },
    Sessions { sessions: Vec<T> },
    Summaries { summaries: Vec<T> },
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Bare(items)
            | Self::Events { events: items }
            | Self::Sessions { sessions: items }
            | Self::Summaries { summaries: items } => items,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct HealthBody {
    #[serde(default)]
    version: Option<String>,
}

/// Query string for `GET /api/events`.
pub(crate) fn event_query(filter: &EventFilter) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(limit) = filter.limit {
        query.push(("limit", limit.to_string()));
    }
    if let Some(offset) = filter.offset {
        query.push(("offset", offset.to_string()));
    }
    if !filter.session_ids.is_empty() {
        query.push(("session_ids", filter.session_ids.join(",")));
    }
    if !filter.event_types.is_empty() {
        let types: Vec<&str> = filter.event_types.iter().map(|t| t.as_str()).collect();
        query.push(("event_types", types.join(",")));
    }
    if let Some(search) = filter.search() {
        query.push(("search", search.to_string()));
    }
    if let Some(range) = filter.date_range {
        query.push((
            "start_date",
            range.start.to_rfc3339_opts(SecondsFormat::Millis, true),
        ));
        query.push((
            "end_date",
            range.end.to_rfc3339_opts(SecondsFormat::Millis, true),
        ));
    }
    query
}

/// Query string for `GET /api/sessions`.
pub(crate) fn session_query(filter: &SessionFilter) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(minutes) = filter.time_range_minutes {
        query.push(("time_range_minutes", minutes.to_string()));
    }
    query.push(("include_ended", filter.include_ended.to_string()));
    query
}

/// Route one socket frame to the matching subscriber set.
fn route_frame(text: &str, events: &SubscriberSet<Event>, sessions: &SubscriberSet<Session>) {
    match SocketFrame::parse(text) {
        Ok(SocketFrame::Event { data }) => match data.validate() {
            Ok(()) => {
                events.notify(&data);
            }
            Err(e) => tracing::warn!("dropped event frame: {e}"),
        },
        Ok(SocketFrame::Session { data }) => {
            sessions.notify(&data);
        }
        Ok(SocketFrame::Error { error }) => {
            tracing::warn!(%error, "server reported an error");
        }
        Err(rejection) => tracing::warn!("dropped socket frame: {rejection}"),
    }
}

/// The self-hosted live socket, exposed as a realtime channel.
pub struct LocalSocket {
    this: Weak<Self>,
    url: Url,
    timeout: Duration,
    client_status: Arc<ClientStatus>,
    events: SubscriberSet<Event>,
    sessions: SubscriberSet<Session>,
    system: SubscriberSet<SystemMessage>,
    connection: Mutex<Option<SocketConnection>>,
    status_callback: Mutex<Option<StatusCallback>>,
    generation: AtomicU64,
    gate: tokio::sync::Mutex<()>,
}

impl LocalSocket {
    fn new(
        url: Url,
        timeout: Duration,
        client_status: Arc<ClientStatus>,
        events: SubscriberSet<Event>,
        sessions: SubscriberSet<Session>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            url,
            timeout,
            client_status,
            events,
            sessions,
            system: SubscriberSet::new(),
            connection: Mutex::new(None),
            status_callback: Mutex::new(None),
            generation: AtomicU64::new(0),
            gate: tokio::sync::Mutex::new(()),
        })
    }

    fn is_open(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(SocketConnection::is_open)
    }

    fn report(&self, status: ChannelStatus, message: Option<&str>) {
        let callback = self
            .status_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(status, message);
        }
    }

    /// Open the socket unless it is already open.
    async fn open(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        if self.is_open() {
            return Ok(());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.client_status.set(ConnectionState::Connecting);

        let events = self.events.clone();
        let sessions = self.sessions.clone();
        let on_text = move |text: &str| route_frame(text, &events, &sessions);
        let weak = self.this.clone();
        let on_closed = move |reason: Option<String>| {
            if let Some(socket) = weak.upgrade() {
                socket.handle_closed(generation, reason);
            }
        };

        match SocketConnection::open(&self.url, self.timeout, on_text, on_closed).await {
            Ok(connection) => {
                *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = Some(connection);
                self.client_status.set(ConnectionState::Connected);
                tracing::info!(url = %redacted(&self.url), "live socket open");
                Ok(())
            }
            Err(e) => {
                self.client_status.set(ConnectionState::Error);
                tracing::warn!(url = %redacted(&self.url), "live socket failed: {e}");
                Err(e)
            }
        }
    }

    fn handle_closed(&self, generation: u64, reason: Option<String>) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let finished = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(finished);

        self.client_status.set(ConnectionState::Disconnected);
        let message = reason.map_or_else(
            || "socket closed".to_string(),
            |r| format!("socket closed: {r}"),
        );
        tracing::warn!(url = %redacted(&self.url), "{message}");
        self.report(ChannelStatus::ChannelError, Some(&message));
    }

    fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            connection.close();
            tracing::info!(url = %redacted(&self.url), "live socket closed");
        }
    }
}

impl RealtimeChannel for LocalSocket {
    fn topic(&self) -> &str {
        SOCKET_TOPIC
    }

    fn on_system(&self, callback: SystemCallback) -> Subscription {
        self.system.subscribe(move |msg| callback(msg))
    }

    fn subscribe(&self, callback: StatusCallback) {
        *self
            .status_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);

        let Some(this) = self.this.upgrade() else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            tracing::warn!("no runtime available to open the live socket");
            return;
        };
        handle.spawn(async move {
            match this.open().await {
                Ok(()) => this.report(ChannelStatus::Subscribed, None),
                Err(e) => this.report(ChannelStatus::ChannelError, Some(&e.to_string())),
            }
        });
    }

    fn unsubscribe(&self) {
        self.status_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.close();
        self.client_status.set(ConnectionState::Disconnected);
    }
}

/// Client for the self-hosted monitoring server.
pub struct LocalBackend {
    settings: LocalSettings,
    http: HttpClient,
    status: Arc<ClientStatus>,
    events: SubscriberSet<Event>,
    sessions: SubscriberSet<Session>,
    socket: Arc<LocalSocket>,
}

impl LocalBackend {
    /// Create a client. No I/O happens until `connect`.
    ///
    /// # Errors
    /// Returns a validation error if the HTTP client cannot be built.
    pub fn new(settings: LocalSettings) -> Result<Self> {
        let http = HttpClient::new(settings.tuning.timeout, HeaderMap::new())?;
        let status = Arc::new(ClientStatus::new());
        let events = SubscriberSet::new();
        let sessions = SubscriberSet::new();
        let socket = LocalSocket::new(
            settings.socket_url.clone(),
            settings.tuning.timeout,
            Arc::clone(&status),
            events.clone(),
            sessions.clone(),
        );
        Ok(Self {
            settings,
            http,
            status,
            events,
            sessions,
            socket,
        })
    }

    fn url(&self, path: &str) -> String {
        endpoint(&self.settings.server_url, path)
    }
}

#[async_trait]
impl BackendClient for LocalBackend {
    fn kind(&self) -> BackendMode {
        BackendMode::Local
    }

    async fn connect(&self) -> Result<()> {
        let _gate = self.status.connect_gate.lock().await;
        if self.status.get() == ConnectionState::Connected && self.socket.is_open() {
            return Ok(());
        }

        self.status.set(ConnectionState::Connecting);
        if let Err(e) = self.http.probe(&self.url("/health")).await {
            self.status.set(ConnectionState::Error);
            return Err(e);
        }
        self.socket.open().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.socket.close();
        self.status.set(ConnectionState::Disconnected);
        Ok(())
    }

    fn connection_status(&self) -> ConnectionState {
        self.status.get()
    }

    fn on_connection_status_change(&self, listener: StatusListener) -> Subscription {
        self.status.subscribe(listener)
    }

    async fn get_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let listing: Listing<Event> = self
            .http
            .get_json(&self.url("/api/events"), &event_query(filter))
            .await?;
        Ok(listing.into_vec())
    }

    async fn get_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let listing: Listing<Session> = self
            .http
            .get_json(&self.url("/api/sessions"), &session_query(filter))
            .await?;
        Ok(listing.into_vec())
    }

    async fn get_session_summaries(&self, session_ids: &[String]) -> Result<Vec<SessionSummary>> {
        if session_ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "session_ids": session_ids });
        let listing: Listing<SessionSummary> = self
            .http
            .post_json(&self.url("/api/sessions/summaries"), &body)
            .await?;
        Ok(listing.into_vec())
    }

    fn subscribe_to_events(&self, listener: EventListener) -> Subscription {
        self.events.subscribe(move |event| listener(event))
    }

    fn subscribe_to_sessions(&self, listener: SessionListener) -> Subscription {
        self.sessions.subscribe(move |session| listener(session))
    }

    async fn health_check(&self) -> bool {
        match self.http.probe(&self.url("/health")).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("health check failed: {e}");
                false
            }
        }
    }

    async fn get_metadata(&self) -> BackendMetadata {
        let endpoint = self.settings.server_url.to_string();
        match self.http.probe(&self.url("/health")).await {
            Ok(response) => {
                let body: HealthBody = response.json().await.unwrap_or_default();
                BackendMetadata {
                    kind: BackendMode::Local,
                    version: body.version.unwrap_or_else(|| "unknown".to_string()),
                    capabilities: Capabilities {
                        realtime: true,
                        sockets: true,
                        analytics: true,
                        export: true,
                    },
                    connection_info: ConnectionInfo {
                        endpoint,
                        realtime_endpoint: Some(self.settings.socket_url.to_string()),
                        reachable: true,
                        status: self.status.get(),
                    },
                }
            }
            Err(e) => {
                tracing::warn!("backend metadata unavailable: {e}");
                BackendMetadata::degraded(BackendMode::Local, endpoint, self.status.get())
            }
        }
    }

    fn live_channel(&self) -> Arc<dyn RealtimeChannel> {
        Arc::clone(&self.socket) as Arc<dyn RealtimeChannel>
    }
}
