//! Phoenix-protocol realtime channel for the managed backend.
//!
//! One socket carries one channel joined to row changes on the `events` and
//! `sessions` tables. The socket URL embeds the API key; it is only ever
//! logged as its host or in redacted form.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use hookwatch_core::{
    ChannelStatus, ConnectionState, Event, RealtimeChannel, Session, StatusCallback,
    SubscriberSet, Subscription, SystemCallback, SystemMessage,
};
use reqwest::Url;
use serde_json::json;
use tokio::{runtime::Handle, sync::oneshot, task::JoinHandle};

use crate::{
    error::{BackendError, Result},
    protocol::{
        PHX_CLOSE, PHX_ERROR, PHX_LEAVE, PHX_REPLY, POSTGRES_CHANGES, PhoenixMessage, SYSTEM,
    },
    socket::SocketConnection,
    status::ClientStatus,
};

/// Interval between `heartbeat` messages on the `phoenix` topic.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
/// Topic joined by the managed channel.
pub const REALTIME_TOPIC: &str = "realtime:public";
pub const EVENTS_TABLE: &str = "events";
pub const SESSIONS_TABLE: &str = "sessions";

type JoinOutcome = std::result::Result<(), String>;

#[derive(Default)]
struct Link {
    connection: Option<SocketConnection>,
    heartbeat: Option<JoinHandle<()>>,
    join_ref: Option<String>,
    pending_join: Option<oneshot::Sender<JoinOutcome>>,
}

/// Realtime channel over the managed service's Phoenix socket.
pub struct ManagedChannel {
    this: Weak<Self>,
    socket_url: Url,
    host: String,
    timeout: Duration,
    heartbeat: Duration,
    client_status: Arc<ClientStatus>,
    events: SubscriberSet<Event>,
    sessions: SubscriberSet<Session>,
    system: SubscriberSet<SystemMessage>,
    link: Mutex<Link>,
    status_callback: Mutex<Option<StatusCallback>>,
    next_ref: AtomicU64,
    generation: AtomicU64,
    gate: tokio::sync::Mutex<()>,
}

impl ManagedChannel {
    pub(crate) fn new(
        socket_url: Url,
        timeout: Duration,
        heartbeat: Duration,
        client_status: Arc<ClientStatus>,
        events: SubscriberSet<Event>,
        sessions: SubscriberSet<Session>,
    ) -> Arc<Self> {
        let host = socket_url.host_str().unwrap_or("?").to_string();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            socket_url,
            host,
            timeout,
            heartbeat,
            client_status,
            events,
            sessions,
            system: SubscriberSet::new(),
            link: Mutex::new(Link::default()),
            status_callback: Mutex::new(None),
            next_ref: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            gate: tokio::sync::Mutex::new(()),
        })
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub(crate) fn is_joined(&self) -> bool {
        let link = self.link();
        link.join_ref.is_some()
            && link.pending_join.is_none()
            && link.connection.as_ref().is_some_and(SocketConnection::is_open)
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

    fn send(&self, message: &PhoenixMessage) -> Result<()> {
        self.link()
            .connection
            .as_ref()
            .ok_or_else(|| BackendError::Connection("realtime socket is closed".to_string()))?
            .send_json(message)
    }

    /// Open the socket and join the channel unless already joined.
    pub(crate) async fn open(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        if self.is_joined() {
            return Ok(());
        }
        self.teardown();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.client_status.set(ConnectionState::Connecting);

        let on_text = {
            let weak = self.this.clone();
            move |text: &str| {
                if let Some(channel) = weak.upgrade() {
                    channel.handle_text(generation, text);
                }
            }
        };
        let on_closed = {
            let weak = self.this.clone();
            move |reason: Option<String>| {
                if let Some(channel) = weak.upgrade() {
                    channel.handle_closed(generation, reason);
                }
            }
        };

        let connection =
            match SocketConnection::open(&self.socket_url, self.timeout, on_text, on_closed).await {
                Ok(connection) => connection,
                Err(e) => {
                    self.client_status.set(ConnectionState::Error);
                    tracing::warn!(host = %self.host, "realtime socket failed: {e}");
                    return Err(e);
                }
            };

        let join_ref = self.next_ref();
        let join = PhoenixMessage::join(
            REALTIME_TOPIC,
            &[EVENTS_TABLE, SESSIONS_TABLE],
            join_ref.clone(),
        );
        let (tx, rx) = oneshot::channel();
        let sent = {
            let mut link = self.link();
            let sent = connection.send_json(&join);
            link.connection = Some(connection);
            link.join_ref = Some(join_ref);
            link.pending_join = Some(tx);
            sent
        };

        let outcome = match sent {
            Err(e) => Err(e),
            Ok(()) => match tokio::time::timeout(self.timeout, rx).await {
                Err(_) => Err(BackendError::Timeout(self.timeout)),
                Ok(Err(_)) => Err(BackendError::Connection(
                    "realtime socket closed during join".to_string(),
                )),
                Ok(Ok(Err(reason))) => {
                    Err(BackendError::Connection(format!("join rejected: {reason}")))
                }
                Ok(Ok(Ok(()))) => Ok(()),
            },
        };

        match outcome {
            Ok(()) => {
                self.start_heartbeat(generation);
                self.client_status.set(ConnectionState::Connected);
                tracing::info!(host = %self.host, topic = REALTIME_TOPIC, "realtime channel joined");
                Ok(())
            }
            Err(e) => {
                self.teardown();
                self.client_status.set(ConnectionState::Error);
                tracing::warn!(host = %self.host, topic = REALTIME_TOPIC, "realtime join failed: {e}");
                Err(e)
            }
        }
    }

    fn start_heartbeat(&self, generation: u64) {
        let weak = self.this.clone();
        let period = self.heartbeat;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(channel) = weak.upgrade() else {
                    break;
                };
                if !channel.is_current(generation) {
                    break;
                }
                if let Err(e) = channel.send(&PhoenixMessage::heartbeat(channel.next_ref())) {
                    tracing::debug!("heartbeat stopped: {e}");
                    break;
                }
            }
        });
        if let Some(previous) = self.link().heartbeat.replace(task) {
            previous.abort();
        }
    }

    fn handle_text(&self, generation: u64, text: &str) {
        if !self.is_current(generation) {
            return;
        }
        let message: PhoenixMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("dropped realtime frame: {e}");
                return;
            }
        };

        match message.event.as_str() {
            PHX_REPLY => self.handle_reply(&message),
            SYSTEM => match serde_json::from_value::<SystemMessage>(message.payload) {
                Ok(system) => {
                    if system.is_extension_failure() {
                        tracing::warn!(
                            extension = system.extension.as_deref().unwrap_or_default(),
                            "realtime extension failed: {}",
                            system.message
                        );
                    }
                    self.system.notify(&system);
                }
                Err(e) => tracing::warn!("dropped system message: {e}"),
            },
            POSTGRES_CHANGES => self.handle_change(&message),
            PHX_ERROR if message.topic == REALTIME_TOPIC => {
                self.link().join_ref = None;
                self.client_status.set(ConnectionState::Error);
                self.report(ChannelStatus::ChannelError, Some("realtime channel error"));
            }
            PHX_CLOSE if message.topic == REALTIME_TOPIC => {
                self.link().join_ref = None;
                self.client_status.set(ConnectionState::Disconnected);
                self.report(ChannelStatus::Closed, None);
            }
            other => tracing::debug!(event = other, topic = %message.topic, "ignored realtime message"),
        }
    }

    fn handle_reply(&self, message: &PhoenixMessage) {
        if message.topic != REALTIME_TOPIC {
            return;
        }
        let pending = {
            let mut link = self.link();
            if link.join_ref.is_some() && link.join_ref == message.msg_ref {
                link.pending_join.take()
            } else {
                None
            }
        };
        let outcome: JoinOutcome = if message.reply_status() == Some("ok") {
            Ok(())
        } else {
            Err(message
                .reply_reason()
                .unwrap_or_else(|| "subscription rejected".to_string()))
        };
        match (pending, outcome) {
            (Some(tx), outcome) => {
                let _ = tx.send(outcome);
            }
            (None, Err(reason)) => {
                tracing::warn!(topic = REALTIME_TOPIC, "realtime error reply: {reason}");
                self.report(ChannelStatus::ChannelError, Some(&reason));
            }
            (None, Ok(())) => {}
        }
    }

    fn handle_change(&self, message: &PhoenixMessage) {
        let Some(record) = message.change_record().cloned() else {
            tracing::warn!("change message without a record");
            return;
        };
        if message.change_table() == Some(SESSIONS_TABLE) {
            match serde_json::from_value::<Session>(record) {
                Ok(session) => {
                    self.sessions.notify(&session);
                }
                Err(e) => tracing::warn!("dropped session change: {e}"),
            }
        } else {
            match Event::from_value(record) {
                Ok(event) => {
                    self.events.notify(&event);
                }
                Err(e) => tracing::warn!("dropped event change: {e}"),
            }
        }
    }

    fn handle_closed(&self, generation: u64, reason: Option<String>) {
        if !self.is_current(generation) {
            return;
        }
        let (joining, finished) = {
            let mut link = self.link();
            if let Some(task) = link.heartbeat.take() {
                task.abort();
            }
            link.join_ref = None;
            (link.pending_join.take().is_some(), link.connection.take())
        };
        drop(finished);
        if joining {
            return;
        }

        self.client_status.set(ConnectionState::Disconnected);
        let message = reason.map_or_else(
            || "realtime socket closed".to_string(),
            |r| format!("realtime socket closed: {r}"),
        );
        tracing::warn!(host = %self.host, "{message}");
        self.report(ChannelStatus::ChannelError, Some(&message));
    }

    /// Leave the channel and close the socket.
    pub(crate) fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let link = std::mem::take(&mut *self.link());
        if let Some(task) = link.heartbeat {
            task.abort();
        }
        if let Some(connection) = link.connection {
            if link.join_ref.is_some() {
                let leave = PhoenixMessage::new(REALTIME_TOPIC, PHX_LEAVE, json!({}))
                    .with_ref(self.next_ref());
                let _ = connection.send_json(&leave);
            }
            connection.close();
            tracing::info!(host = %self.host, "realtime socket closed");
        }
    }
}

impl RealtimeChannel for ManagedChannel {
    fn topic(&self) -> &str {
        REALTIME_TOPIC
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
            tracing::warn!("no runtime available to join the realtime channel");
            return;
        };
        handle.spawn(async move {
            match this.open().await {
                Ok(()) => this.report(ChannelStatus::Subscribed, None),
                Err(BackendError::Timeout(after)) => this.report(
                    ChannelStatus::TimedOut,
                    Some(&format!("join timed out after {after:?}")),
                ),
                Err(e) => this.report(ChannelStatus::ChannelError, Some(&e.to_string())),
            }
        });
    }

    fn unsubscribe(&self) {
        self.status_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.teardown();
        self.client_status.set(ConnectionState::Disconnected);
    }
}
