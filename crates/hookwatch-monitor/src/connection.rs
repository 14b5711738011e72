//! Connection health, channel keep-alive and reconnection policy.
//!
//! `ConnectionManager` owns the one authoritative [`ConnectionStatus`]. Every
//! mutation funnels through `Inner::transition`, which also debounces the
//! `connecting` state.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use hookwatch_backend::{BackendClient, Result, error::with_timeout};
use hookwatch_core::{
    ChannelStatus, ConnectionQuality, ConnectionState, ConnectionStatus, EventFilter,
    RealtimeChannel, StatusCallback, SubscriberSet, Subscription, SystemMessage,
};
use tokio::{runtime::Handle, task::JoinHandle, time::MissedTickBehavior};

/// Lightweight read deciding whether the backend answers.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
}

/// Probes a backend by fetching a single event.
pub struct BackendProbe {
    backend: Arc<dyn BackendClient>,
}

impl BackendProbe {
    #[must_use]
    pub fn new(backend: Arc<dyn BackendClient>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl HealthProbe for BackendProbe {
    async fn probe(&self) -> Result<()> {
        self.backend
            .get_events(&EventFilter::latest(1))
            .await
            .map(|_| ())
    }
}

/// Failure messages meaning the backend cannot be reached at all.
const UNREACHABLE_SIGNATURES: &[&str] = &[
    "connection refused",
    "connection reset",
    "error sending request",
    "failed to fetch",
    "network",
    "dns",
    "name resolution",
    "unreachable",
    "no route to host",
    "timed out",
    "certificate",
];

/// `error` for unreachable-backend failures, `disconnected` otherwise.
#[must_use]
pub fn classify_failure(message: &str) -> ConnectionState {
    let lower = message.to_lowercase();
    if UNREACHABLE_SIGNATURES.iter().any(|s| lower.contains(s)) {
        ConnectionState::Error
    } else {
        ConnectionState::Disconnected
    }
}

/// Delay before automatic attempt `attempt` (1-based): `base * 2^(attempt-1)`.
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1_u32 << exponent)
}

/// Connection manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionManagerConfig {
    /// Run the periodic health check (and the initial one).
    pub health_checks: bool,
    pub health_check_interval: Duration,
    /// Upper bound for one probe.
    pub health_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay: Duration,
    /// How long `connecting` must persist before it is published.
    pub connecting_debounce: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            health_checks: true,
            health_check_interval: Duration::from_secs(60),
            health_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            base_reconnect_delay: Duration::from_secs(2),
            connecting_debounce: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    /// Enter `connecting`; published once the debounce elapses.
    Connecting,
    /// Explicit retry. Refills a spent attempt budget, then as `Connecting`.
    RetryRequested,
    /// The debounce timer fired.
    ConnectingShown,
    Healthy,
    Subscribed,
    Failed {
        state: ConnectionState,
        message: String,
    },
    /// Probe failed while the ceiling error is showing.
    Unhealthy,
    AttemptFailed {
        state: ConnectionState,
        message: String,
        health_passed: bool,
    },
    /// A registered channel failed outside a reconnect attempt.
    ChannelFailed {
        state: ConnectionState,
        message: String,
    },
    /// Channels are being resubscribed after a passing probe.
    Resubscribing,
    ChannelAdded,
    ChannelRemoved,
    EventReceived,
}

struct Registered {
    channel: Weak<dyn RealtimeChannel>,
    system: Subscription,
}

type Attempt = Shared<BoxFuture<'static, bool>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Reconnected,
    /// Failed; another attempt should follow.
    Retry,
    /// Failed in a way another attempt cannot fix, or shut down.
    GaveUp,
}

#[derive(Default)]
struct State {
    status: ConnectionStatus,
    debounce: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
    in_flight: Option<Attempt>,
    channels: HashMap<String, Registered>,
    /// A registered channel reported a failure and has not acknowledged since.
    channel_failing: bool,
    /// Channels were resubscribed by a reconnect attempt and not yet acknowledged.
    resubscribing: bool,
}

impl State {
    fn cancel_debounce(&mut self) {
        if let Some(timer) = self.debounce.take() {
            timer.abort();
        }
    }
}

fn spawn<F>(future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(future)),
        Err(_) => {
            tracing::warn!("no tokio runtime available; timer not started");
            None
        }
    }
}

struct Inner {
    config: ConnectionManagerConfig,
    probe: Arc<dyn HealthProbe>,
    state: Mutex<State>,
    listeners: SubscriberSet<ConnectionStatus>,
    shut_down: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn exhausted(&self, state: &State) -> bool {
        state.status.reconnect_attempts >= self.config.max_reconnect_attempts
    }

    /// Arm the debounce timer; without a timer `connecting` shows at once.
    fn enter_connecting(self: &Arc<Self>, state: &mut State) {
        if state.status.state == ConnectionState::Connecting || state.debounce.is_some() {
            return;
        }
        let delay = self.config.connecting_debounce;
        let weak = Arc::downgrade(self);
        let timer = if delay.is_zero() {
            None
        } else {
            spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.transition(Transition::ConnectingShown);
                }
            })
        };
        match timer {
            Some(timer) => state.debounce = Some(timer),
            None => state.status.state = ConnectionState::Connecting,
        }
    }

    /// Apply one transition and publish the result if anything changed.
    fn transition(self: &Arc<Self>, transition: Transition) {
        if self.is_shut_down() {
            return;
        }
        let max = self.config.max_reconnect_attempts;

        let published = {
            let mut state = self.lock();
            let before = state.status.clone();

            match transition {
                Transition::Connecting => self.enter_connecting(&mut state),
                Transition::RetryRequested => {
                    if self.exhausted(&state) {
                        state.status.reconnect_attempts = 0;
                    }
                    self.enter_connecting(&mut state);
                }
                Transition::ConnectingShown => {
                    if state.debounce.take().is_some() {
                        state.status.state = ConnectionState::Connecting;
                    }
                }
                Transition::Healthy => {
                    state.cancel_debounce();
                    state.status.is_healthy = true;
                    // A failing channel keeps its error and attempt count
                    // until it acknowledges again.
                    if !state.channel_failing {
                        state.status.state = ConnectionState::Connected;
                        state.status.error = None;
                        state.status.reconnect_attempts = 0;
                    }
                }
                Transition::Subscribed => {
                    state.cancel_debounce();
                    state.channel_failing = false;
                    state.resubscribing = false;
                    state.status.state = ConnectionState::Connected;
                    state.status.error = None;
                    state.status.reconnect_attempts = 0;
                }
                Transition::Resubscribing => {
                    state.resubscribing = true;
                }
                Transition::ChannelFailed {
                    state: next,
                    message,
                } => {
                    state.cancel_debounce();
                    state.channel_failing = true;
                    if !self.exhausted(&state) {
                        state.status.state = next;
                        state.status.error = Some(message);
                    }
                }
                Transition::Failed {
                    state: next,
                    message,
                } => {
                    state.cancel_debounce();
                    state.status.state = next;
                    state.status.is_healthy = false;
                    state.status.error = Some(message);
                }
                Transition::Unhealthy => {
                    state.cancel_debounce();
                    state.status.is_healthy = false;
                    if self.exhausted(&state) {
                        state.status.state = ConnectionState::Error;
                    }
                }
                Transition::AttemptFailed {
                    state: next,
                    message,
                    health_passed,
                } => {
                    state.cancel_debounce();
                    state.resubscribing = false;
                    state.status.is_healthy = health_passed;
                    state.status.reconnect_attempts += 1;
                    if self.exhausted(&state) {
                        state.status.state = ConnectionState::Error;
                        state.status.error = Some(format!(
                            "Maximum reconnection attempts ({max}) reached: {message}"
                        ));
                    } else {
                        state.status.state = next;
                        state.status.error = Some(message);
                    }
                }
                Transition::ChannelAdded => {
                    state.status.subscriptions += 1;
                }
                Transition::ChannelRemoved => {
                    state.status.subscriptions = state.status.subscriptions.saturating_sub(1);
                    if state.status.subscriptions == 0 {
                        state.cancel_debounce();
                        state.status.state = ConnectionState::Disconnected;
                    }
                }
                Transition::EventReceived => {
                    state.status.last_event_received = Some(Utc::now());
                }
            }

            if state.status == before {
                None
            } else {
                state.status.last_update = Some(Utc::now());
                if state.status.state != before.state {
                    tracing::debug!(from = %before.state, state = %state.status.state, "connection state changed");
                }
                Some(state.status.clone())
            }
        };

        if let Some(status) = published {
            self.listeners.notify(&status);
        }
    }

    async fn perform_health_check(self: &Arc<Self>) -> bool {
        let result = with_timeout(self.config.health_timeout, self.probe.probe()).await;
        if self.is_shut_down() {
            return false;
        }
        match result {
            Ok(()) => {
                tracing::debug!("health check passed");
                self.transition(Transition::Healthy);
                true
            }
            Err(e) => {
                let message = e.to_string();
                let exhausted = self.exhausted(&self.lock());
                if exhausted {
                    tracing::debug!("health check failed with reconnects exhausted: {message}");
                    self.transition(Transition::Unhealthy);
                } else if e.is_retryable() {
                    tracing::warn!("health check failed: {message}");
                    self.transition(Transition::Failed {
                        state: classify_failure(&message),
                        message,
                    });
                    self.schedule_reconnect();
                } else {
                    tracing::error!("health check failed, not retrying: {message}");
                    self.transition(Transition::Failed {
                        state: ConnectionState::Error,
                        message,
                    });
                }
                false
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let scheduled = {
            let mut state = self.lock();
            if self.is_shut_down() || state.reconnect.is_some() || self.exhausted(&state) {
                None
            } else {
                let attempt = state.status.reconnect_attempts + 1;
                let delay = backoff_delay(self.config.base_reconnect_delay, attempt);
                let weak = Arc::downgrade(self);
                state.reconnect = spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    inner.lock().reconnect = None;
                    inner.attempt(false).await;
                });
                state.reconnect.is_some().then_some((attempt, delay))
            }
        };
        if let Some((attempt, delay)) = scheduled {
            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnect scheduled"
            );
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(timer) = self.lock().reconnect.take() {
            timer.abort();
        }
    }

    /// The in-flight attempt, or a new one.
    fn attempt(self: &Arc<Self>, explicit: bool) -> Attempt {
        let mut state = self.lock();
        if let Some(in_flight) = &state.in_flight {
            return in_flight.clone();
        }
        let inner = Arc::clone(self);
        let attempt = async move {
            let outcome = inner.run_attempt(explicit).await;
            inner.lock().in_flight = None;
            if outcome == AttemptOutcome::Retry {
                inner.schedule_reconnect();
            }
            outcome == AttemptOutcome::Reconnected
        }
        .boxed()
        .shared();
        state.in_flight = Some(attempt.clone());
        attempt
    }

    async fn run_attempt(self: &Arc<Self>, explicit: bool) -> AttemptOutcome {
        if self.is_shut_down() {
            return AttemptOutcome::GaveUp;
        }
        self.transition(if explicit {
            Transition::RetryRequested
        } else {
            Transition::Connecting
        });
        let attempt = self.lock().status.reconnect_attempts + 1;
        tracing::info!(attempt, explicit, "reconnect attempt");

        let result = with_timeout(self.config.health_timeout, self.probe.probe()).await;
        if self.is_shut_down() {
            return AttemptOutcome::GaveUp;
        }
        match result {
            Ok(()) => {
                self.transition(Transition::Healthy);
                self.resubscribe_all();
                tracing::info!(attempt, "reconnected");
                AttemptOutcome::Reconnected
            }
            Err(e) if !e.is_retryable() => {
                let message = e.to_string();
                tracing::error!(attempt, "reconnect attempt failed, not retrying: {message}");
                self.transition(Transition::Failed {
                    state: ConnectionState::Error,
                    message,
                });
                AttemptOutcome::GaveUp
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(attempt, "reconnect attempt failed: {message}");
                self.transition(Transition::AttemptFailed {
                    state: classify_failure(&message),
                    message,
                    health_passed: false,
                });
                self.log_if_exhausted();
                AttemptOutcome::Retry
            }
        }
    }

    fn log_if_exhausted(&self) {
        if self.exhausted(&self.lock()) {
            tracing::error!(
                attempts = self.config.max_reconnect_attempts,
                "giving up on automatic reconnection"
            );
        }
    }

    fn resubscribe_all(self: &Arc<Self>) {
        let channels: Vec<Arc<dyn RealtimeChannel>> = self
            .lock()
            .channels
            .values()
            .filter_map(|registered| registered.channel.upgrade())
            .collect();
        if !channels.is_empty() {
            self.transition(Transition::Resubscribing);
        }
        for channel in channels {
            tracing::debug!(topic = channel.topic(), "resubscribing channel");
            channel.subscribe(self.status_callback(channel.topic()));
        }
    }

    fn status_callback(self: &Arc<Self>, topic: &str) -> StatusCallback {
        let weak = Arc::downgrade(self);
        let topic = topic.to_string();
        Arc::new(move |status, message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_channel_status(&topic, status, message);
            }
        })
    }

    fn on_channel_status(self: &Arc<Self>, topic: &str, status: ChannelStatus, message: Option<&str>) {
        if !self.lock().channels.contains_key(topic) {
            return;
        }
        match status {
            ChannelStatus::Subscribed => {
                tracing::info!(topic, "channel subscribed");
                self.transition(Transition::Subscribed);
            }
            ChannelStatus::ChannelError | ChannelStatus::TimedOut | ChannelStatus::Closed => {
                let (state, message) = if status == ChannelStatus::Closed {
                    (
                        ConnectionState::Disconnected,
                        message.map_or_else(|| format!("{topic}: channel closed"), str::to_string),
                    )
                } else {
                    (
                        ConnectionState::Error,
                        message.map_or_else(|| format!("{topic}: {status}"), str::to_string),
                    )
                };
                tracing::warn!(topic, %status, "channel failed: {message}");
                // A failure answering a reconnect's resubscribe spends that attempt.
                let resubscribing = self.lock().resubscribing;
                if resubscribing {
                    self.transition(Transition::AttemptFailed {
                        state,
                        message,
                        health_passed: true,
                    });
                    self.log_if_exhausted();
                } else {
                    self.transition(Transition::ChannelFailed { state, message });
                }
                self.schedule_reconnect();
            }
        }
    }

    fn on_system_message(self: &Arc<Self>, message: &SystemMessage) {
        if !message.is_extension_failure() {
            return;
        }
        let extension = message.extension.as_deref().unwrap_or("extension");
        let text = if message.message.is_empty() {
            format!("{extension} failed")
        } else {
            format!("{extension}: {}", message.message)
        };
        tracing::warn!(extension, "realtime extension failed: {}", message.message);
        self.transition(Transition::Failed {
            state: ConnectionState::Error,
            message: text,
        });
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let (timers, channels, in_flight) = {
            let mut state = self.lock();
            (
                [
                    state.debounce.take(),
                    state.reconnect.take(),
                    state.health.take(),
                ],
                std::mem::take(&mut state.channels),
                state.in_flight.take(),
            )
        };
        for timer in timers.into_iter().flatten() {
            timer.abort();
        }
        drop(in_flight);
        for (topic, registered) in channels {
            registered.system.unsubscribe();
            if let Some(channel) = registered.channel.upgrade() {
                channel.unsubscribe();
            }
            tracing::debug!(topic, "channel released");
        }
        self.listeners.clear();
        tracing::info!("connection manager shut down");
    }
}

async fn health_loop(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.perform_health_check().await;
    }
}

/// Keeps realtime channels alive and publishes the connection status.
///
/// Timers hold only weak references; dropping the manager shuts it down.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Start managing. With health checks enabled the first probe runs
    /// immediately on the current tokio runtime.
    #[must_use]
    pub fn new(probe: Arc<dyn HealthProbe>, config: ConnectionManagerConfig) -> Self {
        let health = config
            .health_checks
            .then_some(config.health_check_interval);
        let inner = Arc::new(Inner {
            config,
            probe,
            state: Mutex::new(State::default()),
            listeners: SubscriberSet::new(),
            shut_down: AtomicBool::new(false),
        });
        if let Some(period) = health {
            let task = spawn(health_loop(Arc::downgrade(&inner), period));
            inner.lock().health = task;
        }
        Self { inner }
    }

    /// Manager probing `backend` with `get_events(limit = 1)`.
    #[must_use]
    pub fn for_backend(backend: Arc<dyn BackendClient>, config: ConnectionManagerConfig) -> Self {
        Self::new(Arc::new(BackendProbe::new(backend)), config)
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.inner.config
    }

    /// Run the probe now. Returns whether it succeeded.
    pub async fn perform_health_check(&self) -> bool {
        if self.inner.is_shut_down() {
            return false;
        }
        self.inner.perform_health_check().await
    }

    /// Attach a channel, subscribe it and track its acknowledgements.
    ///
    /// The manager keeps only a weak reference; the channel's owner decides
    /// its lifetime. Registering a topic again replaces the earlier entry.
    pub fn register_channel(&self, channel: &Arc<dyn RealtimeChannel>) {
        let inner = &self.inner;
        if inner.is_shut_down() {
            return;
        }
        let topic = channel.topic().to_string();

        let weak = Arc::downgrade(inner);
        let system = channel.on_system(Arc::new(move |message: &SystemMessage| {
            if let Some(inner) = weak.upgrade() {
                inner.on_system_message(message);
            }
        }));
        let replaced = inner.lock().channels.insert(
            topic.clone(),
            Registered {
                channel: Arc::downgrade(channel),
                system,
            },
        );
        match replaced {
            Some(previous) => previous.system.unsubscribe(),
            None => inner.transition(Transition::ChannelAdded),
        }

        tracing::info!(topic = %topic, "channel registered");
        channel.subscribe(inner.status_callback(&topic));
    }

    /// Detach and unsubscribe the channel on `topic`. Returns whether one
    /// was registered.
    pub fn unregister_channel(&self, topic: &str) -> bool {
        let removed = self.inner.lock().channels.remove(topic);
        let Some(registered) = removed else {
            return false;
        };
        registered.system.unsubscribe();
        if let Some(channel) = registered.channel.upgrade() {
            channel.unsubscribe();
        }
        self.inner.transition(Transition::ChannelRemoved);
        tracing::info!(topic, "channel unregistered");
        true
    }

    /// Topics currently registered.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.inner.lock().channels.keys().cloned().collect()
    }

    /// Reconnect now. Joins an attempt already in flight; refills the
    /// attempt budget when it was spent.
    pub async fn retry(&self) -> bool {
        if self.inner.is_shut_down() {
            return false;
        }
        self.inner.cancel_reconnect();
        self.inner.attempt(true).await
    }

    pub fn record_event_received(&self) {
        self.inner.transition(Transition::EventReceived);
    }

    /// Detached `record_event_received` for use inside callbacks.
    #[must_use]
    pub fn event_recorder(&self) -> impl Fn() + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                inner.transition(Transition::EventReceived);
            }
        }
    }

    #[must_use]
    pub fn connection_quality(&self) -> ConnectionQuality {
        self.status().quality_at(Utc::now())
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status.clone()
    }

    /// Called synchronously with every published status.
    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(callback)
    }

    /// Stop timers, unsubscribe channels and drop listeners. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookwatch_backend::BackendError;
    use hookwatch_core::SystemCallback;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    struct ScriptedProbe {
        healthy: AtomicBool,
        failure: Mutex<String>,
        latency: Duration,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedProbe {
        fn new(healthy: bool) -> Arc<Self> {
            Self::slow(healthy, Duration::ZERO)
        }

        fn slow(healthy: bool, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                failure: Mutex::new("connection refused".to_string()),
                latency,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn fail_with(&self, message: &str) {
            self.healthy.store(false, Ordering::SeqCst);
            *self.failure.lock().unwrap() = message.to_string();
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self) -> Result<()> {
            self.calls.lock().unwrap().push(Instant::now());
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BackendError::Connection(self.failure.lock().unwrap().clone()))
            }
        }
    }

    struct MockChannel {
        topic: String,
        reply: Mutex<Option<(ChannelStatus, Option<String>)>>,
        subscribes: AtomicUsize,
        subscribed_at: Mutex<Vec<Instant>>,
        callback: Mutex<Option<StatusCallback>>,
        unsubscribes: AtomicUsize,
        system: SubscriberSet<SystemMessage>,
    }

    impl MockChannel {
        fn new(topic: &str, reply: Option<(ChannelStatus, Option<&str>)>) -> Arc<Self> {
            Arc::new(Self {
                topic: topic.to_string(),
                reply: Mutex::new(reply.map(|(s, m)| (s, m.map(str::to_string)))),
                subscribes: AtomicUsize::new(0),
                subscribed_at: Mutex::new(Vec::new()),
                callback: Mutex::new(None),
                unsubscribes: AtomicUsize::new(0),
                system: SubscriberSet::new(),
            })
        }

        fn reply_with(&self, status: ChannelStatus, message: Option<&str>) {
            *self.reply.lock().unwrap() = Some((status, message.map(str::to_string)));
        }

        /// Report a status after the subscribe call returned.
        fn report(&self, status: ChannelStatus, message: Option<&str>) {
            let callback = self.callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(status, message);
            }
        }

        fn as_dyn(self: &Arc<Self>) -> Arc<dyn RealtimeChannel> {
            Arc::clone(self) as Arc<dyn RealtimeChannel>
        }
    }

    impl RealtimeChannel for MockChannel {
        fn topic(&self) -> &str {
            &self.topic
        }

        fn on_system(&self, callback: SystemCallback) -> Subscription {
            self.system.subscribe(move |message| callback(message))
        }

        fn subscribe(&self, callback: StatusCallback) {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            self.subscribed_at.lock().unwrap().push(Instant::now());
            *self.callback.lock().unwrap() = Some(Arc::clone(&callback));
            let reply = self.reply.lock().unwrap().clone();
            if let Some((status, message)) = reply {
                callback(status, message.as_deref());
            }
        }

        fn unsubscribe(&self) {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn quiet() -> ConnectionManagerConfig {
        ConnectionManagerConfig {
            health_checks: false,
            base_reconnect_delay: Duration::from_secs(1),
            ..ConnectionManagerConfig::default()
        }
    }

    #[test]
    fn failures_are_classified_by_signature() {
        assert_eq!(
            classify_failure("connection error: tcp connect error: Connection refused"),
            ConnectionState::Error
        );
        assert_eq!(
            classify_failure("request timed out after 10000 ms"),
            ConnectionState::Error
        );
        assert_eq!(
            classify_failure("GET http://x/api/events returned 503 Service Unavailable"),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn backoff_doubles_from_the_base() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 4), Duration::from_millis(4000));
        assert!(backoff_delay(base, 200) >= backoff_delay(base, 32));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_health_checks_keep_the_status_healthy() {
        let probe = ScriptedProbe::new(true);
        let manager = ConnectionManager::new(
            probe.clone(),
            ConnectionManagerConfig {
                health_check_interval: Duration::from_millis(50),
                ..ConnectionManagerConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(350)).await;

        assert!(probe.calls().len() >= 2);
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(status.is_healthy);
        assert_eq!(status.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn generic_health_failures_disconnect() {
        let probe = ScriptedProbe::new(false);
        probe.fail_with("GET /api/events returned 503 Service Unavailable");
        let manager = ConnectionManager::new(probe.clone(), quiet());

        assert!(!manager.perform_health_check().await);
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.is_healthy);
        assert!(status.error.unwrap().contains("503"));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backoff_grows_until_the_ceiling() {
        let probe = ScriptedProbe::new(false);
        let manager = ConnectionManager::new(
            probe.clone(),
            ConnectionManagerConfig {
                health_check_interval: Duration::from_secs(3600),
                max_reconnect_attempts: 3,
                base_reconnect_delay: Duration::from_millis(100),
                ..ConnectionManagerConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_secs(30)).await;

        // One initial health check plus three automatic attempts.
        let calls = probe.calls();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] < gaps[1] && gaps[1] < gaps[2], "{gaps:?}");

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.reconnect_attempts, 3);
        assert!(status.error.as_deref().unwrap().contains("Maximum reconnection attempts"));

        // A failing health check keeps the ceiling error.
        assert!(!manager.perform_health_check().await);
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error.as_deref().unwrap().contains("Maximum reconnection attempts"));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.calls().len(), 5);

        // An explicit retry refills the budget.
        probe.healthy.store(true, Ordering::SeqCst);
        assert!(manager.retry().await);
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(status.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn connecting_is_debounced() {
        let probe = ScriptedProbe::slow(true, Duration::from_secs(1));
        let manager = Arc::new(ConnectionManager::new(probe.clone(), quiet()));
        let channel = MockChannel::new("live", Some((ChannelStatus::Subscribed, None)));
        manager.register_channel(&channel.as_dyn());
        assert_eq!(manager.status().state, ConnectionState::Connected);

        let retrying = Arc::clone(&manager);
        let task = tokio::spawn(async move { retrying.retry().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.status().state, ConnectionState::Connected);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.status().state, ConnectionState::Connecting);

        assert!(task.await.unwrap());
        assert_eq!(manager.status().state, ConnectionState::Connected);
        assert_eq!(channel.subscribes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_retries_share_one_attempt() {
        let probe = ScriptedProbe::slow(true, Duration::from_millis(200));
        let manager = ConnectionManager::new(probe.clone(), quiet());

        let (a, b) = tokio::join!(manager.retry(), manager.retry());
        assert!(a && b);
        assert_eq!(probe.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_error_surfaces_the_message() {
        let probe = ScriptedProbe::new(true);
        let manager = ConnectionManager::new(probe, quiet());
        let channel = MockChannel::new(
            "realtime:public",
            Some((ChannelStatus::ChannelError, Some("Subscription failed"))),
        );

        manager.register_channel(&channel.as_dyn());

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.subscriptions, 1);
        assert!(status.error.unwrap().contains("Subscription failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_channel_backs_off_until_the_ceiling() {
        let probe = ScriptedProbe::new(true);
        let manager = ConnectionManager::new(
            probe.clone(),
            ConnectionManagerConfig {
                health_check_interval: Duration::from_secs(3600),
                max_reconnect_attempts: 3,
                base_reconnect_delay: Duration::from_millis(100),
                ..ConnectionManagerConfig::default()
            },
        );
        let channel = MockChannel::new(
            "live",
            Some((ChannelStatus::ChannelError, Some("Subscription failed"))),
        );
        manager.register_channel(&channel.as_dyn());

        tokio::time::sleep(Duration::from_secs(60)).await;

        // The initial subscribe plus three resubscribes.
        let at = channel.subscribed_at.lock().unwrap().clone();
        assert_eq!(at.len(), 4);
        let gaps: Vec<Duration> = at.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] < gaps[1] && gaps[1] < gaps[2], "{gaps:?}");

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.reconnect_attempts, 3);
        assert!(status.is_healthy);
        let error = status.error.unwrap();
        assert!(error.contains("Maximum reconnection attempts"), "{error}");
        assert!(error.contains("Subscription failed"), "{error}");

        // A passing health check does not mask the failing channel.
        assert!(manager.perform_health_check().await);
        assert_eq!(manager.status().state, ConnectionState::Error);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(channel.subscribes.load(Ordering::SeqCst), 4);

        channel.reply_with(ChannelStatus::Subscribed, None);
        assert!(manager.retry().await);
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(status.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_disconnects_and_resubscribes() {
        let manager = ConnectionManager::new(ScriptedProbe::new(true), quiet());
        let channel = MockChannel::new("live", Some((ChannelStatus::Subscribed, None)));
        manager.register_channel(&channel.as_dyn());
        assert_eq!(manager.status().state, ConnectionState::Connected);

        channel.report(ChannelStatus::Closed, None);
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.error.unwrap().contains("channel closed"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(channel.subscribes.load(Ordering::SeqCst), 2);
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.reconnect_attempts, 0);
    }

    struct MisconfiguredProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for MisconfiguredProbe {
        async fn probe(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Validation("HOOKWATCH_SERVER_URL is not set".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_failures_are_not_retried() {
        let probe = Arc::new(MisconfiguredProbe {
            calls: AtomicUsize::new(0),
        });
        let manager = ConnectionManager::new(
            probe.clone(),
            ConnectionManagerConfig {
                health_check_interval: Duration::from_secs(3600),
                base_reconnect_delay: Duration::from_millis(100),
                ..ConnectionManagerConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.error.unwrap().contains("HOOKWATCH_SERVER_URL"));
    }

    #[tokio::test(start_paused = true)]
    async fn extension_failure_forces_error() {
        let manager = ConnectionManager::new(ScriptedProbe::new(true), quiet());
        let channel = MockChannel::new("realtime:public", Some((ChannelStatus::Subscribed, None)));
        manager.register_channel(&channel.as_dyn());
        assert_eq!(manager.status().state, ConnectionState::Connected);

        channel.system.notify(&SystemMessage {
            extension: Some("postgres_changes".to_string()),
            status: "ok".to_string(),
            message: "Subscribed to PostgreSQL".to_string(),
        });
        assert_eq!(manager.status().state, ConnectionState::Connected);

        channel.system.notify(&SystemMessage {
            extension: Some("postgres_changes".to_string()),
            status: "error".to_string(),
            message: "relation \"events\" does not exist".to_string(),
        });
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error.unwrap().contains("does not exist"));
    }

    #[tokio::test(start_paused = true)]
    async fn unregistering_the_last_channel_disconnects() {
        let manager = ConnectionManager::new(ScriptedProbe::new(true), quiet());
        let events = MockChannel::new("events", Some((ChannelStatus::Subscribed, None)));
        let sessions = MockChannel::new("sessions", Some((ChannelStatus::Subscribed, None)));
        manager.register_channel(&events.as_dyn());
        manager.register_channel(&sessions.as_dyn());
        assert_eq!(manager.status().subscriptions, 2);

        assert!(manager.unregister_channel("events"));
        assert!(!manager.unregister_channel("events"));
        let status = manager.status();
        assert_eq!(status.subscriptions, 1);
        assert_eq!(status.state, ConnectionState::Connected);

        assert!(manager.unregister_channel("sessions"));
        let status = manager.status();
        assert_eq!(status.subscriptions, 0);
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(events.unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(sessions.unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_see_each_published_status() {
        let manager = ConnectionManager::new(ScriptedProbe::new(true), quiet());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _listener = manager.on_status_change(move |status| {
            sink.lock().unwrap().push((status.state, status.subscriptions));
        });

        let channel = MockChannel::new("live", Some((ChannelStatus::Subscribed, None)));
        manager.register_channel(&channel.as_dyn());
        manager.unregister_channel("live");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ConnectionState::Connecting, 1),
                (ConnectionState::Connected, 1),
                (ConnectionState::Disconnected, 0),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quality_follows_event_activity() {
        let manager = ConnectionManager::new(ScriptedProbe::new(true), quiet());
        assert_eq!(manager.connection_quality(), ConnectionQuality::Unknown);

        let record = manager.event_recorder();
        record();
        assert_eq!(manager.connection_quality(), ConnectionQuality::Excellent);
        assert!(manager.status().last_event_received.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_final() {
        let probe = ScriptedProbe::new(true);
        let manager = ConnectionManager::new(
            probe.clone(),
            ConnectionManagerConfig {
                health_check_interval: Duration::from_millis(50),
                ..ConnectionManagerConfig::default()
            },
        );
        let channel = MockChannel::new("live", Some((ChannelStatus::Subscribed, None)));
        manager.register_channel(&channel.as_dyn());
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let _listener = manager.on_status_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.shutdown();
        manager.shutdown();
        assert!(manager.is_shut_down());
        assert_eq!(channel.unsubscribes.load(Ordering::SeqCst), 1);
        assert!(manager.topics().is_empty());

        let probes = probe.calls().len();
        let before = notified.load(Ordering::SeqCst);
        manager.record_event_received();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(probe.calls().len(), probes);
        assert_eq!(notified.load(Ordering::SeqCst), before);
        assert!(!manager.retry().await);
    }
}
