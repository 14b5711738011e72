//! Composition root wiring a backend to the batcher, store and connection
//! manager.

use std::sync::{Arc, Mutex, PoisonError};

use hookwatch_backend::{BackendClient, Tuning};
use hookwatch_core::{
    BatcherConfig, BoundedEventStore, EventBatcher, EventFilter, Subscription,
    event_store::DEFAULT_MAX_EVENTS,
};

use crate::connection::{ConnectionManager, ConnectionManagerConfig};

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub connection: ConnectionManagerConfig,
    pub batcher: BatcherConfig,
    /// Store capacity and history fetch size.
    pub max_events: usize,
    pub load_history: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionManagerConfig::default(),
            batcher: BatcherConfig::default(),
            max_events: DEFAULT_MAX_EVENTS,
            load_history: true,
        }
    }
}

impl MonitorConfig {
    /// Map the backend tuning block onto the connection manager.
    #[must_use]
    pub fn from_tuning(tuning: &Tuning) -> Self {
        Self {
            connection: ConnectionManagerConfig {
                health_check_interval: tuning.health_check_interval,
                health_timeout: tuning.timeout,
                max_reconnect_attempts: tuning.retry_attempts,
                base_reconnect_delay: tuning.retry_delay,
                ..ConnectionManagerConfig::default()
            },
            ..Self::default()
        }
    }
}

/// A running monitor.
///
/// Live events flow backend -> batcher -> store; every delivered batch
/// stamps the connection manager's activity clock.
pub struct Monitor {
    backend: Arc<dyn BackendClient>,
    batcher: Arc<EventBatcher>,
    store: Arc<BoundedEventStore>,
    connection: ConnectionManager,
    topic: String,
    wiring: Mutex<Vec<Subscription>>,
}

impl Monitor {
    /// Wire everything up, register the live channel and load history.
    ///
    /// A failed history fetch is logged; live data still flows.
    pub async fn start(backend: Arc<dyn BackendClient>, config: MonitorConfig) -> Self {
        let batcher = Arc::new(EventBatcher::new(config.batcher.clone()));
        let store = Arc::new(BoundedEventStore::new(config.max_events));
        let connection =
            ConnectionManager::for_backend(Arc::clone(&backend), config.connection.clone());

        let feed = Arc::clone(&batcher);
        let live = backend.subscribe_to_events(Box::new(move |event| {
            feed.add_event(event.clone());
        }));

        let sink = Arc::clone(&store);
        let record = connection.event_recorder();
        let batches = batcher.subscribe(move |batch| {
            let outcome = sink.push_batch(batch);
            if outcome.rejected > 0 || outcome.duplicates > 0 {
                tracing::debug!(
                    rejected = outcome.rejected,
                    duplicates = outcome.duplicates,
                    "batch partially accepted"
                );
            }
            record();
        });

        let channel = backend.live_channel();
        let topic = channel.topic().to_string();
        connection.register_channel(&channel);

        if config.load_history {
            match backend
                .get_events(&EventFilter::latest(config.max_events))
                .await
            {
                Ok(history) => {
                    let outcome = store.load_history(history);
                    tracing::info!(
                        accepted = outcome.accepted,
                        evicted = outcome.evicted,
                        "history loaded"
                    );
                }
                Err(e) => tracing::warn!("history unavailable, continuing with live data: {e}"),
            }
        }

        tracing::info!(kind = %backend.kind(), topic = %topic, "monitor started");
        Self {
            backend,
            batcher,
            store,
            connection,
            topic,
            wiring: Mutex::new(vec![live, batches]),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn BackendClient> {
        &self.backend
    }

    #[must_use]
    pub fn batcher(&self) -> &EventBatcher {
        &self.batcher
    }

    #[must_use]
    pub fn store(&self) -> &BoundedEventStore {
        &self.store
    }

    #[must_use]
    pub const fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Topic of the registered live channel.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Reconnect now; see [`ConnectionManager::retry`].
    pub async fn retry(&self) -> bool {
        self.connection.retry().await
    }

    /// Flush pending events, release the channel and disconnect. Idempotent.
    pub async fn shutdown(&self) {
        if self.connection.is_shut_down() {
            return;
        }
        self.batcher.destroy();
        self.connection.shutdown();
        let wiring =
            std::mem::take(&mut *self.wiring.lock().unwrap_or_else(PoisonError::into_inner));
        for subscription in wiring {
            subscription.unsubscribe();
        }
        if let Err(e) = self.backend.disconnect().await {
            tracing::warn!("disconnect during shutdown failed: {e}");
        }
        tracing::info!(topic = %self.topic, "monitor stopped");
    }
}
