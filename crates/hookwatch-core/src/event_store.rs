//! Bounded, newest-first event store.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, PoisonError, RwLock},
};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{Event, SubscriberSet, Subscription};

/// Default cap on retained events.
pub const DEFAULT_MAX_EVENTS: usize = 1000;

/// Result of one insertion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub accepted: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub evicted: usize,
}

/// Change published to live listeners.
#[derive(Debug, Clone)]
pub enum StoreUpdate {
    /// Newly accepted events, oldest first.
    Inserted(Arc<[Event]>),
    /// The store was emptied.
    Cleared,
}

struct Inner {
    /// Front is the most recently arrived event.
    events: VecDeque<Event>,
    keys: HashSet<(String, String)>,
    max_events: usize,
}

impl Inner {
    fn key(event: &Event) -> (String, String) {
        (event.session_id.clone(), event.id.clone())
    }

    fn evict(&mut self) -> usize {
        let mut evicted = 0;
        while self.events.len() > self.max_events {
            if let Some(oldest) = self.events.pop_back() {
                self.keys.remove(&Self::key(&oldest));
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }
}

/// Merges historical fetches and live batches into one capped sequence.
///
/// Eviction is by arrival: history counts as older than anything received
/// live, and within a live batch later elements are newer.
pub struct BoundedEventStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<StoreUpdate>,
    subscribers: SubscriberSet<[Event]>,
}

impl Default for BoundedEventStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

impl BoundedEventStore {
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                events: VecDeque::with_capacity(max_events.min(1024)),
                keys: HashSet::new(),
                max_events,
            }),
            sender,
            subscribers: SubscriberSet::new(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a live batch (oldest first, as emitted by the batcher).
    pub fn push_batch(&self, batch: &[Event]) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        let mut accepted = Vec::with_capacity(batch.len());

        {
            let mut inner = self.write();
            for event in batch {
                if let Err(e) = event.validate() {
                    tracing::debug!("rejected event: {e}");
                    outcome.rejected += 1;
                    continue;
                }
                if !inner.keys.insert(Inner::key(event)) {
                    outcome.duplicates += 1;
                    continue;
                }
                inner.events.push_front(event.clone());
                accepted.push(event.clone());
            }
            outcome.accepted = accepted.len();
            outcome.evicted = inner.evict();
        }

        if !accepted.is_empty() {
            self.publish(accepted);
        }
        outcome
    }

    /// Insert a single live event.
    pub fn push(&self, event: Event) -> InsertOutcome {
        self.push_batch(std::slice::from_ref(&event))
    }

    /// Merge a historical fetch (newest first) behind the live events.
    pub fn load_history(&self, history: Vec<Event>) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        let mut accepted = Vec::new();

        {
            let mut inner = self.write();
            for event in history {
                if event.validate().is_err() {
                    outcome.rejected += 1;
                    continue;
                }
                if !inner.keys.insert(Inner::key(&event)) {
                    outcome.duplicates += 1;
                    continue;
                }
                accepted.push(event.clone());
                inner.events.push_back(event);
            }
            outcome.accepted = accepted.len();
            outcome.evicted = inner.evict();
        }

        if !accepted.is_empty() {
            accepted.reverse();
            self.publish(accepted);
        }
        tracing::debug!(
            accepted = outcome.accepted,
            duplicates = outcome.duplicates,
            "history merged"
        );
        outcome
    }

    /// Decode untyped records and insert the valid ones as a live batch.
    pub fn ingest_raw(&self, records: Vec<Value>) -> InsertOutcome {
        let mut malformed = 0;
        let events: Vec<Event> = records
            .into_iter()
            .filter_map(|record| match Event::from_value(record) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::debug!("rejected record: {e}");
                    malformed += 1;
                    None
                }
            })
            .collect();
        let mut outcome = self.push_batch(&events);
        outcome.rejected += malformed;
        outcome
    }

    fn publish(&self, accepted: Vec<Event>) {
        self.subscribers.notify(accepted.as_slice());
        let _ = self.sender.send(StoreUpdate::Inserted(accepted.into())); // live listeners
    }

    /// Change the cap, evicting immediately if needed.
    pub fn set_max_events(&self, max_events: usize) -> usize {
        let mut inner = self.write();
        inner.max_events = max_events;
        inner.evict()
    }

    #[must_use]
    pub fn max_events(&self) -> usize {
        self.read().max_events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All events, newest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.read().events.iter().cloned().collect()
    }

    /// Events of one session, newest first.
    #[must_use]
    pub fn events_for_session(&self, session_id: &str) -> Vec<Event> {
        self.read()
            .events
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        {
            let mut inner = self.write();
            inner.events.clear();
            inner.keys.clear();
        }
        let _ = self.sender.send(StoreUpdate::Cleared);
    }

    /// Called with every accepted batch, oldest first.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[Event]) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<StoreUpdate> {
        self.sender.subscribe()
    }

    /// Stream that yields the current snapshot first, then live updates.
    ///
    /// The snapshot is newest-first; each later item holds newly accepted
    /// events oldest-first. Lagged updates are skipped.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, StoreUpdate> {
        let rx = self.get_receiver();
        let snapshot: Arc<[Event]> = self.snapshot().into();

        let hist = futures::stream::iter(std::iter::once(StoreUpdate::Inserted(snapshot)));
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}
