//! Time-windowed event batching.
//!
//! Events are queued as they arrive and released to subscribers as one
//! ordered batch per window, which keeps bursts from turning into one UI
//! update per event.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, task::JoinHandle};

use crate::{Event, SubscriberSet, Subscription};

/// Processing budget per batch at a 60 Hz refresh rate.
pub const FRAME_BUDGET_MS: f64 = 16.0;

/// Batcher tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Time from the first unflushed event until the batch is emitted.
    pub window: Duration,
    /// Emit in arrival order. When off, each batch is sorted by timestamp.
    pub preserve_order: bool,
    /// Queue length that forces an immediate flush.
    pub max_batch_size: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(100),
            preserve_order: true,
            max_batch_size: 500,
        }
    }
}

/// Throughput counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub queue_length: usize,
    pub current_batch_size: usize,
    pub processed_count: u64,
    pub error_count: u64,
    pub average_processing_time_ms: f64,
    pub batch_count: u64,
}

struct Queue {
    pending: VecDeque<Event>,
    config: BatcherConfig,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    destroyed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    // Held for the whole drain-and-notify so batches reach subscribers in
    // the order they were drained.
    delivery: Mutex<()>,
    metrics: Mutex<BatchMetrics>,
    subscribers: SubscriberSet<[Event]>,
}

/// Buffers events and emits them in ordered, time-windowed batches.
///
/// Flushes triggered by the window timer require a tokio runtime; without
/// one, events stay queued until [`EventBatcher::flush`] is called.
/// Subscribers must not call `flush` or `destroy` from inside their callback.
pub struct EventBatcher {
    shared: Arc<Shared>,
}

impl Default for EventBatcher {
    fn default() -> Self {
        Self::new(BatcherConfig::default())
    }
}

impl EventBatcher {
    #[must_use]
    pub fn new(config: BatcherConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    pending: VecDeque::new(),
                    config,
                    timer: None,
                    generation: 0,
                    destroyed: false,
                }),
                delivery: Mutex::new(()),
                metrics: Mutex::new(BatchMetrics::default()),
                subscribers: SubscriberSet::new(),
            }),
        }
    }

    /// Replace the configuration. Applies from the next window.
    pub fn update_config(&self, config: BatcherConfig) {
        let mut queue = self.shared.lock_queue();
        tracing::debug!(
            window_ms = config.window.as_millis(),
            preserve_order = config.preserve_order,
            "batcher config updated"
        );
        queue.config = config;
        if queue.pending.len() >= queue.config.max_batch_size {
            Shared::arm(&self.shared, &mut queue, Duration::ZERO);
        }
    }

    #[must_use]
    pub fn config(&self) -> BatcherConfig {
        self.shared.lock_queue().config.clone()
    }

    /// Queue one event.
    pub fn add_event(&self, event: Event) {
        self.add_events(std::iter::once(event));
    }

    /// Queue several events, keeping their order.
    pub fn add_events(&self, events: impl IntoIterator<Item = Event>) {
        let mut queue = self.shared.lock_queue();
        if queue.destroyed {
            tracing::debug!("event dropped: batcher destroyed");
            return;
        }
        let before = queue.pending.len();
        queue.pending.extend(events);
        if queue.pending.len() == before {
            return;
        }

        if queue.pending.len() >= queue.config.max_batch_size {
            Shared::arm(&self.shared, &mut queue, Duration::ZERO);
        } else if queue.timer.is_none() {
            let window = queue.config.window;
            Shared::arm(&self.shared, &mut queue, window);
        }
    }

    /// Emit whatever is queued right now. Returns the batch size.
    pub fn flush(&self) -> usize {
        self.shared.deliver(None)
    }

    /// Receive every emitted batch.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[Event]) + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(callback)
    }

    #[must_use]
    pub fn metrics(&self) -> BatchMetrics {
        let queue_length = self.shared.lock_queue().pending.len();
        let mut metrics = self.shared.lock_metrics().clone();
        metrics.queue_length = queue_length;
        metrics
    }

    pub fn reset_metrics(&self) {
        *self.shared.lock_metrics() = BatchMetrics::default();
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.lock_queue().destroyed
    }

    /// Flush pending events, stop the timer and drop all subscribers.
    pub fn destroy(&self) {
        if self.is_destroyed() {
            return;
        }
        self.flush();
        {
            let mut queue = self.shared.lock_queue();
            queue.destroyed = true;
            queue.generation += 1;
            if let Some(timer) = queue.timer.take() {
                timer.abort();
            }
        }
        self.shared.subscribers.clear();
        self.reset_metrics();
        tracing::debug!("batcher destroyed");
    }
}

impl Shared {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, BatchMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule a flush `delay` from now, replacing any armed timer.
    fn arm(this: &Arc<Self>, queue: &mut Queue, delay: Duration) {
        if let Some(timer) = queue.timer.take() {
            timer.abort();
        }
        queue.generation += 1;
        let generation = queue.generation;

        let Ok(handle) = Handle::try_current() else {
            tracing::warn!("no runtime for batch timer; waiting for explicit flush");
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(this);
        queue.timer = Some(handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(shared) = weak.upgrade() {
                shared.deliver(Some(generation));
            }
        }));
    }

    fn deliver(&self, expected_generation: Option<u64>) -> usize {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);

        let (mut batch, preserve_order) = {
            let mut queue = self.lock_queue();
            if expected_generation.is_some_and(|g| g != queue.generation) {
                return 0;
            }
            if let Some(timer) = queue.timer.take() {
                // Safe even when called from the timer task itself: the rest
                // of this function never yields.
                timer.abort();
            }
            queue.generation += 1;
            let batch: Vec<Event> = queue.pending.drain(..).collect();
            (batch, queue.config.preserve_order)
        };

        if batch.is_empty() {
            return 0;
        }
        if !preserve_order {
            batch.sort_by_key(|e| e.timestamp);
        }

        let started = Instant::now();
        let failures = self.subscribers.notify(batch.as_slice());
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let size = batch.len();
        {
            let mut metrics = self.lock_metrics();
            #[allow(clippy::cast_precision_loss)]
            let previous = metrics.batch_count as f64;
            metrics.average_processing_time_ms =
                metrics.average_processing_time_ms.mul_add(previous, elapsed_ms) / (previous + 1.0);
            metrics.batch_count += 1;
            metrics.current_batch_size = size;
            metrics.processed_count += size as u64;
            metrics.error_count += failures as u64;
        }

        if elapsed_ms > FRAME_BUDGET_MS {
            tracing::debug!(size, elapsed_ms, "batch exceeded frame budget");
        }
        size
    }
}
