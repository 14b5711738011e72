//! Transport state tracking shared by the backend implementations.

use std::sync::{Mutex, PoisonError};

use hookwatch_core::{ConnectionState, SubscriberSet, Subscription};

use crate::traits::StatusListener;

/// Transport state plus its change listeners.
pub(crate) struct ClientStatus {
    state: Mutex<ConnectionState>,
    listeners: SubscriberSet<ConnectionState>,
    /// Serializes handshakes so concurrent `connect` calls share one.
    pub(crate) connect_gate: tokio::sync::Mutex<()>,
}

impl ClientStatus {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            listeners: SubscriberSet::new(),
            connect_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a transition; listeners only hear about actual changes.
    pub(crate) fn set(&self, next: ConnectionState) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, next)
        };
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "backend status changed");
            self.listeners.notify(&next);
        }
    }

    pub(crate) fn subscribe(&self, listener: StatusListener) -> Subscription {
        self.listeners.subscribe(move |state| listener(*state))
    }
}
