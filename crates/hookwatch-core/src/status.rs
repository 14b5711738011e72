//! Connection status contracts shared by the manager and backend clients.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Freshness of the live stream, derived from the last received event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Unknown,
    Poor,
    Fair,
    Good,
    Excellent,
}

const EXCELLENT_WITHIN: TimeDelta = TimeDelta::seconds(30);
const GOOD_WITHIN: TimeDelta = TimeDelta::seconds(45);
const FAIR_WITHIN: TimeDelta = TimeDelta::seconds(60);

impl ConnectionQuality {
    /// Classify the time elapsed since the last event.
    #[must_use]
    pub fn from_elapsed(elapsed: Option<TimeDelta>) -> Self {
        match elapsed {
            None => Self::Unknown,
            Some(e) if e <= EXCELLENT_WITHIN => Self::Excellent,
            Some(e) if e <= GOOD_WITHIN => Self::Good,
            Some(e) if e <= FAIR_WITHIN => Self::Fair,
            Some(_) => Self::Poor,
        }
    }
}

/// Authoritative connection status published to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub is_healthy: bool,
    pub subscriptions: usize,
    pub reconnect_attempts: u32,
    pub last_event_received: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Connecting,
            is_healthy: false,
            subscriptions: 0,
            reconnect_attempts: 0,
            last_event_received: None,
            last_update: None,
            error: None,
        }
    }
}

impl ConnectionStatus {
    /// Quality as of `now`.
    #[must_use]
    pub fn quality_at(&self, now: DateTime<Utc>) -> ConnectionQuality {
        ConnectionQuality::from_elapsed(self.last_event_received.map(|t| now - t))
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_degrades_with_age() {
        let now = Utc::now();
        let mut status = ConnectionStatus::default();
        assert_eq!(status.quality_at(now), ConnectionQuality::Unknown);

        let cases = [
            (5, ConnectionQuality::Excellent),
            (30, ConnectionQuality::Excellent),
            (40, ConnectionQuality::Good),
            (55, ConnectionQuality::Fair),
            (61, ConnectionQuality::Poor),
            (3600, ConnectionQuality::Poor),
        ];
        for (secs, expected) in cases {
            status.last_event_received = Some(now - TimeDelta::seconds(secs));
            assert_eq!(status.quality_at(now), expected, "{secs}s ago");
        }
    }

    #[test]
    fn default_status_is_connecting() {
        let status = ConnectionStatus::default();
        assert_eq!(status.state, ConnectionState::Connecting);
        assert!(!status.is_connected());
        assert_eq!(status.state.to_string(), "connecting");
    }
}
