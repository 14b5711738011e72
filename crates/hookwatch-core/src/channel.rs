//! Contract for live-subscription channels.
//!
//! A channel is owned by whichever backend created it. Observers such as
//! the connection manager only hold it weakly and react to the status and
//! system notifications it emits.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::Subscription;

/// Outcome reported by a channel's subscribe primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribed => write!(f, "SUBSCRIBED"),
            Self::ChannelError => write!(f, "CHANNEL_ERROR"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Out-of-band message about the channel itself rather than its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessage {
    /// Downstream extension the message concerns, e.g. `postgres_changes`.
    #[serde(default)]
    pub extension: Option<String>,
    /// `ok` or `error`.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

impl SystemMessage {
    /// A named extension reported a failure.
    #[must_use]
    pub fn is_extension_failure(&self) -> bool {
        self.extension.is_some() && self.status.eq_ignore_ascii_case("error")
    }
}

/// Status callback: the status plus an optional failure message.
pub type StatusCallback = Arc<dyn Fn(ChannelStatus, Option<&str>) + Send + Sync>;

/// System message callback.
pub type SystemCallback = Arc<dyn Fn(&SystemMessage) + Send + Sync>;

/// A live-subscription handle.
///
/// Methods never block: implementations that need I/O spawn it and report
/// the result through the status callback.
pub trait RealtimeChannel: Send + Sync {
    /// Unique topic name of this channel.
    fn topic(&self) -> &str;

    /// Listen for system messages.
    fn on_system(&self, callback: SystemCallback) -> Subscription;

    /// Start (or restart) the subscription. The callback replaces any
    /// previously supplied one and receives every later status change.
    fn subscribe(&self, callback: StatusCallback);

    /// Stop the subscription. Idempotent.
    fn unsubscribe(&self);
}
