//! Server advice steering reconnect and heartbeat policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_INTERVAL;

/// Reconnect policy hint carried in [`Advice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Reconnect {
    /// Keep the session: reconnect the transport and resume.
    Retry,
    /// Re-handshake for a fresh `clientId` before resuming.
    Handshake,
    /// Do not reconnect automatically.
    None,
}

/// Server-provided `{reconnect, interval}` hints.
///
/// Incoming advice replaces the stored value wholesale; fields the server
/// omits fall back to their defaults rather than the previous values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advice {
    #[serde(default = "default_reconnect")]
    pub reconnect: Reconnect,
    /// Heartbeat and retry pacing, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval: u64,
}

fn default_reconnect() -> Reconnect {
    Reconnect::Retry
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL.as_millis() as u64
}

impl Default for Advice {
    fn default() -> Self {
        Self {
            reconnect: Reconnect::Retry,
            interval: default_interval_ms(),
        }
    }
}

impl Advice {
    /// The `interval` field as a [`Duration`].
    pub fn interval_duration(&self) -> Duration {
        Duration::from_millis(self.interval)
    }
}
