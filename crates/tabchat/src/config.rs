use std::env;
use std::time::Duration;

use crate::error::{ChatError, ChatResult};

const DEFAULT_PRESENCE_INTERVAL_MS: u64 = 5_000;
const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_DRAIN_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;
const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CHANNEL_PREFIX: &str = "tabchat-";

/// Timing and naming knobs for one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// How often a PresenceCheck goes out while no connection is active.
    pub presence_interval: Duration,
    /// Minimum spacing between two processed broadcast envelopes.
    pub throttle_interval: Duration,
    /// Cadence of the pending-signal drain ticker.
    pub drain_interval: Duration,
    /// Backoff before retrying a failed or closed connection.
    pub reconnect_delay: Duration,
    /// Abandon a connection stuck negotiating for this long. `None` waits forever.
    pub negotiation_timeout: Option<Duration>,
    /// Consecutive retries before giving up. `None` retries forever.
    pub reconnect_limit: Option<u32>,
    /// Prepended to the channel id to form the broadcast topic.
    pub channel_prefix: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            presence_interval: Duration::from_millis(DEFAULT_PRESENCE_INTERVAL_MS),
            throttle_interval: Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS),
            drain_interval: Duration::from_millis(DEFAULT_DRAIN_INTERVAL_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            negotiation_timeout: Some(Duration::from_millis(DEFAULT_NEGOTIATION_TIMEOUT_MS)),
            reconnect_limit: None,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
        }
    }
}

impl ChatConfig {
    /// Load configuration from `TABCHAT_*` environment variables, keeping the
    /// default for anything missing or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let negotiation_timeout = match env_u64("TABCHAT_NEGOTIATION_TIMEOUT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.negotiation_timeout,
        };
        Self {
            presence_interval: env_millis("TABCHAT_PRESENCE_INTERVAL_MS")
                .unwrap_or(defaults.presence_interval),
            throttle_interval: env_millis("TABCHAT_THROTTLE_INTERVAL_MS")
                .unwrap_or(defaults.throttle_interval),
            drain_interval: env_millis("TABCHAT_DRAIN_INTERVAL_MS")
                .unwrap_or(defaults.drain_interval),
            reconnect_delay: env_millis("TABCHAT_RECONNECT_DELAY_MS")
                .unwrap_or(defaults.reconnect_delay),
            negotiation_timeout,
            reconnect_limit: env::var("TABCHAT_RECONNECT_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(defaults.reconnect_limit),
            channel_prefix: env::var("TABCHAT_CHANNEL_PREFIX")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.channel_prefix),
        }
    }

    /// Reject settings the runtime cannot schedule: the tickers need a
    /// non-zero period and a zero negotiation timeout would abandon every
    /// connection on creation.
    pub fn validate(&self) -> ChatResult<()> {
        let invalid = |reason: &str| Err(ChatError::InvalidConfig(reason.to_string()));
        if self.presence_interval.is_zero() {
            return invalid("presence_interval must be non-zero");
        }
        if self.drain_interval.is_zero() {
            return invalid("drain_interval must be non-zero");
        }
        if self.negotiation_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return invalid("negotiation_timeout must be non-zero, use None to disable it");
        }
        Ok(())
    }

    pub fn with_presence_interval(mut self, interval: Duration) -> Self {
        self.presence_interval = interval;
        self
    }

    pub fn with_throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = interval;
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_reconnect_limit(mut self, limit: Option<u32>) -> Self {
        self.reconnect_limit = limit;
        self
    }

    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }
}

fn env_u64(var: &str) -> Option<u64> {
    env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(var: &str) -> Option<Duration> {
    env_u64(var)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
