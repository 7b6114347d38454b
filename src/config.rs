// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connector Configuration
//!
//! Reconnect policy of the [`Connector`](crate::connector::Connector) and the
//! protocol options applied when dialing. Both types deserialize with `serde`
//! so they can be loaded from whatever configuration source the application
//! already uses; durations are expressed in milliseconds (seconds for the
//! heartbeat, matching the AMQP negotiation unit).

use serde::Deserialize;
use std::time::Duration;

/// Heartbeat negotiated with the broker when the URI doesn't set one.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);
/// Locale sent in the connection handshake.
pub const DEFAULT_LOCALE: &str = "en_US";
/// Pause after a forced connection close, so the close reaches the dial loop.
pub const DEFAULT_REOPEN_PAUSE: Duration = Duration::from_secs(3);
/// Wait between reconnect attempts.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(1);

/// How a generation reports the failures of its tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAggregation {
    /// Keep the first error observed; later concurrent failures are dropped.
    #[default]
    FirstWins,
    /// Keep every error, in completion order, as [`AmqpError::Multiple`](crate::errors::AmqpError::Multiple).
    CollectAll,
}

/// Reconnect options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// How many dial attempts are made each time the connection is lost.
    ///
    /// The counter is reset after every successful dial, so each break gets
    /// the full budget again. Zero means unlimited.
    pub reconnect_attempts: u32,
    /// Fixed wait between attempts; also the pause between failed consumer generations.
    #[serde(rename = "wait_ms", with = "millis")]
    pub wait: Duration,
    /// Pause after [`Connector::reopen_conn`](crate::connector::Connector::reopen_conn) closed the connection.
    #[serde(rename = "reopen_pause_ms", with = "millis")]
    pub reopen_pause: Duration,
    /// How the failures of one consumer generation are reported.
    pub errors: ErrorAggregation,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            reconnect_attempts: 0,
            wait: DEFAULT_WAIT,
            reopen_pause: DEFAULT_REOPEN_PAUSE,
            errors: ErrorAggregation::default(),
        }
    }
}

impl ConnectorConfig {
    /// Creates a reconnect policy with default pauses and error aggregation.
    ///
    /// # Parameters
    /// * `reconnect_attempts` - Dial attempts per connection loss, `0` for unlimited
    /// * `wait` - Fixed pause between attempts and between failed generations
    ///
    /// # Returns
    /// * `ConnectorConfig` - The policy, ready for the chained setters below
    pub fn new(reconnect_attempts: u32, wait: Duration) -> Self {
        ConnectorConfig {
            reconnect_attempts,
            wait,
            ..Default::default()
        }
    }

    /// Sets the pause taken after a forced reopen of the connection.
    pub fn reopen_pause(mut self, pause: Duration) -> Self {
        self.reopen_pause = pause;
        self
    }

    /// Reports every failure of a generation as [`AmqpError::Multiple`](crate::errors::AmqpError::Multiple)
    /// instead of only the first one.
    pub fn collect_all_errors(mut self) -> Self {
        self.errors = ErrorAggregation::CollectAll;
        self
    }

    /// Attempt budget with zero resolved to unlimited.
    pub(crate) fn attempts(&self) -> u32 {
        match self.reconnect_attempts {
            0 => u32::MAX,
            n => n,
        }
    }
}

/// Protocol options used by [`Connector::dial_config`](crate::connector::Connector::dial_config).
///
/// Wire-level options given in the URI query string (`frame_max`,
/// `channel_max`, `connection_timeout`, ...) are passed through unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DialOptions {
    /// Heartbeat proposed to the broker unless the URI carries one.
    #[serde(rename = "heartbeat_secs", with = "secs")]
    pub heartbeat: Duration,
    pub locale: String,
    /// Shown by the management UI next to the connection.
    pub connection_name: Option<String>,
}

impl Default for DialOptions {
    fn default() -> Self {
        DialOptions {
            heartbeat: DEFAULT_HEARTBEAT,
            locale: DEFAULT_LOCALE.to_owned(),
            connection_name: None,
        }
    }
}

impl DialOptions {
    /// Names the connection on the broker side.
    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    pub fn heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
