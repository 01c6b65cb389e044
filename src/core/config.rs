use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// Send-side string encoding for command and password text
///
/// The receive side always accepts UTF-8 regardless of this setting;
/// some older game servers reject command bytes above 0x7F, which is
/// what the `Ascii` mode guards against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Pass command text through as UTF-8
    #[default]
    Utf8,
    /// Reject non-ASCII command text before it reaches the wire
    Ascii,
}

impl Encoding {
    /// Validates outgoing text against this encoding
    pub fn validate(&self, text: &str) -> Result<()> {
        match self {
            Encoding::Utf8 => Ok(()),
            Encoding::Ascii if text.is_ascii() => Ok(()),
            Encoding::Ascii => Err(Error::config(format!(
                "non-ASCII text cannot be sent with the ascii encoding: {text:?}"
            ))),
        }
    }
}

/// Exponential backoff policy for the reconnect supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts, or None for unlimited
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnect attempt
    #[serde(with = "super::serde::duration_secs")]
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff_factor: f64,
    /// Upper bound on the delay between attempts
    #[serde(with = "super::serde::duration_secs")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            max_attempts: None,
            initial_delay: Duration::from_secs(3),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectConfig {
    /// Computes the delay before reconnect attempt `attempt` (0-indexed)
    ///
    /// Returns None once `max_attempts` is exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        let base = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        Some(Duration::from_secs_f64(capped))
    }
}

/// Configuration for the RCON connector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Wall-clock limit on the initial login before `connect` gives up
    #[serde(with = "super::serde::duration_secs")]
    pub connection_timeout: Duration,
    /// Time before a sent login packet is considered lost and resent
    #[serde(with = "super::serde::duration_secs")]
    pub login_timeout: Duration,
    /// Per-command response deadline across all retransmissions
    #[serde(with = "super::serde::duration_secs")]
    pub command_timeout: Duration,
    /// Number of times a command is put on the wire before timing out
    pub command_attempts: u32,
    /// Send-side silence period after which a keep-alive probe is issued
    #[serde(with = "super::serde::duration_secs")]
    pub keep_alive_interval: Duration,
    /// Command text used as the keep-alive probe
    ///
    /// Empty by default; game-specific callers may prefer a concrete
    /// command such as "players" so the probe doubles as a cache refresh.
    pub keep_alive_command: String,
    /// Reconnect backoff policy
    pub reconnect: ReconnectConfig,
    /// Size of the server-message dedup window (1..=255)
    pub nonce_window: usize,
    /// Send-side string encoding
    pub encoding: Encoding,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            connection_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(3),
            command_attempts: 3,
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_command: String::new(),
            reconnect: ReconnectConfig::default(),
            nonce_window: 5,
            encoding: Encoding::Utf8,
        }
    }
}

impl ConnectorConfig {
    /// Validates option ranges that cannot be expressed in the type
    pub fn validate(&self) -> Result<()> {
        if self.nonce_window == 0 || self.nonce_window > 255 {
            return Err(Error::config(format!(
                "nonce_window must be within 1-255, not {}",
                self.nonce_window
            )));
        }
        if self.command_attempts == 0 {
            return Err(Error::config("command_attempts must be at least 1"));
        }
        if self.command_timeout.is_zero() || self.login_timeout.is_zero() {
            return Err(Error::config("timeouts must be greater than zero"));
        }
        if self.backoff_factor_invalid() {
            return Err(Error::config(format!(
                "backoff_factor must be 1.0 or greater, not {}",
                self.reconnect.backoff_factor
            )));
        }
        Ok(())
    }

    fn backoff_factor_invalid(&self) -> bool {
        !self.reconnect.backoff_factor.is_finite() || self.reconnect.backoff_factor < 1.0
    }

    /// Interval between retransmissions of a single command
    pub fn command_retry_interval(&self) -> Duration {
        self.command_timeout / self.command_attempts.max(1)
    }
}
