//! Tunables for connections and the arbiter.
//!
//! Everything has a working default; outer layers can deserialize these from
//! whatever format they use (missing fields fall back to the defaults).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{Backoff, RetryPolicy};
use crate::transport::{BAUD_RATE, DEFAULT_SERIAL_NODE, RFCOMM_CHANNEL};

/// Connection-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Local node tried before anything else when it exists.
    pub serial_node: Option<PathBuf>,
    pub baud_rate: u32,
    pub rfcomm_channel: u8,
    /// Connect timeout and per-read/write timeout of the transport.
    pub io_timeout: Duration,
    /// Pause after each control byte so the firmware can act on it.
    pub command_delay: Duration,
    /// Policy for configuration, stop and battery bytes.
    pub write_policy: RetryPolicy,
    /// Policy for the channel-mask byte that starts streaming.
    pub channel_policy: RetryPolicy,
    /// Upper bound on bytes discarded while realigning during one read.
    /// `None` leaves the read deadline as the only bound.
    pub max_resync_bytes: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            serial_node: Some(PathBuf::from(DEFAULT_SERIAL_NODE)),
            baud_rate: BAUD_RATE,
            rfcomm_channel: RFCOMM_CHANNEL,
            io_timeout: Duration::from_secs(5),
            command_delay: Duration::from_millis(50),
            write_policy: RetryPolicy::new(1, Backoff::Fixed(Duration::from_millis(100))),
            channel_policy: RetryPolicy::new(3, Backoff::Linear(Duration::from_millis(150))),
            max_resync_bytes: None,
        }
    }
}

/// Request-level settings used by the [`Arbiter`](crate::arbiter::Arbiter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Attempts of the whole open/start/read sequence.
    pub max_attempts: u32,
    /// Wait before attempt `k + 1` after attempt `k` failed.
    pub retry_backoff: Backoff,
    /// Deadline of a single read call.
    pub read_timeout: Duration,
    /// Talk to the in-memory device instead of hardware.
    pub use_simulator: bool,
    /// Pace simulated frames at the configured sampling rate.
    pub simulator_realtime: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Backoff::Linear(Duration::from_millis(200)),
            read_timeout: Duration::from_secs(10),
            use_simulator: false,
            simulator_realtime: true,
        }
    }
}

impl ArbiterConfig {
    /// Defaults overridden by `BITALINO_USE_SIMULATOR` (or `USE_MOCK_DEVICE`)
    /// and `BITALINO_READ_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(flag) = env::var("BITALINO_USE_SIMULATOR")
            .or_else(|_| env::var("USE_MOCK_DEVICE"))
            .ok()
            .as_deref()
            .and_then(parse_flag)
        {
            config.use_simulator = flag;
        }
        if let Some(timeout) = env::var("BITALINO_READ_TIMEOUT_SECS")
            .ok()
            .as_deref()
            .and_then(parse_secs)
        {
            config.read_timeout = timeout;
        }
        config
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_secs(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_protocol() {
        let config = ConnectionConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.rfcomm_channel, 1);
        assert_eq!(config.channel_policy.max_attempts(), 4);
        assert_eq!(
            config.channel_policy.backoff.delay(2),
            Duration::from_millis(300)
        );

        let arbiter = ArbiterConfig::default();
        assert_eq!(arbiter.max_attempts, 3);
        assert_eq!(arbiter.retry_backoff.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn flags_and_seconds() {
        assert_eq!(parse_flag(" TRUE "), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
        assert_eq!(parse_secs("2.5"), Some(Duration::from_millis(2500)));
        assert_eq!(parse_secs("0"), None);
        assert_eq!(parse_secs("-1"), None);
        assert_eq!(parse_secs("soon"), None);
    }
}
