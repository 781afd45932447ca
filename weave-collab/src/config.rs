//! Client-side collaboration settings.
//!
//! Everything is read from the environment once, at startup. A missing
//! or empty `WEAVE_SYNC_URL` means collaboration is off and every room
//! runs in local-only mode.

use std::str::FromStr;
use std::time::Duration;

pub const ENV_SYNC_URL: &str = "WEAVE_SYNC_URL";
pub const ENV_PRESENCE_THROTTLE_MS: &str = "WEAVE_PRESENCE_THROTTLE_MS";
pub const ENV_HEARTBEAT_SECS: &str = "WEAVE_HEARTBEAT_SECS";
pub const ENV_RECONNECT_MIN_MS: &str = "WEAVE_RECONNECT_MIN_MS";
pub const ENV_RECONNECT_MAX_MS: &str = "WEAVE_RECONNECT_MAX_MS";

#[derive(Debug, Clone, PartialEq)]
pub struct CollabConfig {
    /// WebSocket URL of the sync server, e.g. `ws://127.0.0.1:9090`.
    pub sync_url: Option<String>,
    /// Minimum gap between outbound cursor updates.
    pub presence_throttle: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            sync_url: None,
            presence_throttle: Duration::from_millis(16),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_min: Duration::from_millis(250),
            reconnect_max: Duration::from_millis(5000),
        }
    }
}

impl CollabConfig {
    /// Enabled configuration pointing at `url`, defaults elsewhere.
    pub fn with_sync_url(url: impl Into<String>) -> Self {
        Self {
            sync_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let sync_url = lookup(ENV_SYNC_URL)
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        let reconnect_min = parse_or(&lookup, ENV_RECONNECT_MIN_MS, defaults.reconnect_min, Duration::from_millis);
        let reconnect_max = parse_or(&lookup, ENV_RECONNECT_MAX_MS, defaults.reconnect_max, Duration::from_millis);

        Self {
            sync_url,
            presence_throttle: parse_or(
                &lookup,
                ENV_PRESENCE_THROTTLE_MS,
                defaults.presence_throttle,
                Duration::from_millis,
            ),
            heartbeat_interval: parse_or(
                &lookup,
                ENV_HEARTBEAT_SECS,
                defaults.heartbeat_interval,
                Duration::from_secs,
            ),
            reconnect_min,
            reconnect_max: reconnect_max.max(reconnect_min),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sync_url.is_some()
    }
}

/// Parse `key` as a number and convert it, falling back to `default`.
pub(crate) fn parse_or<N, T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    convert: impl Fn(N) -> T,
) -> T
where
    N: FromStr,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<N>() {
            Ok(n) => convert(n),
            Err(_) => {
                log::warn!("Ignoring invalid {key}={raw:?}, using default");
                default
            }
        },
    }
}
