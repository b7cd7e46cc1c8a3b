//! Engine tuning knobs, loaded from environment variables.
//!
//! Every knob has a compile-time default; `SyncConfig::default()` never
//! touches the environment, which keeps tests hermetic.

use std::time::Duration;

const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_THROTTLE_WINDOW_MS: u64 = 100;
const DEFAULT_THROTTLED_TOPICS: &str = "cursor";
const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 30_000;
const DEFAULT_COMMAND_CAPACITY: usize = 256;
const DEFAULT_CHANNEL_PREFIX: &str = "room:";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// First backoff delay; doubled per failed attempt.
    pub backoff_base: Duration,
    /// Upper bound for a single backoff delay.
    pub backoff_max: Duration,
    /// How long to wait for the transport to report `Subscribed`.
    pub connect_timeout: Duration,
    /// Trailing-edge throttle window for throttled broadcast topics.
    pub throttle_window: Duration,
    /// Broadcast topics whose sends are collapsed per window.
    pub throttled_topics: Vec<String>,
    /// Period of the full reconciliation fetch. `None` disables the timer;
    /// reconciliation on (re)connect still happens.
    pub reconcile_interval: Option<Duration>,
    /// Bounded capacity of each room's command queue.
    pub command_capacity: usize,
    /// Prefix prepended to the room id to form the transport channel name.
    pub channel_prefix: String,
}

impl SyncConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let reconcile_ms = env_parse("SITESYNC_RECONCILE_INTERVAL_MS", DEFAULT_RECONCILE_INTERVAL_MS);
        let topics = std::env::var("SITESYNC_THROTTLED_TOPICS").unwrap_or_else(|_| DEFAULT_THROTTLED_TOPICS.into());

        Self {
            backoff_base: Duration::from_millis(env_parse("SITESYNC_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS)),
            backoff_max: Duration::from_millis(env_parse("SITESYNC_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS)),
            connect_timeout: Duration::from_millis(env_parse(
                "SITESYNC_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )),
            throttle_window: Duration::from_millis(env_parse(
                "SITESYNC_THROTTLE_WINDOW_MS",
                DEFAULT_THROTTLE_WINDOW_MS,
            )),
            throttled_topics: parse_topics(&topics),
            reconcile_interval: (reconcile_ms > 0).then(|| Duration::from_millis(reconcile_ms)),
            command_capacity: env_parse("SITESYNC_COMMAND_CAPACITY", DEFAULT_COMMAND_CAPACITY).max(1),
            channel_prefix: std::env::var("SITESYNC_CHANNEL_PREFIX").unwrap_or_else(|_| DEFAULT_CHANNEL_PREFIX.into()),
        }
    }

    /// Transport channel name for a room.
    #[must_use]
    pub fn channel_name(&self, room_id: &str) -> String {
        format!("{}{room_id}", self.channel_prefix)
    }

    #[must_use]
    pub fn is_throttled(&self, topic: &str) -> bool {
        self.throttled_topics.iter().any(|t| t == topic)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            throttle_window: Duration::from_millis(DEFAULT_THROTTLE_WINDOW_MS),
            throttled_topics: parse_topics(DEFAULT_THROTTLED_TOPICS),
            reconcile_interval: Some(Duration::from_millis(DEFAULT_RECONCILE_INTERVAL_MS)),
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.into(),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_topics(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}
