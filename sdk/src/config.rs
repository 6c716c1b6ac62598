//! Configuration constants and tunables for voice connections.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Length of one audio frame in milliseconds.
pub const FRAME_MILLIS: u64 = 20;

/// Duration of one audio frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(FRAME_MILLIS);

/// RTP timestamp increment per frame (20 ms at 48 kHz).
pub const SAMPLES_PER_FRAME: u32 = 960;

/// Size of one frame read from a raw pre-encoded audio file.
pub const FILE_FRAME_SIZE: usize = 900;

/// Buffer size for reading datagrams.
pub const DATAGRAM_BUFFER_SIZE: usize = 2048;

/// How long a closing session waits for its writer to flush.
pub const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// How long a disconnect waits for the gateway session to stop before aborting it.
pub const SESSION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Events kept for an unread event stream; newer events are dropped once full.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Default time allowed for a connect or move to complete its handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 15_000;

/// Default number of consecutive reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay before the first reconnect attempt; doubles up to 8x.
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Default time to wait for the IP discovery reply.
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 2_000;

/// Tunables shared by every connection of a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceConfig {
    pub handshake_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub discovery_timeout: Duration,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            discovery_timeout: Duration::from_millis(DEFAULT_DISCOVERY_TIMEOUT_MS),
        }
    }
}

impl VoiceConfig {
    /// Reads `VOICELINK_*` env vars, falling back to defaults for missing or invalid values.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn read<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
            lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        }

        Self {
            handshake_timeout: Duration::from_millis(read(
                &lookup,
                "VOICELINK_HANDSHAKE_TIMEOUT_MS",
                DEFAULT_HANDSHAKE_TIMEOUT_MS,
            )),
            max_reconnect_attempts: read(
                &lookup,
                "VOICELINK_MAX_RECONNECT_ATTEMPTS",
                DEFAULT_MAX_RECONNECT_ATTEMPTS,
            ),
            reconnect_base_delay: Duration::from_millis(read(
                &lookup,
                "VOICELINK_RECONNECT_BASE_DELAY_MS",
                DEFAULT_RECONNECT_BASE_DELAY_MS,
            )),
            discovery_timeout: Duration::from_millis(read(
                &lookup,
                "VOICELINK_DISCOVERY_TIMEOUT_MS",
                DEFAULT_DISCOVERY_TIMEOUT_MS,
            )),
        }
    }

    /// Backoff before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base_delay * 2u32.pow(attempt.saturating_sub(1).min(3))
    }
}
