//! Ambient configuration: the numeric parameters the design calls out by
//! value. No file parsing lives here -- loading these from disk is the job
//! of the excluded CLI/config collaborator.

use std::time::Duration;

/// TTL (seconds) written alongside every `:ping` key. A gateway that stops
/// refreshing its ping disappears from the directory once this elapses.
pub const MAX_TTL: usize = 15;

/// Default timeout waiting for a remote gateway's public key to appear
/// before a flip request is abandoned.
pub const DEFAULT_FLIP_KEY_POLL_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound on retries for a failed local-adapter registration before
/// it is dropped with a log line.
pub const DEFAULT_REGISTRATION_RETRY_LIMIT: u32 = 5;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Connection-checker ping frequency against each hub (default 5 Hz).
    pub ping_interval: Duration,
    /// Watcher reconciliation tick rate (default 2 Hz).
    pub watch_interval: Duration,
    /// How long `send_flip_request` polls for the remote public key.
    pub flip_key_poll_timeout: Duration,
    /// Initial hub reconnect backoff.
    pub reconnect_backoff_initial: Duration,
    /// Reconnect backoff cap.
    pub reconnect_backoff_max: Duration,
    /// Missed consecutive application-level hub checks before declaring loss.
    pub checker_failure_threshold: u32,
    /// Retry bound for a failed local-adapter registration.
    pub registration_retry_limit: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            ping_interval: Duration::from_millis(200), // 5 Hz
            watch_interval: Duration::from_millis(500), // 2 Hz
            flip_key_poll_timeout: DEFAULT_FLIP_KEY_POLL_TIMEOUT,
            reconnect_backoff_initial: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(32),
            checker_failure_threshold: 3,
            registration_retry_limit: DEFAULT_REGISTRATION_RETRY_LIMIT,
        }
    }
}
