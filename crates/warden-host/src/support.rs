//! Env-driven tunables and small shared helpers.
//!
//! Every threshold can be overridden (within a clamp) for testing or
//! unusual deployments.

use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;

const DEFAULT_BAD_START_MS: u64 = 10_000;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_HANG_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_HEALTH_PING_INTERVAL_MS: u64 = 15_000;
const DEFAULT_RESOURCE_SAMPLE_INTERVAL_MS: u64 = 5_000;
const DEFAULT_GRACEFUL_TERM_GRACE_MS: u64 = 5_000;

/// Backoff ceiling after repeated bad starts, in seconds.
pub const BACKOFF_CAP_SECS: u64 = 3600;
/// Minimum length of the per-launch comms access key.
pub const COMMS_KEY_LEN: usize = 64;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

/// Uptime below this counts as a bad start and feeds the backoff.
pub fn bad_start_threshold() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_BAD_START_MS")
            .map(|v| v.clamp(1_000, 600_000))
            .unwrap_or(DEFAULT_BAD_START_MS),
    )
}

/// How long a freshly launched server gets to start accepting
/// connections before it is killed.
pub fn startup_timeout() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_STARTUP_TIMEOUT_MS")
            .map(|v| v.clamp(5_000, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS),
    )
}

/// How long the server may go without answering a health ping before
/// it is treated as hung.
pub fn hang_timeout() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_HANG_TIMEOUT_MS")
            .map(|v| v.clamp(10_000, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_HANG_TIMEOUT_MS),
    )
}

pub fn health_ping_interval() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_HEALTH_PING_INTERVAL_MS")
            .map(|v| v.clamp(1_000, 5 * 60 * 1000))
            .unwrap_or(DEFAULT_HEALTH_PING_INTERVAL_MS),
    )
}

pub fn resource_sample_interval() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_RESOURCE_SAMPLE_INTERVAL_MS")
            .map(|v| v.clamp(250, 60_000))
            .unwrap_or(DEFAULT_RESOURCE_SAMPLE_INTERVAL_MS),
    )
}

/// Grace between SIGTERM and SIGKILL when stopping.
pub fn graceful_term_grace() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_GRACEFUL_TERM_GRACE_MS")
            .map(|v| v.clamp(1_000, 60_000))
            .unwrap_or(DEFAULT_GRACEFUL_TERM_GRACE_MS),
    )
}

/// Delay before relaunch after a crash with uptime below the bad-start
/// threshold: `min(2^retries, 3600)` seconds, computed from the retry
/// count before it increments.
pub fn crash_backoff(retries: u32) -> Duration {
    let secs = 1u64
        .checked_shl(retries.min(30))
        .unwrap_or(u64::MAX)
        .min(BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}

/// Fresh access key for one server launch. Alphanumeric only, so it is
/// safe inside command strings, URLs, and shell arguments.
pub fn generate_comms_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(COMMS_KEY_LEN)
        .map(char::from)
        .collect()
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() || parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
