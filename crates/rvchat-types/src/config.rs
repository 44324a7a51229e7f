//! Client configuration with sensible defaults.
//!
//! All operational parameters are centralized here and passed as an
//! explicit options structure at construction. There is no module-wide
//! or global configuration state.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, RvChatError};

// ---------------------------------------------------------------------------
// PaidPolicy
// ---------------------------------------------------------------------------

/// Policy for paid pushes and paid subscriptions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PaidPolicy {
    /// Pay server invoices without asking.
    Always,
    /// Ask the user confirmation gate before paying.
    Confirm,
    /// Decline all paid operations.
    Never,
}

// ---------------------------------------------------------------------------
// BackoffConfig
// ---------------------------------------------------------------------------

/// Exponential backoff parameters for outbox retries and reconnects.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First retry delay in milliseconds.
    pub base_ms: u64,
    /// Maximum delay in milliseconds; the doubling sequence caps here.
    pub cap_ms: u64,
    /// Retriable attempts before an entry is declared failed.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 60_000,
            max_attempts: 10,
        }
    }
}

impl BackoffConfig {
    /// Delay before the attempt with the given zero-based index.
    ///
    /// Formula: `min(base * 2^attempt, cap)`. Clamped so large attempt
    /// counts cannot overflow.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let shifted = self
            .base_ms
            .checked_shl(attempt.min(32))
            .unwrap_or(u64::MAX);
        shifted.min(self.cap_ms)
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Options structure for the rvchat client core.
///
/// Every long-lived task and store receives its parameters from here;
/// defaults match the values a fresh installation uses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Network name ("mainnet", "testnet", "simnet"). Recorded in the
    /// identity blob and checked on load so stores are not mixed across
    /// networks.
    pub network: String,

    /// Nick presented to new peers during key exchange.
    pub nick: String,

    /// Relay server address as `host:port`.
    pub server: String,

    /// Root of the on-disk application data layout.
    pub app_dir: PathBuf,

    /// Maximum number of skipped message keys cached per peer direction.
    /// Arrivals further ahead than this fail decryption.
    pub ratchet_window: usize,

    /// Outbox retry backoff parameters.
    pub outbox_backoff: BackoffConfig,

    /// Interval between keepalive pings on the server session.
    pub keepalive_interval: Duration,

    /// How paid pushes and subscriptions are authorized.
    pub paid_policy: PaidPolicy,

    /// Deadline for a key-exchange attempt; expired attempts clean up
    /// their pending rendezvous subscriptions.
    pub kx_timeout: Duration,

    /// Maximum concurrent in-flight operations per class (subscribe,
    /// push, pay, ack) on the server session.
    pub inflight_window: usize,

    /// Rotating backups retained per durable file.
    pub backup_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".into(),
            nick: "anonymous".into(),
            server: "127.0.0.1:12345".into(),
            app_dir: PathBuf::from(".rvchat"),
            ratchet_window: 64,
            outbox_backoff: BackoffConfig::default(),
            keepalive_interval: Duration::from_secs(30),
            paid_policy: PaidPolicy::Confirm,
            kx_timeout: Duration::from_secs(120),
            inflight_window: 16,
            backup_depth: 5,
        }
    }
}

impl ClientConfig {
    /// Validates all configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.network.is_empty() {
            return Err(RvChatError::Config {
                reason: "network must not be empty".into(),
            });
        }

        if self.nick.is_empty() {
            return Err(RvChatError::Config {
                reason: "nick must not be empty".into(),
            });
        }

        if self.server.is_empty() {
            return Err(RvChatError::Config {
                reason: "server address must not be empty".into(),
            });
        }

        if self.ratchet_window == 0 {
            return Err(RvChatError::Config {
                reason: "ratchet_window must be greater than 0".into(),
            });
        }

        if self.outbox_backoff.base_ms == 0 {
            return Err(RvChatError::Config {
                reason: "outbox_backoff.base_ms must be greater than 0".into(),
            });
        }

        if self.outbox_backoff.cap_ms < self.outbox_backoff.base_ms {
            return Err(RvChatError::Config {
                reason: "outbox_backoff.cap_ms must be >= base_ms".into(),
            });
        }

        if self.keepalive_interval < Duration::from_secs(1) {
            return Err(RvChatError::Config {
                reason: "keepalive_interval must be at least 1 second".into(),
            });
        }

        if self.inflight_window == 0 {
            return Err(RvChatError::Config {
                reason: "inflight_window must be greater than 0".into(),
            });
        }

        Ok(())
    }
}
