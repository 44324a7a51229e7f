//! Core shared types for the rvchat relay messaging client.
//!
//! This crate defines all fundamental types used across the workspace.
//! No other crate should define shared types — everything lives here.

pub mod config;
pub mod event;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

/// 32-byte public identity of a peer (or of a local identity).
///
/// Primary key for everything peer-scoped: ratchet state, outbox lanes,
/// aliases. Displayed and parsed as 64 hex characters.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId([u8; 32]);

impl UserId {
    /// The fixed byte length of a user ID.
    pub const LEN: usize = 32;

    /// Creates a new `UserId` from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the full lowercase hex encoding.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 32]> for UserId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for UserId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for UserId {
    type Err = RvChatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| RvChatError::Malformed {
            reason: "invalid hex encoding for user id".into(),
        })?;
        if bytes.len() != 32 {
            return Err(RvChatError::Malformed {
                reason: format!("expected 32 bytes for user id, got {}", bytes.len()),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

// ---------------------------------------------------------------------------
// GcId
// ---------------------------------------------------------------------------

/// 32-byte group-chat identifier, randomly assigned by the group creator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct GcId([u8; 32]);

impl GcId {
    /// The fixed byte length of a group-chat ID.
    pub const LEN: usize = 32;

    /// Creates a new `GcId` from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for GcId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for GcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for GcId {
    type Err = RvChatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| RvChatError::Malformed {
            reason: "invalid hex encoding for group id".into(),
        })?;
        if bytes.len() != 32 {
            return Err(RvChatError::Malformed {
                reason: format!("expected 32 bytes for group id, got {}", bytes.len()),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

// ---------------------------------------------------------------------------
// RvTag
// ---------------------------------------------------------------------------

/// 32-byte rendezvous tag.
///
/// Opaque to the relay server; derived deterministically by both parties
/// from the ratchet state. Tags are one-shot: a blob posted at a tag is
/// consumed exactly once by the receiver, and reuse is a protocol error.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RvTag([u8; 32]);

impl RvTag {
    /// The fixed byte length of a rendezvous tag.
    pub const LEN: usize = 32;

    /// Creates a new `RvTag` from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for RvTag {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for RvTag {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RvTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for RvTag {
    type Err = RvChatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| RvChatError::Malformed {
            reason: "invalid hex encoding for rendezvous tag".into(),
        })?;
        if bytes.len() != 32 {
            return Err(RvChatError::Malformed {
                reason: format!("expected 32 bytes for rendezvous tag, got {}", bytes.len()),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

// ---------------------------------------------------------------------------
// SequenceId
// ---------------------------------------------------------------------------

/// Monotonic per-stream sequence identifier.
///
/// Each consumer stream assigns these in strictly increasing order.
/// Consumers ack up to a sequence ID; acked records are compacted and
/// not replayed on stream re-open.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceId(pub u64);

impl SequenceId {
    /// Returns the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next sequence ID.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// StreamKind
// ---------------------------------------------------------------------------

/// Consumer stream types with durable ack-based replay.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Private messages.
    Pm,
    /// Group-chat messages.
    Gcm,
    /// Completed key exchanges.
    Kx,
    /// Posts from subscribed users.
    Posts,
    /// Post status updates (comments, receipts).
    PostStatus,
}

impl StreamKind {
    /// All stream kinds, in a fixed order.
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Pm,
        StreamKind::Gcm,
        StreamKind::Kx,
        StreamKind::Posts,
        StreamKind::PostStatus,
    ];

    /// Returns the on-disk directory name for this stream.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Pm => "pm",
            Self::Gcm => "gcm",
            Self::Kx => "kx",
            Self::Posts => "posts",
            Self::PostStatus => "poststatus",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// UTC timestamp.
///
/// All timestamps use UTC so that stored records order deterministically
/// regardless of local timezone. Wire and RPC surfaces carry milliseconds
/// since the Unix epoch.
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a `Timestamp` representing the current UTC time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a `Timestamp` from milliseconds since the Unix epoch.
    ///
    /// Out-of-range values clamp to the epoch.
    pub fn from_millis(ms: i64) -> Self {
        match Utc.timestamp_millis_opt(ms) {
            chrono::LocalResult::Single(dt) => Self(dt),
            _ => Self(Utc.timestamp_millis_opt(0).unwrap()),
        }
    }

    /// Returns milliseconds since the Unix epoch.
    pub fn millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns the inner `DateTime<Utc>`.
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// RvChatError
// ---------------------------------------------------------------------------

/// Central error type for the rvchat client core.
///
/// All crates in the workspace convert their internal errors into variants
/// of this enum. Variants group into the classes the client distinguishes
/// operationally: transport errors are recovered by reconnecting, protocol
/// errors discard the offending input (or trigger a reset key exchange),
/// policy errors surface synchronously to the originating call, resource
/// errors stop writes to the affected stream, and fatal errors halt new
/// operations.
#[derive(Debug, Error)]
pub enum RvChatError {
    /// Connection-level failure: dial, TLS, read/write, keepalive missed.
    #[error("transport error: {reason}")]
    Transport {
        /// Human-readable description of the transport failure.
        reason: String,
    },

    /// An operation exceeded its configured deadline.
    #[error("timed out: {reason}")]
    Timeout {
        /// What timed out and after how long.
        reason: String,
    },

    /// Inbound data that does not parse or violates framing limits.
    #[error("malformed input: {reason}")]
    Malformed {
        /// Human-readable description of the parse failure.
        reason: String,
    },

    /// A blob arrived at a rendezvous tag nobody is registered for.
    #[error("unknown rendezvous tag: {reason}")]
    UnknownTag {
        /// The offending tag and context.
        reason: String,
    },

    /// An attempt to register a rendezvous tag that is already registered.
    ///
    /// Indicates protocol desync between the two endpoints.
    #[error("rendezvous tag collision: {reason}")]
    TagCollision {
        /// The colliding tag and context.
        reason: String,
    },

    /// A message arrived ahead of the receiving chain by more than the
    /// skipped-key window allows.
    #[error("message out of order: {reason}")]
    OutOfOrder {
        /// Counter positions involved.
        reason: String,
    },

    /// The two ratchet halves no longer agree; a reset key exchange is
    /// required to resume messaging with this peer.
    #[error("ratchet desync: {reason}")]
    RatchetDesync {
        /// Evidence of the desync.
        reason: String,
    },

    /// A cryptographic operation failed (bad MAC, key derivation, signing).
    #[error("crypto error: {reason}")]
    Crypto {
        /// Human-readable description of the cryptographic failure.
        reason: String,
    },

    /// A payment or paid operation was declined by policy or by the user
    /// confirmation gate.
    #[error("rejected by policy: {reason}")]
    PolicyRejected {
        /// Why the operation was declined.
        reason: String,
    },

    /// The server or a local limiter refused the operation for rate.
    #[error("rate limited: {reason}")]
    RateLimited {
        /// The limit that was hit.
        reason: String,
    },

    /// A durable store operation failed.
    #[error("storage error: {reason}")]
    Storage {
        /// Human-readable description of the storage failure.
        reason: String,
    },

    /// Disk full, quota exceeded, or a stream whose writes were stopped.
    #[error("resource exhausted: {reason}")]
    Resource {
        /// The exhausted resource.
        reason: String,
    },

    /// No peer matches the given alias, nick, or hex prefix.
    #[error("unknown user: {reason}")]
    UserNotFound {
        /// The identifier that failed to resolve.
        reason: String,
    },

    /// A hex prefix matched more than one known peer.
    #[error("ambiguous user: {reason}")]
    AmbiguousUser {
        /// The prefix and how many peers it matched.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    Config {
        /// Human-readable description of the configuration problem.
        reason: String,
    },

    /// Corrupted identity material or an unrecoverable store. The client
    /// reports, stops accepting new operations, and shuts down cleanly.
    #[error("fatal: {reason}")]
    Fatal {
        /// Human-readable description of the unrecoverable condition.
        reason: String,
    },
}

impl RvChatError {
    /// Returns `true` for failures the outbox may retry (network and
    /// server-transient classes). Fatal, policy, and protocol failures
    /// are not retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`RvChatError`].
pub type Result<T> = std::result::Result<T, RvChatError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
