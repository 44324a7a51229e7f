//! Typed events emitted by the client core to consumers.
//!
//! Stream payloads ([`PmEvent`], [`GcmEvent`], [`KxEvent`], [`PostEvent`],
//! [`PostStatusEvent`]) are the durable records local delivery persists
//! and replays; [`ClientEvent`] is the union the notification bus carries.
//! Both are serde types so they can be written to the pending-record
//! store unchanged.

use serde::{Deserialize, Serialize};

use crate::{GcId, UserId};

// ---------------------------------------------------------------------------
// Stream payloads
// ---------------------------------------------------------------------------

/// A received private message, as delivered on the PM stream.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PmEvent {
    /// Sender identity.
    pub from: UserId,
    /// Sender nick at the time of receipt.
    pub nick: String,
    /// Message text.
    pub msg: String,
    /// Sender-stamped time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// A received group-chat message, as delivered on the GCM stream.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GcmEvent {
    /// Group the message belongs to.
    pub gc: GcId,
    /// Sender identity.
    pub from: UserId,
    /// Sender nick at the time of receipt.
    pub nick: String,
    /// Message text.
    pub msg: String,
    /// Sender-stamped time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// A completed key exchange, as delivered on the KX stream.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KxEvent {
    /// The new peer's identity.
    pub peer: UserId,
    /// The new peer's nick.
    pub nick: String,
    /// Whether this exchange was brokered by a mediator.
    pub mediated: bool,
}

/// A received post, as delivered on the posts stream.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PostEvent {
    /// Author identity.
    pub from: UserId,
    /// Post title.
    pub title: String,
    /// Post body.
    pub content: String,
    /// Author-stamped time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// A post status update (comment or receipt), as delivered on the
/// post-status stream.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PostStatusEvent {
    /// Who produced the status update.
    pub from: UserId,
    /// Hex identifier of the post this refers to.
    pub post_id: String,
    /// Status text ("comment: …", "received", …).
    pub status: String,
    /// Time of the update, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

// ---------------------------------------------------------------------------
// ClientEvent
// ---------------------------------------------------------------------------

/// Union of all events the notification bus delivers.
///
/// Subscribers register for the whole union and match on the variants
/// they care about; async subscribers receive clones through a bounded
/// queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Server connectivity changed. Transport failures surface only as
    /// this notification; reconnection is handled internally.
    Connectivity {
        /// Whether the session is currently connected.
        connected: bool,
        /// Reason for the most recent change.
        reason: String,
    },

    /// A private message arrived and was decrypted.
    PmReceived(PmEvent),

    /// A group-chat message arrived, passed the generation gate, and
    /// was decrypted.
    GcmReceived(GcmEvent),

    /// A key exchange completed and the peer record was created.
    KxCompleted(KxEvent),

    /// A post arrived from a subscribed-to user.
    PostReceived(PostEvent),

    /// A post status update arrived.
    PostStatusReceived(PostStatusEvent),

    /// An outbox entry failed fatally and was dropped.
    SendFailed {
        /// Intended recipient.
        to: UserId,
        /// Why delivery is impossible.
        reason: String,
    },

    /// Group metadata advanced to a new generation.
    GcGenerationUpdated {
        /// The group whose membership changed.
        gc: GcId,
        /// The new generation counter.
        generation: u64,
    },

    /// A tip payment made progress or settled.
    TipProgress {
        /// Recipient of the tip.
        to: UserId,
        /// Amount in atoms.
        amount_atoms: u64,
        /// Whether the payment settled.
        settled: bool,
    },

    /// An internal task failed irrecoverably (a panic caught at a task
    /// boundary). The client keeps serving what it can; consumers
    /// should treat it as degraded.
    Fatal {
        /// Description of the failure, including the task context.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pm_event_serde_roundtrip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let ev = PmEvent {
            from: UserId::new([0x01; 32]),
            nick: "alice".into(),
            msg: "hello".into(),
            timestamp_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&ev)?;
        let parsed: PmEvent = serde_json::from_str(&json)?;
        assert_eq!(ev, parsed);
        Ok(())
    }

    #[test]
    fn kx_event_serde_roundtrip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let ev = KxEvent {
            peer: UserId::new([0x02; 32]),
            nick: "bob".into(),
            mediated: true,
        };
        let json = serde_json::to_string(&ev)?;
        let parsed: KxEvent = serde_json::from_str(&json)?;
        assert_eq!(ev, parsed);
        Ok(())
    }
}
