//! Routed messages: the end-to-end payload enumeration and its codec.
//!
//! A [`RoutedEnvelope`] is what one peer encrypts for another: a version
//! byte, the sender identity, and a [`RoutedMessage`] variant. On the
//! wire the variant is adjacently tagged (`"tag"` / `"payload"` fields),
//! so the serialized form carries exactly `version`, `sender`, `tag`,
//! and `payload` — field names are part of the protocol and must not
//! change.
//!
//! Encoding is deterministic: serde_json emits struct fields in
//! declaration order, so encoding the same value twice yields identical
//! bytes.

use rvchat_types::{GcId, Result, RvChatError, RvTag, UserId};
use serde::{Deserialize, Serialize};

/// Current routed-message envelope version.
pub const RM_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// GcMetadata
// ---------------------------------------------------------------------------

/// Group-chat metadata, authored exclusively by the group admin.
///
/// `generation` increments on every membership change; receivers accept
/// group messages only at their current generation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GcMetadata {
    /// Group identifier.
    pub id: GcId,
    /// Human-readable group name.
    pub name: String,
    /// The admin's identity. Only updates signed off by this identity
    /// are accepted.
    pub admin: UserId,
    /// Current member list, admin included.
    pub members: Vec<UserId>,
    /// Strictly increasing membership generation.
    pub generation: u64,
}

impl GcMetadata {
    /// Returns `true` if `uid` is a member of this group.
    pub fn is_member(&self, uid: &UserId) -> bool {
        self.members.contains(uid)
    }
}

// ---------------------------------------------------------------------------
// Invitation
// ---------------------------------------------------------------------------

/// Out-of-band key-exchange invitation.
///
/// Carried as an opaque blob between the parties (file, QR, or inside a
/// [`RoutedMessage::MediateKx`] when a common peer couriers it).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    /// Inviter's long-term identity (Ed25519 public key bytes).
    pub from: UserId,
    /// Inviter's nick, informational only until the exchange completes.
    pub nick: String,
    /// Relay server the responder should use, `host:port`.
    pub server: String,
    /// Rendezvous tag where the inviter listens for the reply.
    pub initial_rv: RvTag,
    /// Inviter's long-term X25519 public key.
    pub dh_pub: [u8; 32],
    /// Fresh ephemeral X25519 public key for this invitation.
    pub ephemeral_pub: [u8; 32],
}

// ---------------------------------------------------------------------------
// KxPhase
// ---------------------------------------------------------------------------

/// Phase marker inside a key-exchange step message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum KxPhase {
    /// Responder's answer at the invitation rendezvous.
    Reply,
    /// Inviter's confirmation, the first message on the new ratchet.
    Confirm,
    /// Request for a fresh ratchet with an already-known peer.
    Reset,
}

// ---------------------------------------------------------------------------
// RoutedMessage
// ---------------------------------------------------------------------------

/// The fixed enumeration of end-to-end payloads.
///
/// Dispatch over these variants is exhaustive at the receiver; adding a
/// variant is a protocol change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "payload")]
pub enum RoutedMessage {
    /// Private message.
    Pm {
        /// Message text.
        msg: String,
        /// Sender-stamped time, milliseconds since the Unix epoch.
        timestamp_ms: i64,
    },

    /// Group-chat message.
    GroupMessage {
        /// Target group.
        gc: GcId,
        /// Sender's last-seen membership generation.
        generation: u64,
        /// Message text.
        msg: String,
        /// Sender-stamped time, milliseconds since the Unix epoch.
        timestamp_ms: i64,
    },

    /// Admin invites the recipient into a group.
    GroupInvite {
        /// Metadata of the group being joined, at the current generation.
        meta: GcMetadata,
        /// Invite token echoed back in the join answer.
        token: u64,
    },

    /// Recipient answers a group invite.
    GroupJoin {
        /// Group being answered.
        gc: GcId,
        /// Token from the invite.
        token: u64,
        /// Whether the invite was accepted.
        accept: bool,
    },

    /// Admin-authored membership update, fanned out to all members.
    GroupList {
        /// The new metadata; `generation` must be strictly greater than
        /// the receiver's current value.
        meta: GcMetadata,
    },

    /// A request for the group's current metadata, sent to the admin
    /// when a message arrives from a future generation.
    GroupUpdateRequest {
        /// Group whose metadata is requested.
        gc: GcId,
        /// The requester's current generation.
        generation: u64,
    },

    /// Content post, broadcast to post subscribers.
    Post {
        /// Post title.
        title: String,
        /// Post body.
        content: String,
        /// Author-stamped time, milliseconds since the Unix epoch.
        timestamp_ms: i64,
    },

    /// Status update about an earlier post.
    PostStatus {
        /// Hex identifier of the post.
        post_id: String,
        /// Status text.
        status: String,
        /// Time of the update, milliseconds since the Unix epoch.
        timestamp_ms: i64,
    },

    /// Ask the recipient to add the sender to its post subscribers.
    PostSubscribe {},

    /// Ask the recipient to remove the sender from its post subscribers.
    PostUnsubscribe {},

    /// A tip payment announcement.
    Tip {
        /// Amount in atoms.
        amount_atoms: u64,
    },

    /// Progress report for an in-flight tip.
    TipProgress {
        /// Amount in atoms.
        amount_atoms: u64,
        /// Whether the payment settled.
        settled: bool,
        /// Attempt counter.
        attempt: u32,
    },

    /// Key-exchange step (reply, confirm, or reset).
    KxStep {
        /// Which phase this step belongs to.
        phase: KxPhase,
        /// Sender's long-term identity.
        from: UserId,
        /// Sender's nick.
        nick: String,
        /// Sender's long-term X25519 public key.
        dh_pub: [u8; 32],
        /// Fresh ephemeral X25519 public key for this exchange.
        ephemeral_pub: [u8; 32],
        /// Rendezvous tag where the sender listens for the next step.
        step_rv: RvTag,
    },

    /// Courier a key-exchange invitation between two strangers via a
    /// common peer.
    MediateKx {
        /// The stranger the invitation is destined for.
        target: UserId,
        /// The invitation being couriered.
        invitation: Invitation,
    },

    /// One chunk of an out-of-band file transfer.
    FileFrame {
        /// File name, as offered by the sender.
        name: String,
        /// Zero-based chunk index.
        chunk_index: u32,
        /// Total number of chunks.
        chunk_count: u32,
        /// Chunk bytes.
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },

    /// Liveness probe between peers.
    Ping {},
}

// ---------------------------------------------------------------------------
// RoutedEnvelope
// ---------------------------------------------------------------------------

/// The plaintext a ratchet message key encrypts: version, sender, and
/// one routed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutedEnvelope {
    /// Envelope version; currently always [`RM_VERSION`].
    pub version: u8,
    /// Sender identity. Authenticated transitively: only the ratchet
    /// partner holds the message key.
    pub sender: UserId,
    /// The payload variant, serialized adjacently tagged.
    #[serde(flatten)]
    pub rm: RoutedMessage,
}

impl RoutedEnvelope {
    /// Wraps a routed message in a current-version envelope.
    pub fn new(sender: UserId, rm: RoutedMessage) -> Self {
        Self {
            version: RM_VERSION,
            sender,
            rm,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Encodes an envelope as canonical JSON bytes.
///
/// Deterministic: the same envelope always produces identical bytes.
pub fn encode_rm(envelope: &RoutedEnvelope) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|e| RvChatError::Malformed {
        reason: format!("routed message encoding failed: {e}"),
    })
}

/// Decodes canonical JSON bytes into an envelope.
///
/// # Errors
///
/// [`RvChatError::Malformed`] on parse failure or an unsupported
/// version.
pub fn decode_rm(bytes: &[u8]) -> Result<RoutedEnvelope> {
    let envelope: RoutedEnvelope =
        serde_json::from_slice(bytes).map_err(|e| RvChatError::Malformed {
            reason: format!("routed message decoding failed: {e}"),
        })?;
    if envelope.version != RM_VERSION {
        return Err(RvChatError::Malformed {
            reason: format!("unsupported routed message version {}", envelope.version),
        });
    }
    Ok(envelope)
}

// ---------------------------------------------------------------------------
// hex serde helper
// ---------------------------------------------------------------------------

/// Serializes `Vec<u8>` as a hex string instead of a JSON number array.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(b: u8) -> UserId {
        UserId::new([b; 32])
    }

    #[test]
    fn encode_decode_pm_roundtrip() -> Result<()> {
        let env = RoutedEnvelope::new(
            uid(0xAA),
            RoutedMessage::Pm {
                msg: "hello".into(),
                timestamp_ms: 1_700_000_000_000,
            },
        );
        let bytes = encode_rm(&env)?;
        let decoded = decode_rm(&bytes)?;
        assert_eq!(env, decoded);
        Ok(())
    }

    #[test]
    fn encoding_is_deterministic() -> Result<()> {
        let env = RoutedEnvelope::new(
            uid(0x01),
            RoutedMessage::GroupMessage {
                gc: GcId::new([0x05; 32]),
                generation: 4,
                msg: "gm".into(),
                timestamp_ms: 1,
            },
        );
        assert_eq!(encode_rm(&env)?, encode_rm(&env)?);
        Ok(())
    }

    #[test]
    fn tag_and_payload_field_names_stable() -> Result<()> {
        let env = RoutedEnvelope::new(
            uid(0x01),
            RoutedMessage::Pm {
                msg: "x".into(),
                timestamp_ms: 0,
            },
        );
        let json: serde_json::Value = serde_json::from_slice(&encode_rm(&env)?).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["tag"], "Pm");
        assert_eq!(json["payload"]["msg"], "x");
        Ok(())
    }

    #[test]
    fn every_variant_roundtrips() -> Result<()> {
        let meta = GcMetadata {
            id: GcId::new([0x09; 32]),
            name: "room".into(),
            admin: uid(0x02),
            members: vec![uid(0x02), uid(0x03)],
            generation: 3,
        };
        let invitation = Invitation {
            from: uid(0x04),
            nick: "carol".into(),
            server: "relay:443".into(),
            initial_rv: RvTag::new([0x11; 32]),
            dh_pub: [0x22; 32],
            ephemeral_pub: [0x33; 32],
        };
        let variants = vec![
            RoutedMessage::Pm { msg: "a".into(), timestamp_ms: 1 },
            RoutedMessage::GroupMessage {
                gc: meta.id,
                generation: 3,
                msg: "b".into(),
                timestamp_ms: 2,
            },
            RoutedMessage::GroupInvite { meta: meta.clone(), token: 99 },
            RoutedMessage::GroupJoin { gc: meta.id, token: 99, accept: true },
            RoutedMessage::GroupList { meta: meta.clone() },
            RoutedMessage::GroupUpdateRequest { gc: meta.id, generation: 3 },
            RoutedMessage::Post {
                title: "t".into(),
                content: "c".into(),
                timestamp_ms: 3,
            },
            RoutedMessage::PostStatus {
                post_id: "ab".into(),
                status: "received".into(),
                timestamp_ms: 4,
            },
            RoutedMessage::PostSubscribe {},
            RoutedMessage::PostUnsubscribe {},
            RoutedMessage::Tip { amount_atoms: 1_000 },
            RoutedMessage::TipProgress { amount_atoms: 1_000, settled: false, attempt: 1 },
            RoutedMessage::KxStep {
                phase: KxPhase::Reply,
                from: uid(0x05),
                nick: "dan".into(),
                dh_pub: [0x44; 32],
                ephemeral_pub: [0x55; 32],
                step_rv: RvTag::new([0x66; 32]),
            },
            RoutedMessage::MediateKx { target: uid(0x06), invitation },
            RoutedMessage::FileFrame {
                name: "f.bin".into(),
                chunk_index: 0,
                chunk_count: 2,
                data: vec![1, 2, 3],
            },
            RoutedMessage::Ping {},
        ];

        for rm in variants {
            let env = RoutedEnvelope::new(uid(0xFF), rm);
            let decoded = decode_rm(&encode_rm(&env)?)?;
            assert_eq!(env, decoded);
        }
        Ok(())
    }

    #[test]
    fn malformed_bytes_rejected() {
        assert!(decode_rm(b"not json").is_err());
        assert!(decode_rm(b"{}").is_err());
    }

    #[test]
    fn unknown_version_rejected() -> Result<()> {
        let env = RoutedEnvelope::new(uid(0x01), RoutedMessage::Ping {});
        let mut json: serde_json::Value = serde_json::from_slice(&encode_rm(&env)?).unwrap();
        json["version"] = serde_json::json!(9);
        let bytes = serde_json::to_vec(&json).unwrap();
        assert!(decode_rm(&bytes).is_err());
        Ok(())
    }

    #[test]
    fn file_frame_data_is_hex_string() -> Result<()> {
        let env = RoutedEnvelope::new(
            uid(0x01),
            RoutedMessage::FileFrame {
                name: "f".into(),
                chunk_index: 0,
                chunk_count: 1,
                data: vec![0xDE, 0xAD],
            },
        );
        let json: serde_json::Value = serde_json::from_slice(&encode_rm(&env)?).unwrap();
        assert_eq!(json["payload"]["data"], "dead");
        Ok(())
    }
}
