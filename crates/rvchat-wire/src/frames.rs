//! Client↔relay frames and their length-prefixed framing.
//!
//! The relay speaks a simple request/notification protocol over TLS:
//! every frame is a u32 big-endian length prefix followed by a JSON
//! body. Blob payloads are hex-encoded inside the body. The relay sees
//! only rendezvous tags and opaque ciphertexts — nothing here reveals
//! message content or peer identities.

use rvchat_types::{Result, RvChatError, RvTag};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::rm::hex_bytes;

/// Hard ceiling on a frame body. Oversized frames are a protocol error,
/// not an allocation.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

// ---------------------------------------------------------------------------
// ClientFrame
// ---------------------------------------------------------------------------

/// Frames the client sends to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body")]
pub enum ClientFrame {
    /// Start streaming blobs that arrive at `rv`.
    Subscribe {
        /// The rendezvous tag to watch.
        rv: RvTag,
        /// Whether this subscription is prepaid.
        paid: bool,
    },

    /// Stop streaming blobs for `rv`.
    Unsubscribe {
        /// The rendezvous tag to drop.
        rv: RvTag,
    },

    /// Upload a blob at `rv`.
    Push {
        /// The rendezvous tag to store under.
        rv: RvTag,
        /// Opaque ciphertext.
        #[serde(with = "hex_bytes")]
        payload: Vec<u8>,
        /// Payment proof (preimage hex) when the push was prepaid.
        payment: Option<String>,
    },

    /// Tell the relay a delivered blob was consumed and may be dropped.
    AckReceived {
        /// The rendezvous tag whose delivery is acknowledged.
        rv: RvTag,
    },

    /// Settle a relay-issued invoice.
    Pay {
        /// The invoice being settled.
        invoice: String,
        /// Proof of settlement.
        preimage: String,
    },

    /// Keepalive probe; the relay answers with [`ServerFrame::Pong`].
    Ping,
}

// ---------------------------------------------------------------------------
// ServerFrame
// ---------------------------------------------------------------------------

/// Frames the relay sends to the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body")]
pub enum ServerFrame {
    /// A blob arrived at a subscribed rendezvous tag.
    PushPayload {
        /// The tag the blob was stored under.
        rv: RvTag,
        /// Opaque ciphertext.
        #[serde(with = "hex_bytes")]
        payload: Vec<u8>,
        /// Relay-assigned delivery identifier, echoed in the ack.
        delivery_id: u64,
    },

    /// The relay requires payment before honoring a paid operation.
    InvoiceRequest {
        /// The rendezvous tag the payment is for.
        rv: RvTag,
        /// Amount in atoms.
        amount_atoms: u64,
        /// The invoice to settle and echo back in [`ClientFrame::Pay`].
        invoice: String,
    },

    /// The relay rejected an operation.
    Error {
        /// Numeric error code.
        code: u32,
        /// Human-readable description.
        text: String,
    },

    /// Answer to [`ClientFrame::Ping`].
    Pong,
}

// ---------------------------------------------------------------------------
// Framed IO
// ---------------------------------------------------------------------------

/// Writes one frame: u32 big-endian length, then the JSON body.
pub async fn write_frame<W, F>(writer: &mut W, frame: &F) -> Result<()>
where
    W: AsyncWrite + Unpin,
    F: Serialize,
{
    let body = serde_json::to_vec(frame).map_err(|e| RvChatError::Malformed {
        reason: format!("frame encoding failed: {e}"),
    })?;
    if body.len() > MAX_FRAME_LEN {
        return Err(RvChatError::Malformed {
            reason: format!("frame body {} exceeds limit {}", body.len(), MAX_FRAME_LEN),
        });
    }

    writer
        .write_u32(body.len() as u32)
        .await
        .map_err(|e| RvChatError::Transport {
            reason: format!("frame length write failed: {e}"),
        })?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| RvChatError::Transport {
            reason: format!("frame body write failed: {e}"),
        })?;
    writer.flush().await.map_err(|e| RvChatError::Transport {
        reason: format!("frame flush failed: {e}"),
    })
}

/// Reads one frame: u32 big-endian length, then the JSON body.
///
/// # Errors
///
/// - [`RvChatError::Transport`] on read failure or EOF.
/// - [`RvChatError::Malformed`] on an oversized length prefix or a body
///   that does not parse.
pub async fn read_frame<R, F>(reader: &mut R) -> Result<F>
where
    R: AsyncRead + Unpin,
    F: for<'de> Deserialize<'de>,
{
    let len = reader.read_u32().await.map_err(|e| RvChatError::Transport {
        reason: format!("frame length read failed: {e}"),
    })? as usize;

    if len > MAX_FRAME_LEN {
        return Err(RvChatError::Malformed {
            reason: format!("frame length {len} exceeds limit {MAX_FRAME_LEN}"),
        });
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| RvChatError::Transport {
            reason: format!("frame body read failed: {e}"),
        })?;

    serde_json::from_slice(&body).map_err(|e| RvChatError::Malformed {
        reason: format!("frame decoding failed: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
