//! Wire formats for the rvchat client core.
//!
//! Two layers, both defined here and nowhere else:
//!
//! - [`rm`] — the **routed message**: the end-to-end payload carried
//!   inside a push. A tagged variant over a fixed enumeration, encoded
//!   as canonical JSON with stable field names. The codec never touches
//!   keys; encryption happens in the ratchet.
//! - [`frames`] — the **relay frames**: the client↔server protocol.
//!   Length-prefixed bodies over the TLS transport, with a hard frame
//!   size limit enforced on read.

pub mod frames;
pub mod rm;

pub use frames::{read_frame, write_frame, ClientFrame, ServerFrame, MAX_FRAME_LEN};
pub use rm::{
    decode_rm, encode_rm, GcMetadata, Invitation, KxPhase, RoutedEnvelope, RoutedMessage,
    RM_VERSION,
};
