//! The rendezvous ratchet.
//!
//! Pairs of peers derive, per direction, an endless sequence of one-time
//! rendezvous tags and message keys. Two key schedules run side by side:
//!
//! - A **tag chain** per direction, seeded at key exchange. It advances
//!   once per message and never resets, so the receiver can always
//!   derive the tags (and header keys) for a window of upcoming
//!   messages without knowing anything about the sender's DH rotations.
//! - A **double ratchet** for message keys: sending and receiving
//!   chains re-keyed through DH steps, giving forward secrecy and
//!   post-compromise recovery. DH rotations are announced in a small
//!   header encrypted under the tag chain's header key, so the receiver
//!   learns the rotation before it needs the rotated chain.
//!
//! [`kx`] covers the initial X3DH-style agreement and the sealed-box
//! encoding used for the key-exchange reply (the one message that
//! cannot ride an existing ratchet). [`ratchet`] is the per-peer,
//! per-direction state machine.

pub mod kx;
pub mod ratchet;

pub use kx::{derive_shared_root, open_sealed, seal_to, SealedBoxed};
pub use ratchet::{Header, Ratchet, RatchetConfig, SendStep};
