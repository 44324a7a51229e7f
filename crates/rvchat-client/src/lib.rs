//! The rvchat client core.
//!
//! Everything between the consumer-facing RPC surface and the relay
//! server lives here:
//!
//! - [`session`] — the single multiplexed server connection: subscribe,
//!   push, pay, ack, keepalives, reconnect with backoff.
//! - [`rvmanager`] — rendezvous tag → handler routing for inbound blobs.
//! - [`registry`] — per-peer records and ratchet custody.
//! - [`outbox`] — durable at-least-once outbound delivery, FIFO per peer.
//! - [`kx`] — direct, mediated, and reset key exchanges.
//! - [`delivery`] — per-stream sequence IDs, durable replay, acks.
//! - [`gc`] — group-chat membership generations and fan-out.
//! - [`notify`] — the typed notification bus.
//! - [`payment`] — traits the external payment daemon implements.
//! - [`client`] / [`event_loop`] / [`command`] — assembly and the
//!   channel-based command API the RPC layer drives.

pub mod client;
pub mod command;
pub mod delivery;
pub mod event_loop;
pub mod gc;
pub(crate) mod inbound;
pub mod kx;
pub mod notify;
pub mod outbox;
pub mod payment;
pub mod registry;
pub mod rvmanager;
pub mod session;
pub(crate) mod tasks;
pub mod transport;

pub use client::RvClient;
pub use command::ClientCommand;
pub use payment::{ConfirmGate, PaymentClient};
