//! Durable on-disk stores for the rvchat client core.
//!
//! Everything lives under one application directory:
//!
//! ```text
//! <app_dir>/
//!   id/identity              long-term identity key material
//!   peers/<uid-hex>/ratchet  per-peer ratchet state
//!   peers/<uid-hex>/meta     nick, alias, last-send time
//!   outbox/<uid-hex>/<seq>   pending routed messages, FIFO per peer
//!   streams/<stream>/seq     last-emitted sequence ID
//!   streams/<stream>/pending un-acked event records
//! ```
//!
//! Every write goes through [`backup::write_durable`]: the new content
//! lands in a temp file, the previous file is renamed to a timestamped
//! backup, the temp file takes its place, and backups beyond the
//! configured depth are pruned. Writes are fsynced before the rename so
//! a ratchet advance is on disk before the matching network push.

pub mod backup;
pub mod gcs;
pub mod identity;
pub mod outbox;
pub mod peers;
pub mod streams;

pub use identity::{IdentityStore, LocalIdentity};
pub use gcs::GcStore;
pub use outbox::{OutboxEntry, OutboxState, OutboxStore, SealedRm};
pub use peers::{PeerMeta, PeerStore};
pub use streams::{PendingRecord, StreamStore};
