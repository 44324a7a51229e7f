//! Cryptographic primitives for the rvchat client core.
//!
//! Thin, auditable wrappers over the RustCrypto and dalek crates. Policy
//! (what gets derived from what, when keys rotate) lives in the ratchet
//! crate; this crate only exposes mechanisms:
//!
//! - [`hkdf`] — HKDF-SHA256 derivation for chain and message keys.
//! - [`aead`] — XChaCha20-Poly1305 authenticated encryption.
//! - [`dh`] — X25519 key pairs and Diffie-Hellman.
//! - [`signing`] — Ed25519 identity signatures.
//! - [`hash`] — SHA-256 digests.

pub mod aead;
pub mod dh;
pub mod hash;
pub mod hkdf;
pub mod signing;
