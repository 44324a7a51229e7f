//! X25519 key pairs and Diffie-Hellman agreement.
//!
//! The ratchet rotates through ephemeral X25519 pairs; each local
//! identity also carries a long-term X25519 pair used during the
//! initial key agreement. Secret halves are zeroized on drop by
//! `StaticSecret` itself.

use rand::rngs::OsRng;
use rvchat_types::{Result, RvChatError};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

// ---------------------------------------------------------------------------
// DhKeyPair
// ---------------------------------------------------------------------------

/// An X25519 key pair.
///
/// Serializable so it can live inside the durable ratchet state blob;
/// the blob itself is stored under the application directory with
/// owner-only permissions.
#[derive(Clone, Serialize, Deserialize)]
pub struct DhKeyPair {
    secret: [u8; 32],
    public: [u8; 32],
}

impl DhKeyPair {
    /// Generates a fresh pair from OS entropy.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    /// Reconstructs a pair from stored secret bytes.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let ss = StaticSecret::from(secret);
        let public = PublicKey::from(&ss);
        Self {
            secret,
            public: public.to_bytes(),
        }
    }

    /// Returns the public half.
    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    /// Computes the shared secret with a remote public key.
    ///
    /// # Errors
    ///
    /// [`RvChatError::Crypto`] if the agreement lands on the all-zero
    /// point (a contributory-behavior failure, e.g. a low-order remote
    /// key).
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> Result<[u8; 32]> {
        let ss = StaticSecret::from(self.secret);
        let shared = ss.diffie_hellman(&PublicKey::from(*their_public));
        let bytes = shared.to_bytes();
        if bytes == [0u8; 32] {
            return Err(RvChatError::Crypto {
                reason: "X25519 agreement produced the all-zero secret".into(),
            });
        }
        Ok(bytes)
    }
}

// DhKeyPair intentionally has no Debug impl: the secret half must not
// end up in logs.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() -> Result<()> {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();

        let ab = a.diffie_hellman(&b.public())?;
        let ba = b.diffie_hellman(&a.public())?;
        assert_eq!(ab, ba);
        Ok(())
    }

    #[test]
    fn distinct_pairs_distinct_secrets() -> Result<()> {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        let c = DhKeyPair::generate();

        assert_ne!(a.diffie_hellman(&b.public())?, a.diffie_hellman(&c.public())?);
        Ok(())
    }

    #[test]
    fn from_secret_reproduces_public() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::from_secret(a.secret);
        assert_eq!(a.public(), b.public());
    }

    #[test]
    fn low_order_remote_rejected() {
        let a = DhKeyPair::generate();
        // The identity point: agreement with it yields all zeros.
        assert!(a.diffie_hellman(&[0u8; 32]).is_err());
    }
}
