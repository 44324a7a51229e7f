//! Ed25519 identity signatures.
//!
//! Each local identity holds one long-term Ed25519 pair; its public key
//! bytes are the [`rvchat_types::UserId`]. Invitations and group
//! metadata updates are signed with it.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rvchat_types::{Result, RvChatError, UserId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SigningPair
// ---------------------------------------------------------------------------

/// An Ed25519 signing key pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct SigningPair {
    secret: [u8; 32],
}

impl SigningPair {
    /// Generates a fresh pair from OS entropy.
    pub fn generate() -> Self {
        let key = SigningKey::generate(&mut OsRng);
        Self {
            secret: key.to_bytes(),
        }
    }

    /// Reconstructs a pair from stored secret bytes.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    /// Returns the public key bytes, which double as the identity's
    /// `UserId`.
    pub fn public(&self) -> [u8; 32] {
        SigningKey::from_bytes(&self.secret)
            .verifying_key()
            .to_bytes()
    }

    /// Returns the identity derived from the public key.
    pub fn user_id(&self) -> UserId {
        UserId::new(self.public())
    }

    /// Signs a message, returning the 64-byte signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.secret).sign(msg).to_bytes()
    }
}

/// Verifies an Ed25519 signature against a public key.
///
/// # Errors
///
/// [`RvChatError::Crypto`] if the public key is invalid or the
/// signature does not verify.
pub fn verify(public: &[u8; 32], msg: &[u8], signature: &[u8; 64]) -> Result<()> {
    let key = VerifyingKey::from_bytes(public).map_err(|e| RvChatError::Crypto {
        reason: format!("invalid Ed25519 public key: {e}"),
    })?;
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    key.verify(msg, &sig).map_err(|_| RvChatError::Crypto {
        reason: "Ed25519 signature verification failed".into(),
    })
}
