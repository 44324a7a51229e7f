//! Long-term identity key material.
//!
//! One blob at `id/identity`: the Ed25519 signing pair, the long-term
//! X25519 pair, the local nick, and the network name. A network
//! mismatch on load is fatal — stores must not be mixed across
//! networks.

use std::path::{Path, PathBuf};

use rvchat_crypto::{dh::DhKeyPair, signing::SigningPair};
use rvchat_types::{Result, RvChatError, UserId};
use serde::{Deserialize, Serialize};

use crate::backup;

// ---------------------------------------------------------------------------
// LocalIdentity
// ---------------------------------------------------------------------------

/// The local user's long-term key material.
#[derive(Clone, Serialize, Deserialize)]
pub struct LocalIdentity {
    /// Ed25519 signing pair; its public key is our [`UserId`].
    pub signing: SigningPair,
    /// Long-term X25519 pair used in key exchanges.
    pub dh: DhKeyPair,
    /// Nick presented to new peers.
    pub nick: String,
    /// Network this identity belongs to.
    pub network: String,
}

impl LocalIdentity {
    /// Generates a fresh identity.
    pub fn generate(nick: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            signing: SigningPair::generate(),
            dh: DhKeyPair::generate(),
            nick: nick.into(),
            network: network.into(),
        }
    }

    /// Returns our identity.
    pub fn user_id(&self) -> UserId {
        self.signing.user_id()
    }
}

// ---------------------------------------------------------------------------
// IdentityStore
// ---------------------------------------------------------------------------

/// Loads and persists the identity blob.
pub struct IdentityStore {
    path: PathBuf,
    backup_depth: usize,
}

impl IdentityStore {
    /// Creates a store rooted at `app_dir`.
    pub fn new(app_dir: &Path, backup_depth: usize) -> Self {
        Self {
            path: app_dir.join("id").join("identity"),
            backup_depth,
        }
    }

    /// Loads the identity, verifying it belongs to `network`.
    ///
    /// # Errors
    ///
    /// - [`RvChatError::Fatal`] if the blob exists but is corrupt or
    ///   belongs to a different network.
    pub fn load(&self, network: &str) -> Result<Option<LocalIdentity>> {
        let bytes = match backup::read_optional(&self.path)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let identity: LocalIdentity =
            serde_json::from_slice(&bytes).map_err(|e| RvChatError::Fatal {
                reason: format!("corrupt identity blob: {e}"),
            })?;

        if identity.network != network {
            return Err(RvChatError::Fatal {
                reason: format!(
                    "identity belongs to network '{}', client configured for '{network}'",
                    identity.network
                ),
            });
        }

        Ok(Some(identity))
    }

    /// Persists the identity.
    pub fn save(&self, identity: &LocalIdentity) -> Result<()> {
        let bytes = serde_json::to_vec(identity).map_err(|e| RvChatError::Storage {
            reason: format!("identity encoding failed: {e}"),
        })?;
        backup::write_durable(&self.path, &bytes, self.backup_depth)
    }

    /// Loads the identity or generates and persists a fresh one.
    pub fn load_or_generate(&self, nick: &str, network: &str) -> Result<LocalIdentity> {
        if let Some(identity) = self.load(network)? {
            return Ok(identity);
        }
        let identity = LocalIdentity::generate(nick, network);
        self.save(&identity)?;
        tracing::info!(uid = %identity.user_id(), "generated fresh identity");
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_persists_and_reloads() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path(), 2);

        let id1 = store.load_or_generate("alice", "simnet")?;
        let id2 = store.load_or_generate("ignored", "simnet")?;
        assert_eq!(id1.user_id(), id2.user_id());
        assert_eq!(id2.nick, "alice");
        Ok(())
    }

    #[test]
    fn network_mismatch_is_fatal() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path(), 2);

        store.load_or_generate("alice", "simnet")?;
        let result = store.load("mainnet");
        assert!(matches!(result, Err(RvChatError::Fatal { .. })));
        Ok(())
    }

    #[test]
    fn missing_identity_loads_none() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path(), 2);
        assert!(store.load("simnet")?.is_none());
        Ok(())
    }
}
