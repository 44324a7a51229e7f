//! Per-peer durable state: ratchet blobs and metadata.
//!
//! One directory per peer under `peers/<uid-hex>/`, holding `ratchet`
//! (the serialized [`Ratchet`]) and `meta` (nick, alias, last-send
//! time). The registry writes the ratchet blob before every network
//! push that consumed a ratchet step.

use std::path::{Path, PathBuf};

use rvchat_ratchet::Ratchet;
use rvchat_types::{Result, RvChatError, UserId};
use serde::{Deserialize, Serialize};

use crate::backup;

// ---------------------------------------------------------------------------
// PeerMeta
// ---------------------------------------------------------------------------

/// Non-key peer metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerMeta {
    /// Nick the peer presented during key exchange.
    pub nick: String,
    /// Local, user-assigned alias. Unique per local identity.
    pub alias: Option<String>,
    /// Milliseconds since epoch of the last successful send, if any.
    pub last_sent_ms: Option<i64>,
}

// ---------------------------------------------------------------------------
// PeerStore
// ---------------------------------------------------------------------------

/// Durable store of per-peer blobs.
pub struct PeerStore {
    root: PathBuf,
    backup_depth: usize,
}

impl PeerStore {
    /// Creates a store rooted at `app_dir`.
    pub fn new(app_dir: &Path, backup_depth: usize) -> Self {
        Self {
            root: app_dir.join("peers"),
            backup_depth,
        }
    }

    fn peer_dir(&self, uid: &UserId) -> PathBuf {
        self.root.join(uid.hex())
    }

    /// Persists a peer's ratchet state. Must complete before the
    /// network push that consumed the corresponding step.
    pub fn save_ratchet(&self, uid: &UserId, ratchet: &Ratchet) -> Result<()> {
        let bytes = serde_json::to_vec(ratchet).map_err(|e| RvChatError::Storage {
            reason: format!("ratchet encoding failed: {e}"),
        })?;
        backup::write_durable(&self.peer_dir(uid).join("ratchet"), &bytes, self.backup_depth)
    }

    /// Loads a peer's ratchet state.
    pub fn load_ratchet(&self, uid: &UserId) -> Result<Option<Ratchet>> {
        let bytes = match backup::read_optional(&self.peer_dir(uid).join("ratchet"))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let ratchet = serde_json::from_slice(&bytes).map_err(|e| RvChatError::Storage {
            reason: format!("corrupt ratchet blob for {uid}: {e}"),
        })?;
        Ok(Some(ratchet))
    }

    /// Persists a peer's metadata.
    pub fn save_meta(&self, uid: &UserId, meta: &PeerMeta) -> Result<()> {
        let bytes = serde_json::to_vec(meta).map_err(|e| RvChatError::Storage {
            reason: format!("peer meta encoding failed: {e}"),
        })?;
        backup::write_durable(&self.peer_dir(uid).join("meta"), &bytes, self.backup_depth)
    }

    /// Loads a peer's metadata.
    pub fn load_meta(&self, uid: &UserId) -> Result<Option<PeerMeta>> {
        let bytes = match backup::read_optional(&self.peer_dir(uid).join("meta"))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let meta = serde_json::from_slice(&bytes).map_err(|e| RvChatError::Storage {
            reason: format!("corrupt peer meta for {uid}: {e}"),
        })?;
        Ok(Some(meta))
    }

    /// Lists all peers with a stored ratchet.
    pub fn list(&self) -> Result<Vec<UserId>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RvChatError::Storage {
                    reason: format!("read peers directory: {e}"),
                })
            }
        };

        let mut peers = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match name.parse::<UserId>() {
                Ok(uid) => peers.push(uid),
                Err(_) => {
                    tracing::warn!(dir = %name, "ignoring non-peer directory under peers/");
                }
            }
        }
        peers.sort();
        Ok(peers)
    }

    /// Removes all durable state for a peer ("forget user").
    pub fn remove(&self, uid: &UserId) -> Result<()> {
        let dir = self.peer_dir(uid);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RvChatError::Storage {
                reason: format!("remove peer directory {}: {e}", dir.display()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvchat_crypto::dh::DhKeyPair;
    use rvchat_ratchet::RatchetConfig;

    fn uid(b: u8) -> UserId {
        UserId::new([b; 32])
    }

    fn test_ratchet() -> Ratchet {
        Ratchet::new_inviter(
            [0x42; 32],
            DhKeyPair::generate().public(),
            RatchetConfig { window: 4 },
        )
        .unwrap()
    }

    #[test]
    fn ratchet_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::new(dir.path(), 2);

        let ratchet = test_ratchet();
        let expected = ratchet.next_send_rv()?;

        store.save_ratchet(&uid(1), &ratchet)?;
        let loaded = store.load_ratchet(&uid(1))?.unwrap();
        assert_eq!(loaded.next_send_rv()?, expected);
        Ok(())
    }

    #[test]
    fn meta_roundtrip_and_list() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::new(dir.path(), 2);

        store.save_ratchet(&uid(1), &test_ratchet())?;
        store.save_meta(
            &uid(1),
            &PeerMeta {
                nick: "alice".into(),
                alias: Some("al".into()),
                last_sent_ms: None,
            },
        )?;
        store.save_ratchet(&uid(2), &test_ratchet())?;
        store.save_meta(
            &uid(2),
            &PeerMeta {
                nick: "bob".into(),
                alias: None,
                last_sent_ms: Some(5),
            },
        )?;

        assert_eq!(store.list()?, vec![uid(1), uid(2)]);
        assert_eq!(store.load_meta(&uid(1))?.unwrap().alias.as_deref(), Some("al"));
        Ok(())
    }

    #[test]
    fn remove_forgets_peer() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::new(dir.path(), 2);

        store.save_ratchet(&uid(1), &test_ratchet())?;
        store.remove(&uid(1))?;
        assert!(store.load_ratchet(&uid(1))?.is_none());
        assert!(store.list()?.is_empty());

        // Removing twice is fine.
        store.remove(&uid(1))?;
        Ok(())
    }
}
