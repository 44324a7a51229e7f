//! The user registry: exclusive owner of all peer records and their
//! ratchets.
//!
//! Everything else refers to peers by [`UserId`] only. Ratchet
//! mutations run under a per-peer lock; the registry map itself uses a
//! separate short-lived lock so a slow ratchet operation on one peer
//! never blocks lookups for another. Every ratchet advance is persisted
//! before the corresponding sealed blob is released to the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rvchat_ratchet::Ratchet;
use rvchat_storage::{PeerMeta, PeerStore};
use rvchat_types::{Result, RvChatError, RvTag, Timestamp, UserId};

// ---------------------------------------------------------------------------
// Peer slot
// ---------------------------------------------------------------------------

struct PeerState {
    ratchet: Ratchet,
    meta: PeerMeta,
}

struct PeerSlot {
    uid: UserId,
    state: Mutex<PeerState>,
}

impl PeerSlot {
    /// Acquires the per-peer lock. A poisoned lock (a panic while this
    /// peer's ratchet was held) is reported, never unwrapped past.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PeerState>> {
        self.state.lock().map_err(|e| RvChatError::Storage {
            reason: format!("peer {} lock poisoned: {e}", self.uid),
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Guarded map of peer records backed by the peer store.
pub struct Registry {
    peers: Mutex<HashMap<UserId, Arc<PeerSlot>>>,
    store: PeerStore,
}

impl Registry {
    /// Opens the registry, loading every stored peer.
    pub fn open(store: PeerStore) -> Result<Self> {
        let mut peers = HashMap::new();
        for uid in store.list()? {
            let Some(ratchet) = store.load_ratchet(&uid)? else {
                continue;
            };
            let meta = store.load_meta(&uid)?.unwrap_or(PeerMeta {
                nick: uid.to_string(),
                alias: None,
                last_sent_ms: None,
            });
            peers.insert(
                uid,
                Arc::new(PeerSlot {
                    uid,
                    state: Mutex::new(PeerState { ratchet, meta }),
                }),
            );
        }
        tracing::info!(peers = peers.len(), "registry loaded");
        Ok(Self {
            peers: Mutex::new(peers),
            store,
        })
    }

    /// Creates a peer record from a completed key exchange and persists
    /// it. Replaces any existing record for the same peer (ratchet
    /// reset).
    pub fn install_peer(&self, uid: UserId, nick: String, ratchet: Ratchet) -> Result<()> {
        let meta = match self.store.load_meta(&uid)? {
            // A reset keeps the alias the user assigned.
            Some(existing) => PeerMeta {
                nick,
                alias: existing.alias,
                last_sent_ms: existing.last_sent_ms,
            },
            None => PeerMeta {
                nick,
                alias: None,
                last_sent_ms: None,
            },
        };

        self.store.save_ratchet(&uid, &ratchet)?;
        self.store.save_meta(&uid, &meta)?;

        let slot = Arc::new(PeerSlot {
            uid,
            state: Mutex::new(PeerState { ratchet, meta }),
        });
        self.map_lock()?.insert(uid, slot);
        Ok(())
    }

    /// Removes a peer entirely ("forget user").
    pub fn forget(&self, uid: &UserId) -> Result<()> {
        self.map_lock()?.remove(uid);
        self.store.remove(uid)
    }

    /// Returns `true` if the peer exists. Degrades to `false` if the
    /// map lock is poisoned.
    pub fn knows(&self, uid: &UserId) -> bool {
        match self.peers.lock() {
            Ok(map) => map.contains_key(uid),
            Err(e) => {
                tracing::warn!(error = %e, "registry map lock poisoned");
                false
            }
        }
    }

    /// All known peers with metadata. Peers whose per-peer lock is
    /// poisoned are skipped with a warning.
    pub fn list(&self) -> Vec<(UserId, PeerMeta)> {
        let slots: Vec<Arc<PeerSlot>> = match self.peers.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "registry map lock poisoned, listing no peers");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for slot in slots {
            match slot.lock() {
                Ok(state) => out.push((slot.uid, state.meta.clone())),
                Err(e) => tracing::warn!(error = %e, "skipping peer in listing"),
            }
        }
        out.sort_by_key(|(uid, _)| *uid);
        out
    }

    /// Returns a peer's nick.
    pub fn nick_of(&self, uid: &UserId) -> Result<String> {
        let slot = self.slot(uid)?;
        let state = slot.lock()?;
        Ok(state.meta.nick.clone())
    }

    /// Assigns or clears a peer's alias.
    ///
    /// # Errors
    ///
    /// [`RvChatError::Config`] if the alias is already assigned to a
    /// different peer (aliases are unique per local identity).
    pub fn set_alias(&self, uid: &UserId, alias: Option<String>) -> Result<()> {
        if let Some(alias) = &alias {
            for (other, meta) in self.list() {
                if &other != uid && meta.alias.as_deref() == Some(alias.as_str()) {
                    return Err(RvChatError::Config {
                        reason: format!("alias '{alias}' already assigned to {other}"),
                    });
                }
            }
        }

        let slot = self.slot(uid)?;
        let mut state = slot.lock()?;
        state.meta.alias = alias;
        self.store.save_meta(uid, &state.meta)
    }

    /// Resolves a user string: alias first, then nick, then an
    /// unambiguous hex prefix of the UserId.
    pub fn lookup(&self, user: &str) -> Result<UserId> {
        let all = self.list();

        if let Some((uid, _)) = all
            .iter()
            .find(|(_, meta)| meta.alias.as_deref() == Some(user))
        {
            return Ok(*uid);
        }

        if let Some((uid, _)) = all.iter().find(|(_, meta)| meta.nick == user) {
            return Ok(*uid);
        }

        let lowered = user.to_ascii_lowercase();
        if !lowered.is_empty() && lowered.chars().all(|c| c.is_ascii_hexdigit()) {
            let matches: Vec<&UserId> = all
                .iter()
                .map(|(uid, _)| uid)
                .filter(|uid| uid.to_string().starts_with(&lowered))
                .collect();
            match matches.len() {
                1 => return Ok(*matches[0]),
                0 => {}
                n => {
                    return Err(RvChatError::AmbiguousUser {
                        reason: format!("prefix '{user}' matches {n} peers"),
                    })
                }
            }
        }

        Err(RvChatError::UserNotFound {
            reason: format!("no peer matches '{user}'"),
        })
    }

    /// Seals a plaintext for `uid`, persisting the advanced ratchet
    /// before returning the blob.
    pub fn seal_for(&self, uid: &UserId, plaintext: &[u8]) -> Result<(RvTag, Vec<u8>)> {
        let slot = self.slot(uid)?;
        let mut state = slot.lock()?;

        let step = state.ratchet.seal(plaintext)?;
        // Durable before the push: a crash after this point retries the
        // same sealed blob, never a second ratchet step.
        self.store.save_ratchet(uid, &state.ratchet)?;

        Ok((step.tag, step.blob))
    }

    /// Opens a blob that arrived at one of `uid`'s expected tags,
    /// persisting the advanced ratchet. Returns the plaintext and the
    /// peer's current receive window for re-registration.
    pub fn open_for(&self, uid: &UserId, tag: &RvTag, blob: &[u8]) -> Result<(Vec<u8>, Vec<RvTag>)> {
        let slot = self.slot(uid)?;
        let mut state = slot.lock()?;

        let plaintext = state.ratchet.open(tag, blob)?;
        self.store.save_ratchet(uid, &state.ratchet)?;

        Ok((plaintext, state.ratchet.recv_tags()))
    }

    /// Current receive window of a peer.
    pub fn recv_tags(&self, uid: &UserId) -> Result<Vec<RvTag>> {
        let slot = self.slot(uid)?;
        let state = slot.lock()?;
        Ok(state.ratchet.recv_tags())
    }

    /// Whether the peer's sending chain is usable.
    pub fn can_send(&self, uid: &UserId) -> Result<bool> {
        let slot = self.slot(uid)?;
        let state = slot.lock()?;
        Ok(state.ratchet.can_send())
    }

    /// Records a successful send time.
    pub fn mark_sent(&self, uid: &UserId) -> Result<()> {
        let slot = self.slot(uid)?;
        let mut state = slot.lock()?;
        state.meta.last_sent_ms = Some(Timestamp::now().millis());
        self.store.save_meta(uid, &state.meta)
    }

    fn slot(&self, uid: &UserId) -> Result<Arc<PeerSlot>> {
        self.map_lock()?
            .get(uid)
            .cloned()
            .ok_or_else(|| RvChatError::UserNotFound {
                reason: format!("unknown peer {uid}"),
            })
    }

    fn map_lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<UserId, Arc<PeerSlot>>>> {
        self.peers.lock().map_err(|e| RvChatError::Storage {
            reason: format!("registry map lock poisoned: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rvchat_crypto::dh::DhKeyPair;
    use rvchat_ratchet::RatchetConfig;

    fn uid(b: u8) -> UserId {
        UserId::new([b; 32])
    }

    fn inviter_ratchet() -> Ratchet {
        Ratchet::new_inviter(
            [0x42; 32],
            DhKeyPair::generate().public(),
            RatchetConfig { window: 4 },
        )
        .unwrap()
    }

    fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(PeerStore::new(dir.path(), 1)).unwrap();
        (dir, registry)
    }

    #[test]
    fn install_and_lookup_by_nick() -> Result<()> {
        let (_dir, registry) = registry();
        registry.install_peer(uid(1), "alice".into(), inviter_ratchet())?;

        assert_eq!(registry.lookup("alice")?, uid(1));
        assert!(registry.knows(&uid(1)));
        Ok(())
    }

    #[test]
    fn alias_takes_precedence_over_nick() -> Result<()> {
        let (_dir, registry) = registry();
        registry.install_peer(uid(1), "alice".into(), inviter_ratchet())?;
        registry.install_peer(uid(2), "bob".into(), inviter_ratchet())?;

        // Alias "alice" on bob's record shadows alice's nick.
        registry.set_alias(&uid(2), Some("alice".into()))?;
        assert_eq!(registry.lookup("alice")?, uid(2));
        Ok(())
    }

    #[test]
    fn duplicate_alias_rejected() -> Result<()> {
        let (_dir, registry) = registry();
        registry.install_peer(uid(1), "alice".into(), inviter_ratchet())?;
        registry.install_peer(uid(2), "bob".into(), inviter_ratchet())?;

        registry.set_alias(&uid(1), Some("pal".into()))?;
        assert!(registry.set_alias(&uid(2), Some("pal".into())).is_err());
        Ok(())
    }

    #[test]
    fn hex_prefix_resolution() -> Result<()> {
        let (_dir, registry) = registry();
        registry.install_peer(uid(0x11), "alice".into(), inviter_ratchet())?;
        registry.install_peer(uid(0x12), "bob".into(), inviter_ratchet())?;

        assert_eq!(registry.lookup("1111")?, uid(0x11));
        // "1" matches both 0x11... and 0x12...
        assert!(matches!(
            registry.lookup("1"),
            Err(RvChatError::AmbiguousUser { .. })
        ));
        assert!(matches!(
            registry.lookup("ff"),
            Err(RvChatError::UserNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn seal_persists_ratchet_advance() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::new(dir.path(), 1);
        let registry = Registry::open(store)?;
        registry.install_peer(uid(1), "alice".into(), inviter_ratchet())?;

        let (tag1, _) = registry.seal_for(&uid(1), b"one")?;

        // A registry reopened from disk continues after the consumed
        // step instead of reusing it.
        let reopened = Registry::open(PeerStore::new(dir.path(), 1))?;
        let (tag2, _) = reopened.seal_for(&uid(1), b"two")?;
        assert_ne!(tag1, tag2);
        Ok(())
    }

    #[test]
    fn forget_removes_everything() -> Result<()> {
        let (_dir, registry) = registry();
        registry.install_peer(uid(1), "alice".into(), inviter_ratchet())?;
        registry.forget(&uid(1))?;

        assert!(!registry.knows(&uid(1)));
        assert!(matches!(
            registry.seal_for(&uid(1), b"x"),
            Err(RvChatError::UserNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn reset_install_keeps_alias() -> Result<()> {
        let (_dir, registry) = registry();
        registry.install_peer(uid(1), "alice".into(), inviter_ratchet())?;
        registry.set_alias(&uid(1), Some("al".into()))?;

        // Fresh ratchet after a reset key exchange.
        registry.install_peer(uid(1), "alice".into(), inviter_ratchet())?;
        assert_eq!(registry.lookup("al")?, uid(1));
        Ok(())
    }
}
