//! Durable outbox: per-peer FIFO of outbound routed messages.
//!
//! One file per entry under `outbox/<uid-hex>/<seq>`, where `<seq>` is
//! a zero-padded per-peer counter. An entry is written (and fsynced)
//! before its first push attempt and removed only on server ack, which
//! gives at-least-once delivery across crashes. Per-peer file order is
//! the delivery order.

use std::path::{Path, PathBuf};

use rvchat_types::{Result, RvChatError, RvTag, Timestamp, UserId};
use serde::{Deserialize, Serialize};

use crate::backup;

// ---------------------------------------------------------------------------
// OutboxState
// ---------------------------------------------------------------------------

/// Delivery state of an outbox entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OutboxState {
    /// Durably recorded, not yet handed to the session.
    Queued,
    /// Handed to the session, awaiting server ack.
    Sending,
    /// Acked by the server; the entry is about to be removed.
    Acked,
    /// Gave up; `retriable` distinguishes backoff exhaustion from a
    /// fatal condition such as a forgotten peer.
    Failed {
        /// Whether the failure class was retriable.
        retriable: bool,
    },
}

// ---------------------------------------------------------------------------
// SealedRm
// ---------------------------------------------------------------------------

/// The sealed form of an entry, recorded once a ratchet step has been
/// consumed for it. Retries re-push this exact blob: re-sealing would
/// burn another step and deliver the message twice.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedRm {
    /// Rendezvous tag the blob must be pushed at.
    pub tag: RvTag,
    /// The sealed ciphertext.
    pub blob: Vec<u8>,
}

// ---------------------------------------------------------------------------
// OutboxEntry
// ---------------------------------------------------------------------------

/// A queued outbound routed message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Per-peer sequence number; also the file name.
    pub seq: u64,
    /// Target peer.
    pub to: UserId,
    /// Encoded plaintext routed-message envelope.
    pub rm: Vec<u8>,
    /// Sealed form, present once a ratchet step was consumed. Persisted
    /// before the first push attempt.
    pub sealed: Option<SealedRm>,
    /// Lower is more urgent. Control messages use 0, user messages 1.
    pub priority: u8,
    /// Push attempts so far.
    pub attempts: u32,
    /// Payment proof hint for paid pushes.
    pub payment_hint: Option<String>,
    /// Current delivery state.
    pub state: OutboxState,
    /// When the entry was enqueued.
    pub queued_at: Timestamp,
}

// ---------------------------------------------------------------------------
// OutboxStore
// ---------------------------------------------------------------------------

/// Durable per-peer FIFO store.
pub struct OutboxStore {
    root: PathBuf,
    backup_depth: usize,
}

impl OutboxStore {
    /// Creates a store rooted at `app_dir`.
    pub fn new(app_dir: &Path, backup_depth: usize) -> Self {
        Self {
            root: app_dir.join("outbox"),
            backup_depth,
        }
    }

    fn peer_dir(&self, uid: &UserId) -> PathBuf {
        self.root.join(uid.hex())
    }

    fn entry_path(&self, uid: &UserId, seq: u64) -> PathBuf {
        self.peer_dir(uid).join(format!("{seq:020}"))
    }

    /// Appends an entry for `to`, assigning the next per-peer sequence
    /// number. The entry is durable when this returns.
    pub fn append(
        &self,
        to: UserId,
        rm: Vec<u8>,
        priority: u8,
        payment_hint: Option<String>,
    ) -> Result<OutboxEntry> {
        let seq = self.next_seq(&to)?;
        let entry = OutboxEntry {
            seq,
            to,
            rm,
            sealed: None,
            priority,
            attempts: 0,
            payment_hint,
            state: OutboxState::Queued,
            queued_at: Timestamp::now(),
        };
        self.persist(&entry)?;
        Ok(entry)
    }

    /// Rewrites an entry in place (attempt counts, state changes).
    pub fn persist(&self, entry: &OutboxEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry).map_err(|e| RvChatError::Storage {
            reason: format!("outbox entry encoding failed: {e}"),
        })?;
        backup::write_durable(&self.entry_path(&entry.to, entry.seq), &bytes, self.backup_depth)
    }

    /// Removes an entry after server ack (or fatal failure).
    pub fn remove(&self, uid: &UserId, seq: u64) -> Result<()> {
        let path = self.entry_path(uid, seq);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RvChatError::Storage {
                reason: format!("remove outbox entry {}: {e}", path.display()),
            }),
        }
    }

    /// Loads all pending entries for one peer, FIFO order.
    pub fn load_peer(&self, uid: &UserId) -> Result<Vec<OutboxEntry>> {
        let dir = self.peer_dir(uid);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RvChatError::Storage {
                    reason: format!("read outbox directory {}: {e}", dir.display()),
                })
            }
        };

        let mut loaded = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Skip temp files and rotated backups.
            if !name.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let bytes = backup::read_optional(&entry.path())?.unwrap_or_default();
            match serde_json::from_slice::<OutboxEntry>(&bytes) {
                Ok(e) => loaded.push(e),
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "skipping corrupt outbox entry");
                }
            }
        }
        loaded.sort_by_key(|e| e.seq);
        Ok(loaded)
    }

    /// Loads all pending entries grouped per peer.
    pub fn load_all(&self) -> Result<Vec<(UserId, Vec<OutboxEntry>)>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RvChatError::Storage {
                    reason: format!("read outbox root: {e}"),
                })
            }
        };

        let mut all = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(uid) = name.parse::<UserId>() else { continue };
            let peer_entries = self.load_peer(&uid)?;
            if !peer_entries.is_empty() {
                all.push((uid, peer_entries));
            }
        }
        all.sort_by_key(|(uid, _)| *uid);
        Ok(all)
    }

    fn next_seq(&self, uid: &UserId) -> Result<u64> {
        Ok(self
            .load_peer(uid)?
            .last()
            .map(|e| e.seq + 1)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(b: u8) -> UserId {
        UserId::new([b; 32])
    }

    #[test]
    fn append_assigns_fifo_sequence() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = OutboxStore::new(dir.path(), 1);

        let a = store.append(uid(1), b"rm-a".to_vec(), 1, None)?;
        let b = store.append(uid(1), b"rm-b".to_vec(), 1, None)?;
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);

        let loaded = store.load_peer(&uid(1))?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].rm, b"rm-a");
        assert_eq!(loaded[1].rm, b"rm-b");
        Ok(())
    }

    #[test]
    fn sequences_are_per_peer() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = OutboxStore::new(dir.path(), 1);

        store.append(uid(1), b"x".to_vec(), 1, None)?;
        let other = store.append(uid(2), b"y".to_vec(), 1, None)?;
        assert_eq!(other.seq, 0);
        Ok(())
    }

    #[test]
    fn remove_on_ack() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = OutboxStore::new(dir.path(), 1);

        let e = store.append(uid(1), b"x".to_vec(), 1, None)?;
        store.remove(&uid(1), e.seq)?;
        assert!(store.load_peer(&uid(1))?.is_empty());
        Ok(())
    }

    #[test]
    fn entries_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = OutboxStore::new(dir.path(), 1);
            store.append(uid(1), b"persisted".to_vec(), 0, Some("hint".into()))?;
        }
        let store = OutboxStore::new(dir.path(), 1);
        let all = store.load_all()?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1[0].rm, b"persisted");
        assert_eq!(all[0].1[0].payment_hint.as_deref(), Some("hint"));
        Ok(())
    }

    #[test]
    fn attempt_update_persists() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = OutboxStore::new(dir.path(), 1);

        let mut e = store.append(uid(1), b"x".to_vec(), 1, None)?;
        e.attempts = 3;
        e.state = OutboxState::Sending;
        store.persist(&e)?;

        let loaded = store.load_peer(&uid(1))?;
        assert_eq!(loaded[0].attempts, 3);
        assert_eq!(loaded[0].state, OutboxState::Sending);
        Ok(())
    }
}
