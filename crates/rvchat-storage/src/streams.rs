//! Durable consumer-stream records: sequence counters and un-acked
//! events.
//!
//! Per stream, `streams/<stream>/seq` holds the last-emitted sequence
//! ID and `streams/<stream>/pending` the un-acked records. A record is
//! persisted before the event is emitted to subscribers; acking up to a
//! sequence ID marks records and the compactor drops acked ones. On
//! stream re-open, records above the consumer's `unacked_from` replay
//! in order.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rvchat_types::{Result, RvChatError, SequenceId, StreamKind, Timestamp};
use serde::{Deserialize, Serialize};

use crate::backup;

// ---------------------------------------------------------------------------
// PendingRecord
// ---------------------------------------------------------------------------

/// One durable, possibly un-acked stream event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingRecord {
    /// Assigned sequence ID.
    pub sequence_id: u64,
    /// The serialized event payload.
    pub payload: serde_json::Value,
    /// Whether the consumer has acked this record.
    pub acked: bool,
    /// When the record was created.
    pub recorded_at: Timestamp,
}

// ---------------------------------------------------------------------------
// StreamStore
// ---------------------------------------------------------------------------

/// Durable store for one consumer stream.
///
/// All mutations hold the internal lock and persist before returning,
/// so a crash never loses an assignment that a subscriber observed.
pub struct StreamStore {
    kind: StreamKind,
    dir: PathBuf,
    backup_depth: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    last_seq: u64,
    pending: Vec<PendingRecord>,
}

impl StreamStore {
    /// Opens (or initializes) the store for `kind` under `app_dir`.
    pub fn open(app_dir: &Path, kind: StreamKind, backup_depth: usize) -> Result<Self> {
        let dir = app_dir.join("streams").join(kind.dir_name());

        let last_seq = match backup::read_optional(&dir.join("seq"))? {
            Some(bytes) => String::from_utf8_lossy(&bytes)
                .trim()
                .parse::<u64>()
                .map_err(|e| RvChatError::Storage {
                    reason: format!("corrupt sequence counter for {kind}: {e}"),
                })?,
            None => 0,
        };

        let pending = match backup::read_optional(&dir.join("pending"))? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| RvChatError::Storage {
                reason: format!("corrupt pending records for {kind}: {e}"),
            })?,
            None => Vec::new(),
        };

        Ok(Self {
            kind,
            dir,
            backup_depth,
            inner: Mutex::new(Inner { last_seq, pending }),
        })
    }

    /// Assigns the next sequence ID to `payload` and persists the
    /// record. Returns the assigned ID.
    pub fn record(&self, payload: serde_json::Value) -> Result<SequenceId> {
        let mut inner = self.lock()?;
        let seq = inner.last_seq + 1;

        inner.pending.push(PendingRecord {
            sequence_id: seq,
            payload,
            acked: false,
            recorded_at: Timestamp::now(),
        });
        inner.last_seq = seq;

        self.persist(&inner)?;
        Ok(SequenceId(seq))
    }

    /// Marks all records with `sequence_id <= upto` acked and compacts
    /// them away. Acking at or below the high-water mark of previous
    /// acks is a no-op.
    pub fn ack(&self, upto: SequenceId) -> Result<()> {
        let mut inner = self.lock()?;

        let before = inner.pending.len();
        for record in inner.pending.iter_mut() {
            if record.sequence_id <= upto.0 {
                record.acked = true;
            }
        }
        inner.pending.retain(|r| !r.acked);

        if inner.pending.len() != before {
            self.persist(&inner)?;
        }
        Ok(())
    }

    /// Returns un-acked records with `sequence_id > from`, in order.
    pub fn pending_after(&self, from: u64) -> Result<Vec<PendingRecord>> {
        let inner = self.lock()?;
        let mut records: Vec<PendingRecord> = inner
            .pending
            .iter()
            .filter(|r| r.sequence_id > from)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.sequence_id);
        Ok(records)
    }

    /// Last assigned sequence ID.
    pub fn last_seq(&self) -> Result<u64> {
        Ok(self.lock()?.last_seq)
    }

    /// The stream this store belongs to.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    // -- Internal ---------------------------------------------------------

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|e| RvChatError::Storage {
            reason: format!("stream store lock poisoned: {e}"),
        })
    }

    fn persist(&self, inner: &Inner) -> Result<()> {
        backup::write_durable(
            &self.dir.join("seq"),
            inner.last_seq.to_string().as_bytes(),
            self.backup_depth,
        )?;
        let bytes = serde_json::to_vec(&inner.pending).map_err(|e| RvChatError::Storage {
            reason: format!("pending records encoding failed: {e}"),
        })?;
        backup::write_durable(&self.dir.join("pending"), &bytes, self.backup_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_ids_are_monotonic() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(dir.path(), StreamKind::Pm, 1)?;

        let a = store.record(json!({"msg": "a"}))?;
        let b = store.record(json!({"msg": "b"}))?;
        assert_eq!(a.0, 1);
        assert_eq!(b.0, 2);
        Ok(())
    }

    #[test]
    fn ack_compacts_and_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(dir.path(), StreamKind::Pm, 1)?;

        store.record(json!(1))?;
        store.record(json!(2))?;
        store.record(json!(3))?;

        store.ack(SequenceId(2))?;
        let pending = store.pending_after(0)?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sequence_id, 3);

        // Re-acking below the high-water mark changes nothing.
        store.ack(SequenceId(1))?;
        store.ack(SequenceId(2))?;
        assert_eq!(store.pending_after(0)?.len(), 1);
        Ok(())
    }

    #[test]
    fn replay_respects_unacked_from() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::open(dir.path(), StreamKind::Gcm, 1)?;

        for i in 1..=5 {
            store.record(json!(i))?;
        }

        let replay = store.pending_after(3)?;
        let ids: Vec<u64> = replay.iter().map(|r| r.sequence_id).collect();
        assert_eq!(ids, vec![4, 5]);
        Ok(())
    }

    #[test]
    fn counter_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = StreamStore::open(dir.path(), StreamKind::Posts, 1)?;
            store.record(json!("a"))?;
            store.record(json!("b"))?;
            store.ack(SequenceId(1))?;
        }

        let store = StreamStore::open(dir.path(), StreamKind::Posts, 1)?;
        assert_eq!(store.last_seq()?, 2);
        let pending = store.pending_after(0)?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sequence_id, 2);

        // New assignments continue after the persisted counter.
        assert_eq!(store.record(json!("c"))?.0, 3);
        Ok(())
    }

    #[test]
    fn streams_are_independent() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let pm = StreamStore::open(dir.path(), StreamKind::Pm, 1)?;
        let kx = StreamStore::open(dir.path(), StreamKind::Kx, 1)?;

        pm.record(json!("pm"))?;
        assert_eq!(kx.last_seq()?, 0);
        assert_eq!(kx.record(json!("kx"))?.0, 1);
        Ok(())
    }
}
