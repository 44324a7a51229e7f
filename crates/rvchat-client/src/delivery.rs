//! Local delivery: ordered, durable, ack-gated consumer streams.
//!
//! One [`StreamStore`] per [`StreamKind`]. For each event:
//!
//! 1. The next sequence ID is assigned atomically.
//! 2. The record is persisted (un-acked) before anything is emitted.
//! 3. Live subscribers receive the record.
//! 4. A consumer ack up to a sequence ID compacts everything at or
//!    below it.
//!
//! A subscriber opening with `unacked_from = N` first receives every
//! pending record above `N` in order, then live events. Emission and
//! subscription serialize on one lock so the replay/live handoff never
//! skips or duplicates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rvchat_storage::{PendingRecord, StreamStore};
use rvchat_types::{Result, RvChatError, SequenceId, StreamKind};
use serde::Serialize;
use tokio::sync::mpsc;

/// Capacity of each subscriber's live channel. A slower consumer loses
/// live events, which the durable replay recovers on re-open.
const SUBSCRIBER_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Ordered durable delivery across all consumer streams.
pub struct Delivery {
    stores: HashMap<StreamKind, StreamStore>,
    subscribers: Mutex<HashMap<StreamKind, Vec<mpsc::Sender<PendingRecord>>>>,
}

impl Delivery {
    /// Opens all stream stores under `app_dir`.
    pub fn open(app_dir: &std::path::Path, backup_depth: usize) -> Result<Arc<Self>> {
        let mut stores = HashMap::new();
        for kind in StreamKind::ALL {
            stores.insert(kind, StreamStore::open(app_dir, kind, backup_depth)?);
        }
        Ok(Arc::new(Self {
            stores,
            subscribers: Mutex::new(HashMap::new()),
        }))
    }

    /// Emits `event` on `kind`: assigns a sequence ID, persists, then
    /// pushes to live subscribers. Returns the assigned ID.
    pub fn emit<T: Serialize>(&self, kind: StreamKind, event: &T) -> Result<SequenceId> {
        let payload = serde_json::to_value(event).map_err(|e| RvChatError::Storage {
            reason: format!("stream payload encoding failed: {e}"),
        })?;

        let mut subscribers = self.sub_lock()?;
        let seq = self.store(kind)?.record(payload.clone())?;

        let record = PendingRecord {
            sequence_id: seq.0,
            payload,
            acked: false,
            recorded_at: rvchat_types::Timestamp::now(),
        };

        if let Some(list) = subscribers.get_mut(&kind) {
            list.retain(|tx| match tx.try_send(record.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(stream = %kind, seq = seq.0, "slow subscriber, dropping live event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
        Ok(seq)
    }

    /// Opens a subscription on `kind`, replaying un-acked records above
    /// `unacked_from` before any live event.
    pub fn subscribe(&self, kind: StreamKind, unacked_from: u64) -> Result<mpsc::Receiver<PendingRecord>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        // Replay and registration happen under the same lock that
        // emission takes, so no event lands between them.
        let mut subscribers = self.sub_lock()?;
        let pending = self.store(kind)?.pending_after(unacked_from)?;
        for record in pending {
            // Replay overflow beyond the buffer is a resource error:
            // the consumer asked for more backlog than it can hold.
            tx.try_send(record).map_err(|_| RvChatError::Resource {
                reason: format!("replay backlog exceeds subscriber buffer {SUBSCRIBER_BUFFER}"),
            })?;
        }
        subscribers.entry(kind).or_default().push(tx);
        Ok(rx)
    }

    /// Acks all records on `kind` up to `seq`. Acking at or below the
    /// current high-water mark is a no-op.
    pub fn ack(&self, kind: StreamKind, seq: SequenceId) -> Result<()> {
        self.store(kind)?.ack(seq)
    }

    /// Last sequence ID assigned on `kind`.
    pub fn last_seq(&self, kind: StreamKind) -> Result<u64> {
        self.store(kind)?.last_seq()
    }

    fn store(&self, kind: StreamKind) -> Result<&StreamStore> {
        self.stores.get(&kind).ok_or_else(|| RvChatError::Storage {
            reason: format!("no store for stream {kind}"),
        })
    }

    fn sub_lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<StreamKind, Vec<mpsc::Sender<PendingRecord>>>>>
    {
        self.subscribers.lock().map_err(|e| RvChatError::Storage {
            reason: format!("delivery lock poisoned: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rvchat_types::event::PmEvent;
    use rvchat_types::UserId;

    fn pm(msg: &str) -> PmEvent {
        PmEvent {
            from: UserId::new([1; 32]),
            nick: "alice".into(),
            msg: msg.into(),
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn live_events_arrive_in_sequence_order() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let delivery = Delivery::open(dir.path(), 1)?;

        let mut rx = delivery.subscribe(StreamKind::Pm, 0)?;
        delivery.emit(StreamKind::Pm, &pm("one"))?;
        delivery.emit(StreamKind::Pm, &pm("two"))?;

        assert_eq!(rx.recv().await.unwrap().sequence_id, 1);
        assert_eq!(rx.recv().await.unwrap().sequence_id, 2);
        Ok(())
    }

    #[tokio::test]
    async fn replay_precedes_live() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let delivery = Delivery::open(dir.path(), 1)?;

        delivery.emit(StreamKind::Pm, &pm("old-1"))?;
        delivery.emit(StreamKind::Pm, &pm("old-2"))?;

        let mut rx = delivery.subscribe(StreamKind::Pm, 0)?;
        delivery.emit(StreamKind::Pm, &pm("live"))?;

        let ids: Vec<u64> = vec![
            rx.recv().await.unwrap().sequence_id,
            rx.recv().await.unwrap().sequence_id,
            rx.recv().await.unwrap().sequence_id,
        ];
        assert_eq!(ids, vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn acked_records_do_not_replay() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let delivery = Delivery::open(dir.path(), 1)?;

        delivery.emit(StreamKind::Pm, &pm("a"))?;
        delivery.emit(StreamKind::Pm, &pm("b"))?;
        delivery.ack(StreamKind::Pm, SequenceId(1))?;

        let mut rx = delivery.subscribe(StreamKind::Pm, 0)?;
        assert_eq!(rx.recv().await.unwrap().sequence_id, 2);
        Ok(())
    }

    #[tokio::test]
    async fn unacked_from_bounds_replay() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let delivery = Delivery::open(dir.path(), 1)?;

        for i in 0..4 {
            delivery.emit(StreamKind::Kx, &pm(&format!("{i}")))?;
        }

        let mut rx = delivery.subscribe(StreamKind::Kx, 3)?;
        assert_eq!(rx.recv().await.unwrap().sequence_id, 4);
        Ok(())
    }

    #[tokio::test]
    async fn ack_is_idempotent_at_high_water() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let delivery = Delivery::open(dir.path(), 1)?;

        delivery.emit(StreamKind::Posts, &pm("p"))?;
        delivery.ack(StreamKind::Posts, SequenceId(1))?;
        delivery.ack(StreamKind::Posts, SequenceId(1))?;
        delivery.ack(StreamKind::Posts, SequenceId(0))?;

        assert_eq!(delivery.last_seq(StreamKind::Posts)?, 1);
        Ok(())
    }
}
