//! The outbox runner: at-least-once outbound delivery, FIFO per peer.
//!
//! Entries are durably appended before anything touches the network.
//! Sealing through the peer's ratchet happens once, at first push, and
//! the sealed form is persisted — retries re-push the identical blob,
//! so the receiver's one-shot tags make duplicates impossible.
//!
//! Each peer is an independent lane: within a lane entries go out in
//! append order (even across reconnects); across lanes nothing is
//! promised. Retriable failures back off exponentially with a capped
//! delay and reset when connectivity returns. Fatal failures (peer
//! forgotten, ratchet exhausted) surface a [`ClientEvent::SendFailed`]
//! and drop the entry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rvchat_storage::{OutboxEntry, OutboxState, OutboxStore, SealedRm};
use rvchat_types::config::BackoffConfig;
use rvchat_types::event::ClientEvent;
use rvchat_types::{Result, RvChatError, UserId};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::notify::NotifyBus;
use crate::registry::Registry;
use crate::session::SessionHandle;

// ---------------------------------------------------------------------------
// Lane
// ---------------------------------------------------------------------------

struct Lane {
    entries: VecDeque<OutboxEntry>,
    ready_at: Instant,
    attempts: u32,
    warned: bool,
}

impl Lane {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            ready_at: Instant::now(),
            attempts: 0,
            warned: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Durable outbound queue plus its retry scheduler.
pub struct Outbox {
    store: OutboxStore,
    registry: Arc<Registry>,
    session: SessionHandle,
    notify: Arc<NotifyBus>,
    backoff: BackoffConfig,
    lanes: Mutex<HashMap<UserId, Lane>>,
    wake: Notify,
}

impl Outbox {
    /// Opens the outbox, loading pending entries from disk into their
    /// per-peer lanes.
    pub fn open(
        store: OutboxStore,
        registry: Arc<Registry>,
        session: SessionHandle,
        notify: Arc<NotifyBus>,
        backoff: BackoffConfig,
    ) -> Result<Arc<Self>> {
        let mut lanes = HashMap::new();
        for (uid, entries) in store.load_all()? {
            let mut lane = Lane::new();
            lane.entries.extend(entries);
            lanes.insert(uid, lane);
        }

        Ok(Arc::new(Self {
            store,
            registry,
            session,
            notify,
            backoff,
            lanes: Mutex::new(lanes),
            wake: Notify::new(),
        }))
    }

    /// Durably appends an outbound routed message for `to` and wakes
    /// the scheduler.
    pub async fn enqueue(
        &self,
        to: UserId,
        rm: Vec<u8>,
        priority: u8,
        payment_hint: Option<String>,
    ) -> Result<()> {
        if !self.registry.knows(&to) {
            return Err(RvChatError::UserNotFound {
                reason: format!("cannot enqueue for unknown peer {to}"),
            });
        }

        let entry = self.store.append(to, rm, priority, payment_hint)?;
        self.lanes
            .lock()
            .await
            .entry(to)
            .or_insert_with(Lane::new)
            .entries
            .push_back(entry);
        self.wake.notify_one();
        Ok(())
    }

    /// Number of queued entries across all lanes.
    pub async fn pending(&self) -> usize {
        self.lanes.lock().await.values().map(|l| l.entries.len()).sum()
    }

    /// Spawns the retry scheduler task.
    pub fn spawn_runner(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut connectivity = self.session.connectivity();
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let next_ready = self.process_ready_lanes().await;

                let sleep_for = next_ready
                    .map(|at| at.saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::from_secs(3600));

                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = self.wake.notified() => {}
                    changed = connectivity.changed() => {
                        if changed.is_ok() && *connectivity.borrow() {
                            // Reconnected: retry everything immediately.
                            self.reset_backoff().await;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("outbox runner exited");
        })
    }

    async fn reset_backoff(&self) {
        let mut lanes = self.lanes.lock().await;
        let now = Instant::now();
        for lane in lanes.values_mut() {
            lane.ready_at = now;
            lane.attempts = 0;
            lane.warned = false;
        }
    }

    /// Walks every lane, pushing entries whose lane is ready. Returns
    /// the earliest future ready time, if any lane is backing off.
    async fn process_ready_lanes(&self) -> Option<Instant> {
        let ready: Vec<UserId> = {
            let lanes = self.lanes.lock().await;
            let now = Instant::now();
            lanes
                .iter()
                .filter(|(_, lane)| !lane.entries.is_empty() && lane.ready_at <= now)
                .map(|(uid, _)| *uid)
                .collect()
        };

        for uid in ready {
            self.drain_lane(&uid).await;
        }

        let lanes = self.lanes.lock().await;
        lanes
            .values()
            .filter(|lane| !lane.entries.is_empty())
            .map(|lane| lane.ready_at)
            .min()
    }

    /// Pushes one lane's entries in FIFO order until it empties or a
    /// retriable failure puts the lane into backoff.
    async fn drain_lane(&self, uid: &UserId) {
        loop {
            let entry = {
                let mut lanes = self.lanes.lock().await;
                let Some(lane) = lanes.get_mut(uid) else { return };
                if lane.entries.is_empty() || lane.ready_at > Instant::now() {
                    return;
                }
                lane.entries.front().cloned().unwrap()
            };

            match self.push_entry(entry).await {
                Ok(sent) => {
                    let mut lanes = self.lanes.lock().await;
                    if let Some(lane) = lanes.get_mut(uid) {
                        lane.entries.pop_front();
                        lane.attempts = 0;
                        lane.warned = false;
                    }
                    if let Err(e) = self.store.remove(uid, sent.seq) {
                        tracing::error!(peer = %uid, error = %e, "failed to remove acked outbox entry");
                    }
                    if let Err(e) = self.registry.mark_sent(uid) {
                        tracing::debug!(peer = %uid, error = %e, "failed to record send time");
                    }
                }
                Err(e) if e.is_retriable() || waiting_on_peer(&e) => {
                    let mut lanes = self.lanes.lock().await;
                    if let Some(lane) = lanes.get_mut(uid) {
                        lane.attempts = lane.attempts.saturating_add(1);
                        let delay = self.backoff.delay_ms(lane.attempts.saturating_sub(1));
                        lane.ready_at = Instant::now() + Duration::from_millis(delay);

                        if lane.attempts >= self.backoff.max_attempts && !lane.warned {
                            lane.warned = true;
                            self.notify.publish(&ClientEvent::SendFailed {
                                to: *uid,
                                reason: format!("still retrying after {} attempts: {e}", lane.attempts),
                            });
                        }
                    }
                    tracing::debug!(peer = %uid, error = %e, "outbox push deferred");
                    return;
                }
                Err(e) => {
                    // Fatal for this entry: surface and drop it.
                    let seq = {
                        let mut lanes = self.lanes.lock().await;
                        lanes
                            .get_mut(uid)
                            .and_then(|lane| lane.entries.pop_front())
                            .map(|e| e.seq)
                    };
                    if let Some(seq) = seq {
                        let _ = self.store.remove(uid, seq);
                    }
                    self.notify.publish(&ClientEvent::SendFailed {
                        to: *uid,
                        reason: e.to_string(),
                    });
                    tracing::warn!(peer = %uid, error = %e, "outbox entry failed fatally");
                }
            }
        }
    }

    /// Seals (once) and pushes one entry. Returns the entry as pushed.
    async fn push_entry(&self, mut entry: OutboxEntry) -> Result<OutboxEntry> {
        let sealed = match &entry.sealed {
            Some(sealed) => sealed.clone(),
            None => {
                let (tag, blob) = self.registry.seal_for(&entry.to, &entry.rm)?;
                let sealed = SealedRm { tag, blob };
                entry.sealed = Some(sealed.clone());
                entry.state = OutboxState::Sending;
                // The sealed form must be durable before the push so a
                // crash never burns a second ratchet step.
                self.store.persist(&entry)?;
                self.update_cached(&entry).await;
                sealed
            }
        };

        entry.attempts = entry.attempts.saturating_add(1);
        self.store.persist(&entry)?;
        self.update_cached(&entry).await;

        self.session
            .push(sealed.tag, sealed.blob, entry.payment_hint.clone())
            .await?;
        Ok(entry)
    }

    async fn update_cached(&self, entry: &OutboxEntry) {
        let mut lanes = self.lanes.lock().await;
        if let Some(lane) = lanes.get_mut(&entry.to) {
            if let Some(front) = lane.entries.front_mut() {
                if front.seq == entry.seq {
                    *front = entry.clone();
                }
            }
        }
    }
}

/// A responder-side ratchet that cannot send yet is a waiting
/// condition, not a failure.
fn waiting_on_peer(e: &RvChatError) -> bool {
    matches!(e, RvChatError::RatchetDesync { .. })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_classification() {
        assert!(waiting_on_peer(&RvChatError::RatchetDesync {
            reason: "no send chain".into()
        }));
        assert!(!waiting_on_peer(&RvChatError::UserNotFound {
            reason: "gone".into()
        }));
    }
}
