//! The client event loop: routes inbound blobs, processes commands,
//! and drives key-exchange timeouts.
//!
//! Inbound path: the session delivers a blob; the rendezvous manager
//! finds its handler, which forwards into either the per-peer ratchet
//! channel or the key-exchange reply channel; this loop decrypts,
//! routes the routed-message variant exhaustively, persists through
//! local delivery, and only then acks the relay so an un-acked blob
//! replays after a crash.
//!
//! Repeated decrypt failures from one peer are treated as ratchet
//! desync and answered with a reset key exchange.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rvchat_storage::LocalIdentity;
use rvchat_types::config::{ClientConfig, PaidPolicy};
use rvchat_types::event::{ClientEvent, GcmEvent, PmEvent, PostEvent, PostStatusEvent};
use rvchat_types::{Result, RvChatError, StreamKind, UserId};
use rvchat_wire::{decode_rm, encode_rm, KxPhase, RoutedEnvelope, RoutedMessage};
use tokio::sync::{mpsc, watch};

use crate::command::ClientCommand;
use crate::delivery::Delivery;
use crate::gc::{GcController, GcVerdict};
use crate::inbound::watch_peer_tags;
use crate::kx::KxEngine;
use crate::notify::NotifyBus;
use crate::outbox::Outbox;
use crate::payment::{ConfirmGate, PaymentClient};
use crate::registry::Registry;
use crate::rvmanager::{InboundBlob, RvManager};
use crate::session::{InvoiceDemand, SessionHandle};
use crate::tasks::spawn_supervised;

/// Consecutive decrypt failures from one peer before a reset key
/// exchange is initiated.
const DESYNC_THRESHOLD: u32 = 3;

/// Interval of the key-exchange timeout sweep.
const KX_TICK: Duration = Duration::from_secs(5);

/// Priority of user-visible messages in the outbox.
const USER_PRIORITY: u8 = 1;

/// Atoms per DCR.
const ATOMS_PER_DCR: f64 = 1e8;

// ---------------------------------------------------------------------------
// EventLoop
// ---------------------------------------------------------------------------

/// Owned state of the event-loop task.
pub(crate) struct EventLoop {
    pub identity: LocalIdentity,
    pub config: ClientConfig,
    pub registry: Arc<Registry>,
    pub rvmanager: Arc<RvManager>,
    pub session: SessionHandle,
    pub outbox: Arc<Outbox>,
    pub kx: Arc<KxEngine>,
    pub gc: Arc<GcController>,
    pub delivery: Arc<Delivery>,
    pub notify: Arc<NotifyBus>,
    pub payment: Arc<dyn PaymentClient>,
    pub gate: Arc<dyn ConfirmGate>,

    pub command_rx: mpsc::Receiver<ClientCommand>,
    pub blob_rx: mpsc::Receiver<InboundBlob>,
    pub peer_rx: mpsc::UnboundedReceiver<(UserId, InboundBlob)>,
    pub peer_tx: mpsc::UnboundedSender<(UserId, InboundBlob)>,
    pub kx_rx: mpsc::UnboundedReceiver<(u64, InboundBlob)>,
    pub invoice_rx: mpsc::Receiver<InvoiceDemand>,

    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,

    pub desync_counts: HashMap<UserId, u32>,
    pub post_subscribers: HashSet<UserId>,
}

impl EventLoop {
    /// Runs until shutdown.
    pub async fn run(mut self) {
        tracing::info!(uid = %self.identity.user_id(), "client event loop starting");

        // Watch every stored peer's receive window. The session also
        // re-subscribes live tags on each connect; doing it here too
        // closes the startup race.
        for (uid, _) in self.registry.list() {
            if let Err(e) = watch_peer_tags(
                uid,
                &self.registry,
                &self.rvmanager,
                &self.session,
                &self.peer_tx,
            )
            .await
            {
                tracing::warn!(peer = %uid, error = %e, "failed to watch peer tags at startup");
            }
        }

        let mut kx_tick = tokio::time::interval(KX_TICK);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ClientCommand::Shutdown) | None => {
                            let _ = self.shutdown_tx.send(true);
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                Some(blob) = self.blob_rx.recv() => {
                    if let Err(e) = self.rvmanager.dispatch(blob) {
                        // Unknown tags are logged and discarded.
                        tracing::warn!(error = %e, "inbound blob had no handler");
                    }
                }

                Some((uid, blob)) = self.peer_rx.recv() => {
                    self.handle_peer_blob(uid, blob).await;
                }

                Some((attempt, blob)) = self.kx_rx.recv() => {
                    let tag = blob.tag;
                    match self.kx.handle_reply_blob(attempt, blob).await {
                        Ok(()) => {
                            if let Err(e) = self.session.ack(tag).await {
                                tracing::debug!(error = %e, "failed to ack key-exchange reply");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "key-exchange reply rejected"),
                    }
                }

                Some(demand) = self.invoice_rx.recv() => {
                    self.handle_invoice(demand);
                }

                _ = kx_tick.tick() => {
                    self.kx.tick().await;
                }

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("client event loop exited");
    }

    // -----------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------

    async fn handle_peer_blob(&mut self, uid: UserId, blob: InboundBlob) {
        match self.registry.open_for(&uid, &blob.tag, &blob.payload) {
            Ok((plaintext, _recv_tags)) => {
                self.desync_counts.remove(&uid);

                if let Err(e) = watch_peer_tags(
                    uid,
                    &self.registry,
                    &self.rvmanager,
                    &self.session,
                    &self.peer_tx,
                )
                .await
                {
                    tracing::warn!(peer = %uid, error = %e, "failed to extend peer watch");
                }

                match decode_rm(&plaintext) {
                    Ok(envelope) => self.process_envelope(uid, envelope).await,
                    Err(e) => {
                        tracing::warn!(peer = %uid, error = %e, "malformed routed message discarded");
                    }
                }

                // Local delivery has persisted by now; the relay may
                // drop its copy.
                if let Err(e) = self.session.ack(blob.tag).await {
                    tracing::debug!(error = %e, "failed to ack delivery");
                }
            }
            Err(e) => {
                self.handle_decrypt_failure(uid, &e).await;
                // Undecryptable blobs are logged and discarded.
                if let Err(e) = self.session.ack(blob.tag).await {
                    tracing::debug!(error = %e, "failed to ack undecryptable blob");
                }
            }
        }
    }

    async fn handle_decrypt_failure(&mut self, uid: UserId, err: &RvChatError) {
        let count = self.desync_counts.entry(uid).or_insert(0);
        *count += 1;
        tracing::warn!(peer = %uid, error = %err, failures = *count, "decrypt failure");

        if *count >= DESYNC_THRESHOLD {
            self.desync_counts.remove(&uid);
            tracing::warn!(peer = %uid, "ratchet desync suspected, initiating reset key exchange");
            if let Err(e) = self.kx.reset(&uid).await {
                tracing::error!(peer = %uid, error = %e, "reset key exchange failed to start");
            }
        }
    }

    async fn process_envelope(&mut self, uid: UserId, envelope: RoutedEnvelope) {
        if envelope.sender != uid {
            tracing::warn!(
                peer = %uid,
                claimed = %envelope.sender,
                "sender mismatch inside ratchet message, discarding"
            );
            return;
        }

        match envelope.rm {
            RoutedMessage::Pm { msg, timestamp_ms } => {
                let nick = self.registry.nick_of(&uid).unwrap_or_else(|_| uid.to_string());
                let event = PmEvent {
                    from: uid,
                    nick,
                    msg,
                    timestamp_ms,
                };
                if let Err(e) = self.delivery.emit(StreamKind::Pm, &event) {
                    tracing::error!(error = %e, "failed to persist private message");
                    return;
                }
                self.notify.publish(&ClientEvent::PmReceived(event));
            }

            RoutedMessage::GroupMessage { gc, generation, msg, timestamp_ms } => {
                match self.gc.gate_message(&uid, &gc, generation) {
                    GcVerdict::Deliver => {
                        let nick =
                            self.registry.nick_of(&uid).unwrap_or_else(|_| uid.to_string());
                        let event = GcmEvent {
                            gc,
                            from: uid,
                            nick,
                            msg,
                            timestamp_ms,
                        };
                        if let Err(e) = self.delivery.emit(StreamKind::Gcm, &event) {
                            tracing::error!(error = %e, "failed to persist group message");
                            return;
                        }
                        self.notify.publish(&ClientEvent::GcmReceived(event));
                    }
                    GcVerdict::Drop { reason } => {
                        tracing::debug!(%gc, %reason, "group message dropped");
                    }
                    GcVerdict::NeedsUpdate { admin, request } => {
                        tracing::info!(%gc, generation, "ahead-of-us group message, fetching metadata");
                        self.enqueue_rm(admin, request).await;
                    }
                }
            }

            RoutedMessage::GroupInvite { meta, token } => {
                let gc = meta.id;
                let generation = meta.generation;
                match self.gc.handle_invite(&uid, meta, token) {
                    Ok((to, answer)) => {
                        self.enqueue_rm(to, answer).await;
                        self.notify
                            .publish(&ClientEvent::GcGenerationUpdated { gc, generation });
                    }
                    Err(e) => tracing::warn!(error = %e, "group invite rejected"),
                }
            }

            RoutedMessage::GroupJoin { gc, token, accept } => {
                match self.gc.handle_join(&uid, &gc, token, accept) {
                    Ok(sends) => {
                        for (to, rm) in sends {
                            self.enqueue_rm(to, rm).await;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "group join rejected"),
                }
            }

            RoutedMessage::GroupList { meta } => {
                let gc = meta.id;
                match self.gc.handle_list(&uid, meta) {
                    Ok(Some(generation)) => {
                        self.notify
                            .publish(&ClientEvent::GcGenerationUpdated { gc, generation });
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "group update rejected"),
                }
            }

            RoutedMessage::GroupUpdateRequest { gc, .. } => {
                match self.gc.handle_update_request(&uid, &gc) {
                    Ok((to, rm)) => self.enqueue_rm(to, rm).await,
                    Err(e) => tracing::debug!(error = %e, "group update request rejected"),
                }
            }

            RoutedMessage::Post { title, content, timestamp_ms } => {
                let event = PostEvent {
                    from: uid,
                    title,
                    content,
                    timestamp_ms,
                };
                if let Err(e) = self.delivery.emit(StreamKind::Posts, &event) {
                    tracing::error!(error = %e, "failed to persist post");
                    return;
                }
                self.notify.publish(&ClientEvent::PostReceived(event));
            }

            RoutedMessage::PostStatus { post_id, status, timestamp_ms } => {
                let event = PostStatusEvent {
                    from: uid,
                    post_id,
                    status,
                    timestamp_ms,
                };
                if let Err(e) = self.delivery.emit(StreamKind::PostStatus, &event) {
                    tracing::error!(error = %e, "failed to persist post status");
                    return;
                }
                self.notify.publish(&ClientEvent::PostStatusReceived(event));
            }

            RoutedMessage::PostSubscribe {} => {
                tracing::info!(peer = %uid, "peer subscribed to our posts");
                self.post_subscribers.insert(uid);
            }

            RoutedMessage::PostUnsubscribe {} => {
                tracing::info!(peer = %uid, "peer unsubscribed from our posts");
                self.post_subscribers.remove(&uid);
            }

            RoutedMessage::Tip { amount_atoms } => {
                self.notify.publish(&ClientEvent::TipProgress {
                    to: self.identity.user_id(),
                    amount_atoms,
                    settled: true,
                });
            }

            RoutedMessage::TipProgress { amount_atoms, settled, .. } => {
                self.notify.publish(&ClientEvent::TipProgress {
                    to: uid,
                    amount_atoms,
                    settled,
                });
            }

            RoutedMessage::KxStep { phase, nick, dh_pub, ephemeral_pub, step_rv, .. } => match phase {
                KxPhase::Confirm => {
                    if let Err(e) = self.kx.handle_confirm(&uid).await {
                        tracing::warn!(error = %e, "key-exchange confirm rejected");
                    }
                }
                KxPhase::Reset => {
                    if let Err(e) = self
                        .kx
                        .handle_reset(&uid, nick, dh_pub, ephemeral_pub, step_rv)
                        .await
                    {
                        tracing::warn!(error = %e, "ratchet reset request rejected");
                    }
                }
                KxPhase::Reply => {
                    // Replies travel as sealed blobs, never inside a
                    // ratchet message.
                    tracing::warn!(peer = %uid, "unexpected in-ratchet key-exchange reply");
                }
            },

            RoutedMessage::MediateKx { target, invitation } => {
                if let Err(e) = self.kx.handle_mediate(&uid, target, invitation).await {
                    tracing::warn!(error = %e, "mediated key exchange failed");
                }
            }

            RoutedMessage::FileFrame { name, chunk_index, chunk_count, data } => {
                // The byte streamer that consumes these is an external
                // component.
                tracing::debug!(
                    peer = %uid,
                    %name,
                    chunk_index,
                    chunk_count,
                    bytes = data.len(),
                    "file frame received"
                );
            }

            RoutedMessage::Ping {} => {
                tracing::debug!(peer = %uid, "peer ping");
            }
        }
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    async fn handle_command(&mut self, cmd: ClientCommand) {
        match cmd {
            ClientCommand::SendPm { user, msg, reply } => {
                let result = self.send_pm(&user, msg).await;
                let _ = reply.send(result);
            }

            ClientCommand::SendGcm { gc, msg, reply } => {
                let result = self.send_gcm(&gc, &msg).await;
                let _ = reply.send(result);
            }

            ClientCommand::CreateGc { name, reply } => {
                let _ = reply.send(self.gc.create(&name).map(|meta| meta.id));
            }

            ClientCommand::InviteToGc { gc, user, reply } => {
                let result = self.invite_to_gc(&gc, &user).await;
                let _ = reply.send(result);
            }

            ClientCommand::CreateInvitation { reply } => {
                // Subscribing to the invitation tag waits for the relay
                // connection; run off-loop.
                let kx = self.kx.clone();
                spawn_supervised(self.notify.clone(), "create-invitation command", async move {
                    let _ = reply.send(kx.create_invitation(false).await);
                });
            }

            ClientCommand::AcceptInvitation { invitation, reply } => {
                let kx = self.kx.clone();
                spawn_supervised(self.notify.clone(), "accept-invitation command", async move {
                    let _ = reply.send(kx.accept_invitation(&invitation, false).await);
                });
            }

            ClientCommand::MediateKx { mediator, target, reply } => {
                match self.registry.lookup(&mediator) {
                    Ok(mediator_uid) => {
                        let kx = self.kx.clone();
                        spawn_supervised(self.notify.clone(), "mediate-kx command", async move {
                            let _ = reply.send(kx.mediate(&mediator_uid, target).await);
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            ClientCommand::ResetKx { user, reply } => match self.registry.lookup(&user) {
                Ok(uid) => {
                    let kx = self.kx.clone();
                    spawn_supervised(self.notify.clone(), "reset-kx command", async move {
                        let _ = reply.send(kx.reset(&uid).await);
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            ClientCommand::SubscribeToPosts { user, reply } => {
                let result = self
                    .send_simple(&user, RoutedMessage::PostSubscribe {})
                    .await;
                let _ = reply.send(result);
            }

            ClientCommand::UnsubscribeToPosts { user, reply } => {
                let result = self
                    .send_simple(&user, RoutedMessage::PostUnsubscribe {})
                    .await;
                let _ = reply.send(result);
            }

            ClientCommand::TipUser { user, dcr_amount, reply } => {
                match self.registry.lookup(&user) {
                    Ok(uid) => {
                        let amount_atoms = (dcr_amount * ATOMS_PER_DCR).round() as u64;
                        let ctx = TipContext {
                            uid,
                            amount_atoms,
                            policy: self.config.paid_policy,
                            gate: self.gate.clone(),
                            payment: self.payment.clone(),
                            outbox: self.outbox.clone(),
                            notify: self.notify.clone(),
                            sender: self.identity.user_id(),
                        };
                        spawn_supervised(self.notify.clone(), "tip-user command", async move {
                            let _ = reply.send(ctx.run().await);
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            ClientCommand::ListPeers { reply } => {
                let _ = reply.send(self.registry.list());
            }

            // Handled by the select arm before dispatch.
            ClientCommand::Shutdown => unreachable!("shutdown handled by the loop"),
        }
    }

    async fn send_pm(&mut self, user: &str, msg: String) -> Result<()> {
        let uid = self.registry.lookup(user)?;
        let rm = RoutedMessage::Pm {
            msg,
            timestamp_ms: rvchat_types::Timestamp::now().millis(),
        };
        let envelope = RoutedEnvelope::new(self.identity.user_id(), rm);
        self.outbox
            .enqueue(uid, encode_rm(&envelope)?, USER_PRIORITY, None)
            .await
    }

    async fn send_gcm(&mut self, gc: &str, msg: &str) -> Result<()> {
        let gc_id = self.gc.resolve(gc)?;
        let sends = self.gc.fan_out_message(&gc_id, msg)?;
        // Delivery to each member is independent; enqueue failures for
        // individual members do not fail the whole send.
        for (to, rm) in sends {
            self.enqueue_rm(to, rm).await;
        }
        Ok(())
    }

    async fn invite_to_gc(&mut self, gc: &str, user: &str) -> Result<()> {
        let gc_id = self.gc.resolve(gc)?;
        let uid = self.registry.lookup(user)?;
        let (to, rm) = self.gc.invite(&gc_id, uid)?;
        let envelope = RoutedEnvelope::new(self.identity.user_id(), rm);
        self.outbox
            .enqueue(to, encode_rm(&envelope)?, USER_PRIORITY, None)
            .await
    }

    async fn send_simple(&mut self, user: &str, rm: RoutedMessage) -> Result<()> {
        let uid = self.registry.lookup(user)?;
        let envelope = RoutedEnvelope::new(self.identity.user_id(), rm);
        self.outbox
            .enqueue(uid, encode_rm(&envelope)?, USER_PRIORITY, None)
            .await
    }

    /// Enqueues an internally generated routed message, logging (rather
    /// than propagating) failures.
    async fn enqueue_rm(&self, to: UserId, rm: RoutedMessage) {
        let envelope = RoutedEnvelope::new(self.identity.user_id(), rm);
        let bytes = match encode_rm(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode internal routed message");
                return;
            }
        };
        if let Err(e) = self.outbox.enqueue(to, bytes, 0, None).await {
            tracing::warn!(peer = %to, error = %e, "failed to enqueue internal routed message");
        }
    }

    // -----------------------------------------------------------------
    // Payments
    // -----------------------------------------------------------------

    fn handle_invoice(&self, demand: InvoiceDemand) {
        let policy = self.config.paid_policy;
        let gate = self.gate.clone();
        let payment = self.payment.clone();
        let session = self.session.clone();

        spawn_supervised(self.notify.clone(), "invoice payment", async move {
            let approved = match policy {
                PaidPolicy::Always => true,
                PaidPolicy::Never => false,
                PaidPolicy::Confirm => {
                    gate.confirm("relay invoice", demand.amount_atoms).await
                }
            };
            if !approved {
                tracing::warn!(
                    rv = %demand.rv,
                    amount = demand.amount_atoms,
                    "relay invoice declined by policy"
                );
                return;
            }

            match payment.pay_invoice(&demand.invoice).await {
                Ok(preimage) => {
                    if let Err(e) = session.pay(demand.invoice, preimage).await {
                        tracing::warn!(error = %e, "failed to deliver payment proof");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "invoice payment failed");
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// TipContext
// ---------------------------------------------------------------------------

/// Everything a tip needs, detached from the event loop so the payment
/// round-trip cannot stall it.
struct TipContext {
    uid: UserId,
    amount_atoms: u64,
    policy: PaidPolicy,
    gate: Arc<dyn ConfirmGate>,
    payment: Arc<dyn PaymentClient>,
    outbox: Arc<Outbox>,
    notify: Arc<NotifyBus>,
    sender: UserId,
}

impl TipContext {
    async fn run(self) -> Result<()> {
        let approved = match self.policy {
            PaidPolicy::Always => true,
            PaidPolicy::Never => false,
            PaidPolicy::Confirm => self.gate.confirm("tip user", self.amount_atoms).await,
        };
        if !approved {
            return Err(RvChatError::PolicyRejected {
                reason: format!(
                    "payment of {} atoms declined by the confirmation gate",
                    self.amount_atoms
                ),
            });
        }

        self.payment.send_payment(&self.uid, self.amount_atoms).await?;

        let envelope = RoutedEnvelope::new(
            self.sender,
            RoutedMessage::Tip {
                amount_atoms: self.amount_atoms,
            },
        );
        self.outbox
            .enqueue(self.uid, encode_rm(&envelope)?, USER_PRIORITY, None)
            .await?;

        self.notify.publish(&ClientEvent::TipProgress {
            to: self.uid,
            amount_atoms: self.amount_atoms,
            settled: true,
        });
        Ok(())
    }
}
