//! Key-exchange engine: direct, mediated, and reset flows.
//!
//! A direct exchange starts with an out-of-band [`Invitation`]. The
//! responder answers with a sealed-box reply at the invitation's
//! rendezvous tag; the inviter completes the X3DH agreement, installs
//! the peer, and confirms with the first ratchet message. Mediated
//! exchanges courier the invitation through a peer both strangers
//! already know. A reset runs the same handshake with an existing peer,
//! carried over the old (possibly half-broken) ratchet; the fresh
//! ratchet atomically supersedes the old one in the registry.
//!
//! Per-attempt state machine:
//!
//! ```text
//! AwaitingReply ──reply──▶ Completing ──confirm──▶ Done
//!       │                     │
//!       └──────── deadline ───┴──▶ Timeout   (or Aborted by request)
//! ```
//!
//! Timed-out attempts clean up their rendezvous subscriptions and any
//! provisional peer record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use rvchat_crypto::dh::DhKeyPair;
use rvchat_ratchet::{derive_shared_root, kx as kxcrypto, Ratchet, RatchetConfig};
use rvchat_storage::LocalIdentity;
use rvchat_types::event::{ClientEvent, KxEvent};
use rvchat_types::{Result, RvChatError, RvTag, StreamKind, UserId};
use rvchat_wire::{decode_rm, encode_rm, Invitation, KxPhase, RoutedEnvelope, RoutedMessage};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::delivery::Delivery;
use crate::notify::NotifyBus;
use crate::outbox::Outbox;
use crate::registry::Registry;
use crate::rvmanager::{InboundBlob, RvManager};
use crate::session::SessionHandle;

/// Priority used for key-exchange control messages in the outbox.
const KX_PRIORITY: u8 = 0;

// ---------------------------------------------------------------------------
// Attempt bookkeeping
// ---------------------------------------------------------------------------

/// State of one exchange attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KxState {
    /// Inviter waiting for the sealed reply at the invitation tag.
    AwaitingReply,
    /// Responder waiting for the inviter's confirm message.
    Completing,
    /// Peer record installed and confirmed.
    Done,
    /// Deadline passed; subscriptions cleaned up.
    Timeout,
    /// Cancelled by request.
    Aborted,
}

struct KxAttempt {
    state: KxState,
    ephemeral: DhKeyPair,
    initial_rv: RvTag,
    /// Peer this attempt concerns, once known.
    peer: Option<UserId>,
    /// Peer record installed provisionally by this attempt; removed on
    /// timeout unless the attempt was a reset of an existing peer.
    provisional: bool,
    mediated: bool,
    deadline: Instant,
}

// ---------------------------------------------------------------------------
// KxEngine
// ---------------------------------------------------------------------------

/// The key-exchange engine. Driven by the client event loop.
pub struct KxEngine {
    identity: LocalIdentity,
    server: String,
    registry: Arc<Registry>,
    rvmanager: Arc<RvManager>,
    session: SessionHandle,
    outbox: Arc<Outbox>,
    delivery: Arc<Delivery>,
    notify: Arc<NotifyBus>,
    ratchet_window: usize,
    timeout: Duration,
    attempts: Mutex<HashMap<u64, KxAttempt>>,
    next_id: AtomicU64,
    /// Sealed reply blobs arriving at invitation tags are forwarded
    /// here, tagged with the attempt ID.
    reply_tx: mpsc::UnboundedSender<(u64, InboundBlob)>,
    /// Ratchet blobs for installed peers are forwarded here, tagged
    /// with the peer.
    peer_tx: mpsc::UnboundedSender<(UserId, InboundBlob)>,
}

impl KxEngine {
    /// Creates the engine.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: LocalIdentity,
        server: String,
        registry: Arc<Registry>,
        rvmanager: Arc<RvManager>,
        session: SessionHandle,
        outbox: Arc<Outbox>,
        delivery: Arc<Delivery>,
        notify: Arc<NotifyBus>,
        ratchet_window: usize,
        timeout: Duration,
        reply_tx: mpsc::UnboundedSender<(u64, InboundBlob)>,
        peer_tx: mpsc::UnboundedSender<(UserId, InboundBlob)>,
    ) -> Self {
        Self {
            identity,
            server,
            registry,
            rvmanager,
            session,
            outbox,
            delivery,
            notify,
            ratchet_window,
            timeout,
            attempts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            reply_tx,
            peer_tx,
        }
    }

    fn ratchet_config(&self) -> RatchetConfig {
        RatchetConfig {
            window: self.ratchet_window,
        }
    }

    /// Creates an out-of-band invitation and starts listening for the
    /// reply.
    pub async fn create_invitation(&self, mediated: bool) -> Result<Invitation> {
        let ephemeral = DhKeyPair::generate();
        let mut rv = [0u8; 32];
        rand::thread_rng().fill(&mut rv);
        let initial_rv = RvTag::new(rv);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reply_tx = self.reply_tx.clone();
        self.rvmanager.register(
            initial_rv,
            Arc::new(move |blob| {
                let _ = reply_tx.send((id, blob));
            }),
            false,
            false,
        )?;
        // Registered tags are re-subscribed on every connect; subscribe
        // now only when a connection is already live.
        if self.session.is_connected() {
            self.session.subscribe(initial_rv, false).await?;
        }

        self.attempts.lock().await.insert(
            id,
            KxAttempt {
                state: KxState::AwaitingReply,
                ephemeral: ephemeral.clone(),
                initial_rv,
                peer: None,
                provisional: false,
                mediated,
                deadline: Instant::now() + self.timeout,
            },
        );

        Ok(Invitation {
            from: self.identity.user_id(),
            nick: self.identity.nick.clone(),
            server: self.server.clone(),
            initial_rv,
            dh_pub: self.identity.dh.public(),
            ephemeral_pub: ephemeral.public(),
        })
    }

    /// Responder side: accepts an invitation, installs the provisional
    /// peer, and pushes the sealed reply at the invitation tag.
    pub async fn accept_invitation(&self, invitation: &Invitation, mediated: bool) -> Result<()> {
        if invitation.from == self.identity.user_id() {
            return Err(RvChatError::Config {
                reason: "cannot accept an invitation from ourselves".into(),
            });
        }

        let was_known = self.registry.knows(&invitation.from);
        // A reset supersedes the old ratchet: stop watching its tags so
        // stragglers cannot masquerade as decrypt failures afterwards.
        if was_known {
            if let Ok(old_tags) = self.registry.recv_tags(&invitation.from) {
                for tag in old_tags {
                    self.rvmanager.unregister(&tag);
                }
            }
        }
        let ephemeral = DhKeyPair::generate();
        let shared_root = derive_shared_root(
            &self.identity.dh,
            &ephemeral,
            &invitation.dh_pub,
            &invitation.ephemeral_pub,
            false,
        )?;
        let ratchet = Ratchet::new_responder(shared_root, ephemeral.clone(), self.ratchet_config())?;
        let first_recv = ratchet.next_recv_rv();

        // Install (or, on reset, atomically replace) the peer record,
        // then start watching its receive window for the confirm.
        self.registry
            .install_peer(invitation.from, invitation.nick.clone(), ratchet)?;
        crate::inbound::watch_peer_tags(
            invitation.from,
            &self.registry,
            &self.rvmanager,
            &self.session,
            &self.peer_tx,
        )
        .await?;

        let reply = RoutedEnvelope::new(
            self.identity.user_id(),
            RoutedMessage::KxStep {
                phase: KxPhase::Reply,
                from: self.identity.user_id(),
                nick: self.identity.nick.clone(),
                dh_pub: self.identity.dh.public(),
                ephemeral_pub: ephemeral.public(),
                step_rv: first_recv.unwrap_or(invitation.initial_rv),
            },
        );
        let sealed = kxcrypto::seal_to(&ephemeral, &invitation.ephemeral_pub, &encode_rm(&reply)?)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.attempts.lock().await.insert(
            id,
            KxAttempt {
                state: KxState::Completing,
                ephemeral,
                initial_rv: invitation.initial_rv,
                peer: Some(invitation.from),
                provisional: !was_known,
                mediated,
                deadline: Instant::now() + self.timeout,
            },
        );

        self.session
            .push(invitation.initial_rv, sealed.blob, None)
            .await?;
        tracing::info!(peer = %invitation.from, "key-exchange reply sent");
        Ok(())
    }

    /// Inviter side: processes the sealed reply that arrived at an
    /// invitation tag.
    pub async fn handle_reply_blob(&self, attempt_id: u64, blob: InboundBlob) -> Result<()> {
        let (ephemeral, mediated) = {
            let attempts = self.attempts.lock().await;
            let attempt = attempts.get(&attempt_id).ok_or_else(|| RvChatError::UnknownTag {
                reason: format!("reply for unknown key-exchange attempt {attempt_id}"),
            })?;
            if attempt.state != KxState::AwaitingReply {
                return Err(RvChatError::Malformed {
                    reason: format!("reply in state {:?}", attempt.state),
                });
            }
            (attempt.ephemeral.clone(), attempt.mediated)
        };

        let (_their_eph, plaintext) = kxcrypto::open_sealed(&ephemeral, &blob.payload)?;
        let envelope = decode_rm(&plaintext)?;
        let RoutedMessage::KxStep {
            phase: KxPhase::Reply,
            from,
            nick,
            dh_pub,
            ephemeral_pub,
            ..
        } = envelope.rm
        else {
            return Err(RvChatError::Malformed {
                reason: "invitation reply is not a key-exchange reply".into(),
            });
        };

        if from != envelope.sender {
            return Err(RvChatError::Malformed {
                reason: "key-exchange reply sender mismatch".into(),
            });
        }

        let shared_root =
            derive_shared_root(&self.identity.dh, &ephemeral, &dh_pub, &ephemeral_pub, true)?;
        let ratchet = Ratchet::new_inviter(shared_root, ephemeral_pub, self.ratchet_config())?;
        if self.registry.knows(&from) {
            if let Ok(old_tags) = self.registry.recv_tags(&from) {
                for tag in old_tags {
                    self.rvmanager.unregister(&tag);
                }
            }
        }
        self.registry.install_peer(from, nick.clone(), ratchet)?;
        crate::inbound::watch_peer_tags(
            from,
            &self.registry,
            &self.rvmanager,
            &self.session,
            &self.peer_tx,
        )
        .await?;

        // Confirm rides the new ratchet as its first message.
        let confirm = RoutedEnvelope::new(
            self.identity.user_id(),
            RoutedMessage::KxStep {
                phase: KxPhase::Confirm,
                from: self.identity.user_id(),
                nick: self.identity.nick.clone(),
                dh_pub: self.identity.dh.public(),
                ephemeral_pub,
                step_rv: blob.tag,
            },
        );
        self.outbox
            .enqueue(from, encode_rm(&confirm)?, KX_PRIORITY, None)
            .await?;

        if let Some(attempt) = self.attempts.lock().await.get_mut(&attempt_id) {
            attempt.state = KxState::Done;
            attempt.peer = Some(from);
        }

        self.complete(from, &nick, mediated)?;
        Ok(())
    }

    /// Responder side: the inviter's confirm arrived through the new
    /// ratchet.
    pub async fn handle_confirm(&self, from: &UserId) -> Result<()> {
        let mut attempts = self.attempts.lock().await;
        let Some((_, attempt)) = attempts
            .iter_mut()
            .find(|(_, a)| a.peer.as_ref() == Some(from) && a.state == KxState::Completing)
        else {
            // A confirm without an attempt: the peer re-sent it, or we
            // already completed. Harmless.
            tracing::debug!(peer = %from, "confirm without pending attempt");
            return Ok(());
        };
        attempt.state = KxState::Done;
        let mediated = attempt.mediated;
        drop(attempts);

        let nick = self.registry.nick_of(from)?;
        self.complete(*from, &nick, mediated)?;
        Ok(())
    }

    /// Requester side of a mediated exchange: sends the invitation to
    /// the mediator for couriering to `target`.
    pub async fn mediate(&self, mediator: &UserId, target: UserId) -> Result<()> {
        if self.registry.knows(&target) {
            return Err(RvChatError::Config {
                reason: format!("{target} is already a known peer"),
            });
        }

        let invitation = self.create_invitation(true).await?;
        let rm = RoutedEnvelope::new(
            self.identity.user_id(),
            RoutedMessage::MediateKx { target, invitation },
        );
        self.outbox
            .enqueue(*mediator, encode_rm(&rm)?, KX_PRIORITY, None)
            .await
    }

    /// Handles an inbound mediate message: forwards it when we are the
    /// mediator, accepts it when we are the target.
    pub async fn handle_mediate(
        &self,
        from: &UserId,
        target: UserId,
        invitation: Invitation,
    ) -> Result<()> {
        if target == self.identity.user_id() {
            // Final recipient: answer the couriered invitation.
            return self.accept_invitation(&invitation, true).await;
        }

        if !self.registry.knows(&target) {
            tracing::warn!(%target, mediator_peer = %from, "cannot mediate to unknown target");
            return Err(RvChatError::UserNotFound {
                reason: format!("mediation target {target} is not a peer"),
            });
        }

        let rm = RoutedEnvelope::new(
            self.identity.user_id(),
            RoutedMessage::MediateKx { target, invitation },
        );
        self.outbox
            .enqueue(target, encode_rm(&rm)?, KX_PRIORITY, None)
            .await
    }

    /// Requests a fresh ratchet with an existing peer. The reset step
    /// travels over the old ratchet; the rest is a direct exchange.
    pub async fn reset(&self, peer: &UserId) -> Result<()> {
        if !self.registry.knows(peer) {
            return Err(RvChatError::UserNotFound {
                reason: format!("cannot reset unknown peer {peer}"),
            });
        }

        let invitation = self.create_invitation(false).await?;
        let rm = RoutedEnvelope::new(
            self.identity.user_id(),
            RoutedMessage::KxStep {
                phase: KxPhase::Reset,
                from: self.identity.user_id(),
                nick: self.identity.nick.clone(),
                dh_pub: invitation.dh_pub,
                ephemeral_pub: invitation.ephemeral_pub,
                step_rv: invitation.initial_rv,
            },
        );
        self.outbox
            .enqueue(*peer, encode_rm(&rm)?, KX_PRIORITY, None)
            .await?;
        tracing::info!(%peer, "ratchet reset requested");
        Ok(())
    }

    /// Handles an inbound reset step: treat it as an invitation from
    /// the peer and answer it.
    pub async fn handle_reset(
        &self,
        from: &UserId,
        nick: String,
        dh_pub: [u8; 32],
        ephemeral_pub: [u8; 32],
        step_rv: RvTag,
    ) -> Result<()> {
        let invitation = Invitation {
            from: *from,
            nick,
            server: self.server.clone(),
            initial_rv: step_rv,
            dh_pub,
            ephemeral_pub,
        };
        self.accept_invitation(&invitation, false).await
    }

    /// Prunes attempts whose deadline passed: unregisters the
    /// invitation tag, drops provisional peers, marks `Timeout`.
    pub async fn tick(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut attempts = self.attempts.lock().await;
            for (id, attempt) in attempts.iter_mut() {
                if attempt.deadline <= now
                    && matches!(attempt.state, KxState::AwaitingReply | KxState::Completing)
                {
                    attempt.state = KxState::Timeout;
                    expired.push((
                        *id,
                        attempt.initial_rv,
                        attempt.peer.filter(|_| attempt.provisional),
                    ));
                }
            }
            attempts.retain(|_, a| !matches!(a.state, KxState::Timeout | KxState::Aborted));
        }

        for (id, rv, provisional_peer) in expired {
            tracing::warn!(attempt = id, tag = %rv, "key-exchange attempt timed out");
            self.rvmanager.unregister(&rv);
            let _ = self.session.unsubscribe(rv).await;
            if let Some(peer) = provisional_peer {
                if let Err(e) = self.registry.forget(&peer) {
                    tracing::warn!(%peer, error = %e, "failed to drop provisional peer");
                }
            }
        }
    }

    /// Current state of an attempt, for tests and diagnostics.
    pub async fn attempt_state(&self, id: u64) -> Option<KxState> {
        self.attempts.lock().await.get(&id).map(|a| a.state)
    }

    /// Emits the completion event on the KX stream and the bus.
    fn complete(&self, peer: UserId, nick: &str, mediated: bool) -> Result<()> {
        let event = KxEvent {
            peer,
            nick: nick.to_string(),
            mediated,
        };
        self.delivery.emit(StreamKind::Kx, &event)?;
        self.notify.publish(&ClientEvent::KxCompleted(event));
        tracing::info!(%peer, nick, mediated, "key exchange completed");
        Ok(())
    }
}
