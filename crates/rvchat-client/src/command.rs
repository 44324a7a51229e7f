//! Commands for external → core communication.
//!
//! [`ClientCommand`] is the bounded-channel message type the RPC
//! services, tests, and embedding frontends use to drive the client.
//! Each command that produces a result carries a
//! `tokio::sync::oneshot::Sender` for the reply. Commands are processed
//! sequentially by the event loop, which serializes access to all
//! mutable state.

use rvchat_storage::PeerMeta;
use rvchat_types::{GcId, Result, UserId};
use rvchat_wire::Invitation;
use tokio::sync::oneshot;

/// Commands accepted by the client event loop.
pub enum ClientCommand {
    /// Send a private message. `user` resolves alias → nick → hex
    /// prefix.
    SendPm {
        /// Recipient, as typed by the user.
        user: String,
        /// Message text.
        msg: String,
        /// Completion: the message is durably queued (not yet
        /// delivered) when this fires.
        reply: oneshot::Sender<Result<()>>,
    },

    /// Send a group-chat message to every member.
    SendGcm {
        /// Group name or hex ID.
        gc: String,
        /// Message text.
        msg: String,
        /// Completion: one outbox entry per member is queued.
        reply: oneshot::Sender<Result<()>>,
    },

    /// Create a new group with this identity as admin.
    CreateGc {
        /// Group name.
        name: String,
        /// The new group's ID.
        reply: oneshot::Sender<Result<GcId>>,
    },

    /// Invite a known peer into a group we administer.
    InviteToGc {
        /// Group name or hex ID.
        gc: String,
        /// Peer to invite.
        user: String,
        /// Completion: the invite is queued.
        reply: oneshot::Sender<Result<()>>,
    },

    /// Produce an out-of-band invitation blob for a direct exchange.
    CreateInvitation {
        /// The invitation to hand to the other party out of band.
        reply: oneshot::Sender<Result<Invitation>>,
    },

    /// Accept an out-of-band invitation.
    AcceptInvitation {
        /// The invitation received out of band.
        invitation: Box<Invitation>,
        /// Completion: the reply is pushed; the exchange finishes when
        /// the inviter confirms.
        reply: oneshot::Sender<Result<()>>,
    },

    /// Ask a common peer to courier an invitation to a stranger.
    MediateKx {
        /// The mediator, as typed by the user.
        mediator: String,
        /// The stranger's identity.
        target: UserId,
        /// Completion: the couriered invitation is queued.
        reply: oneshot::Sender<Result<()>>,
    },

    /// Request a fresh ratchet with an existing peer.
    ResetKx {
        /// The peer, as typed by the user.
        user: String,
        /// Completion: the reset step is queued.
        reply: oneshot::Sender<Result<()>>,
    },

    /// Ask a peer to start sending us their posts.
    SubscribeToPosts {
        /// The peer, as typed by the user.
        user: String,
        /// Completion: the subscribe request is queued.
        reply: oneshot::Sender<Result<()>>,
    },

    /// Ask a peer to stop sending us their posts.
    UnsubscribeToPosts {
        /// The peer, as typed by the user.
        user: String,
        /// Completion: the unsubscribe request is queued.
        reply: oneshot::Sender<Result<()>>,
    },

    /// Tip a peer over the payment daemon.
    TipUser {
        /// The peer, as typed by the user.
        user: String,
        /// Amount in DCR.
        dcr_amount: f64,
        /// Completion: the payment settled and the tip announcement is
        /// queued. Fails synchronously when policy declines.
        reply: oneshot::Sender<Result<()>>,
    },

    /// List all known peers.
    ListPeers {
        /// Peers with metadata.
        reply: oneshot::Sender<Vec<(UserId, PeerMeta)>>,
    },

    /// Begin graceful shutdown.
    Shutdown,
}

// Manual Debug because oneshot::Sender does not implement Debug.
impl std::fmt::Debug for ClientCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendPm { user, .. } => f.debug_struct("SendPm").field("user", user).finish_non_exhaustive(),
            Self::SendGcm { gc, .. } => f.debug_struct("SendGcm").field("gc", gc).finish_non_exhaustive(),
            Self::CreateGc { name, .. } => f.debug_struct("CreateGc").field("name", name).finish_non_exhaustive(),
            Self::InviteToGc { gc, user, .. } => f
                .debug_struct("InviteToGc")
                .field("gc", gc)
                .field("user", user)
                .finish_non_exhaustive(),
            Self::CreateInvitation { .. } => f.write_str("CreateInvitation"),
            Self::AcceptInvitation { .. } => f.write_str("AcceptInvitation"),
            Self::MediateKx { mediator, target, .. } => f
                .debug_struct("MediateKx")
                .field("mediator", mediator)
                .field("target", target)
                .finish_non_exhaustive(),
            Self::ResetKx { user, .. } => f.debug_struct("ResetKx").field("user", user).finish_non_exhaustive(),
            Self::SubscribeToPosts { user, .. } => f
                .debug_struct("SubscribeToPosts")
                .field("user", user)
                .finish_non_exhaustive(),
            Self::UnsubscribeToPosts { user, .. } => f
                .debug_struct("UnsubscribeToPosts")
                .field("user", user)
                .finish_non_exhaustive(),
            Self::TipUser { user, dcr_amount, .. } => f
                .debug_struct("TipUser")
                .field("user", user)
                .field("dcr_amount", dcr_amount)
                .finish_non_exhaustive(),
            Self::ListPeers { .. } => f.write_str("ListPeers"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}
