//! Client assembly: owns every subsystem and spawns the long-lived
//! tasks.
//!
//! Construction order matters: stores open first (fatal errors surface
//! before anything touches the network), then the session task, then
//! the outbox runner, then the event loop. All tasks share one
//! shutdown watch channel; [`RvClient::shutdown`] flips it and the
//! tasks drain and exit.

use std::sync::Arc;

use rvchat_storage::{GcStore, IdentityStore, OutboxStore, PeerStore};
use rvchat_types::config::ClientConfig;
use rvchat_types::{Result, UserId};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::command::ClientCommand;
use crate::delivery::Delivery;
use crate::event_loop::EventLoop;
use crate::gc::GcController;
use crate::kx::KxEngine;
use crate::notify::NotifyBus;
use crate::outbox::Outbox;
use crate::payment::{ConfirmGate, PaymentClient};
use crate::registry::Registry;
use crate::rvmanager::RvManager;
use crate::session::{SessionConfig, SessionHandle, SessionTask};
use crate::tasks::supervise;
use crate::transport::Dialer;

/// Bounded command channel capacity.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Capacity of the session → dispatcher blob channel.
const BLOB_CHANNEL_SIZE: usize = 256;

/// Capacity of the invoice-demand channel.
const INVOICE_CHANNEL_SIZE: usize = 16;

// ---------------------------------------------------------------------------
// RvClient
// ---------------------------------------------------------------------------

/// The assembled client core.
pub struct RvClient {
    local_id: UserId,
    command_tx: mpsc::Sender<ClientCommand>,
    delivery: Arc<Delivery>,
    notify: Arc<NotifyBus>,
    session: SessionHandle,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RvClient {
    /// Builds and starts the client core.
    ///
    /// The dialer, payment client, and confirmation gate are injected
    /// so frontends (and tests) choose their transports and wallets.
    pub async fn start(
        config: ClientConfig,
        dialer: Arc<dyn Dialer>,
        payment: Arc<dyn PaymentClient>,
        gate: Arc<dyn ConfirmGate>,
    ) -> Result<Self> {
        config.validate()?;
        let depth = config.backup_depth;

        // Stores first: identity problems are fatal and must surface
        // before any network activity.
        let identity = IdentityStore::new(&config.app_dir, depth)
            .load_or_generate(&config.nick, &config.network)?;
        let local_id = identity.user_id();

        let registry = Arc::new(Registry::open(PeerStore::new(&config.app_dir, depth))?);
        let delivery = Delivery::open(&config.app_dir, depth)?;
        let gc = Arc::new(GcController::open(
            GcStore::new(&config.app_dir, depth),
            local_id,
        )?);
        let rvmanager = Arc::new(RvManager::new());
        let notify = Arc::new(NotifyBus::new());

        // Channels.
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (blob_tx, blob_rx) = mpsc::channel(BLOB_CHANNEL_SIZE);
        let (invoice_tx, invoice_rx) = mpsc::channel(INVOICE_CHANNEL_SIZE);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (kx_tx, kx_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Session task.
        let session_config = SessionConfig {
            keepalive_interval: config.keepalive_interval,
            backoff: config.outbox_backoff.clone(),
            inflight_window: config.inflight_window,
            shutdown_grace: std::time::Duration::from_secs(5),
        };
        let (session, session_task) = SessionTask::spawn(
            dialer,
            session_config,
            rvmanager.clone(),
            blob_tx,
            invoice_tx,
            notify.clone(),
            shutdown_rx.clone(),
        );

        // Outbox and its retry scheduler.
        let outbox = Outbox::open(
            OutboxStore::new(&config.app_dir, depth),
            registry.clone(),
            session.clone(),
            notify.clone(),
            config.outbox_backoff.clone(),
        )?;
        let outbox_task = outbox.clone().spawn_runner(shutdown_rx.clone());

        // Key-exchange engine.
        let kx = Arc::new(KxEngine::new(
            identity.clone(),
            config.server.clone(),
            registry.clone(),
            rvmanager.clone(),
            session.clone(),
            outbox.clone(),
            delivery.clone(),
            notify.clone(),
            config.ratchet_window,
            config.kx_timeout,
            kx_tx,
            peer_tx.clone(),
        ));

        // Event loop.
        let event_loop = EventLoop {
            identity,
            config,
            registry,
            rvmanager,
            session: session.clone(),
            outbox,
            kx,
            gc,
            delivery: delivery.clone(),
            notify: notify.clone(),
            payment,
            gate,
            command_rx,
            blob_rx,
            peer_rx,
            peer_tx,
            kx_rx,
            invoice_rx,
            shutdown_tx: shutdown_tx.clone(),
            shutdown_rx: shutdown_rx.clone(),
            desync_counts: Default::default(),
            post_subscribers: Default::default(),
        };
        let loop_task = tokio::spawn(event_loop.run());

        // Panics inside any long-lived task are caught at the task
        // boundary, logged, and surfaced as a fatal notification.
        let tasks = vec![
            supervise(notify.clone(), "server session", session_task),
            supervise(notify.clone(), "outbox runner", outbox_task),
            supervise(notify.clone(), "event loop", loop_task),
        ];

        Ok(Self {
            local_id,
            command_tx,
            delivery,
            notify,
            session,
            shutdown_tx,
            tasks,
        })
    }

    /// This identity's UserId.
    pub fn local_id(&self) -> UserId {
        self.local_id
    }

    /// Sender for driving the client with commands. Cloneable.
    pub fn command_sender(&self) -> mpsc::Sender<ClientCommand> {
        self.command_tx.clone()
    }

    /// The durable delivery streams (PM, GCM, KX, posts, post-status).
    pub fn delivery(&self) -> Arc<Delivery> {
        self.delivery.clone()
    }

    /// The notification bus.
    pub fn notify(&self) -> Arc<NotifyBus> {
        self.notify.clone()
    }

    /// Whether the relay session is currently connected.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Signals shutdown and waits for every task to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "client task ended abnormally");
                }
            }
        }
        tracing::info!("client shut down");
    }
}
