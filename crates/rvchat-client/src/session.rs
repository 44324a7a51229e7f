//! The server session: the sole speaker to the relay.
//!
//! One long-lived connection multiplexes four logical operations —
//! subscribe, push, pay, ack — plus keepalives. Each operation class
//! has a bounded in-flight window; callers await a permit when the
//! window is full. An operation completes when its frame has been
//! flushed into the transport.
//!
//! Connection loss triggers exponential-backoff reconnection with
//! jitter. On every (re-)connect the session re-subscribes all live
//! rendezvous tags from the [`RvManager`]; the outbox independently
//! re-pushes its un-acked entries when connectivity returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use rvchat_types::config::BackoffConfig;
use rvchat_types::event::ClientEvent;
use rvchat_types::{Result, RvChatError, RvTag};
use rvchat_wire::{read_frame, write_frame, ClientFrame, ServerFrame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::notify::NotifyBus;
use crate::rvmanager::{InboundBlob, RvManager};
use crate::transport::Dialer;

/// Bounded operation channel capacity.
const OP_CHANNEL_SIZE: usize = 128;

/// Capacity of the inbound server-frame channel per connection.
const FRAME_CHANNEL_SIZE: usize = 256;

// ---------------------------------------------------------------------------
// Session configuration
// ---------------------------------------------------------------------------

/// Tunables for the session task.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Keepalive ping interval. Two missed pongs reconnect.
    pub keepalive_interval: Duration,
    /// Reconnect backoff parameters.
    pub backoff: BackoffConfig,
    /// Maximum in-flight operations per class.
    pub inflight_window: usize,
    /// Grace period to drain queued operations at shutdown.
    pub shutdown_grace: Duration,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

enum SessionOp {
    Subscribe {
        rv: RvTag,
        paid: bool,
        done: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        rv: RvTag,
        done: oneshot::Sender<Result<()>>,
    },
    Push {
        rv: RvTag,
        payload: Vec<u8>,
        payment: Option<String>,
        done: oneshot::Sender<Result<()>>,
    },
    Ack {
        rv: RvTag,
        done: oneshot::Sender<Result<()>>,
    },
    Pay {
        invoice: String,
        preimage: String,
        done: oneshot::Sender<Result<()>>,
    },
}

impl SessionOp {
    fn fail(self, reason: &str) {
        let err = RvChatError::Transport {
            reason: reason.into(),
        };
        match self {
            Self::Subscribe { done, .. }
            | Self::Unsubscribe { done, .. }
            | Self::Push { done, .. }
            | Self::Ack { done, .. }
            | Self::Pay { done, .. } => {
                let _ = done.send(Err(err));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Cloneable handle for submitting operations to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    op_tx: mpsc::Sender<SessionOp>,
    subscribe_window: Arc<Semaphore>,
    push_window: Arc<Semaphore>,
    ack_window: Arc<Semaphore>,
    pay_window: Arc<Semaphore>,
    connected_rx: watch::Receiver<bool>,
}

impl SessionHandle {
    /// Whether the session currently has a live connection.
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// A watch receiver that flips on every connect/disconnect.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Subscribes to a rendezvous tag.
    pub async fn subscribe(&self, rv: RvTag, paid: bool) -> Result<()> {
        let _permit = self.permit(&self.subscribe_window).await?;
        self.submit(|done| SessionOp::Subscribe { rv, paid, done }).await
    }

    /// Drops a rendezvous subscription.
    pub async fn unsubscribe(&self, rv: RvTag) -> Result<()> {
        let _permit = self.permit(&self.subscribe_window).await?;
        self.submit(|done| SessionOp::Unsubscribe { rv, done }).await
    }

    /// Pushes a blob at a rendezvous tag.
    pub async fn push(&self, rv: RvTag, payload: Vec<u8>, payment: Option<String>) -> Result<()> {
        let _permit = self.permit(&self.push_window).await?;
        self.submit(|done| SessionOp::Push { rv, payload, payment, done })
            .await
    }

    /// Acknowledges consumption of a delivered blob.
    pub async fn ack(&self, rv: RvTag) -> Result<()> {
        let _permit = self.permit(&self.ack_window).await?;
        self.submit(|done| SessionOp::Ack { rv, done }).await
    }

    /// Settles a server invoice.
    pub async fn pay(&self, invoice: String, preimage: String) -> Result<()> {
        let _permit = self.permit(&self.pay_window).await?;
        self.submit(|done| SessionOp::Pay { invoice, preimage, done }).await
    }

    async fn permit<'a>(
        &self,
        window: &'a Semaphore,
    ) -> Result<tokio::sync::SemaphorePermit<'a>> {
        window.acquire().await.map_err(|_| RvChatError::Transport {
            reason: "session is shut down".into(),
        })
    }

    async fn submit<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> SessionOp,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.op_tx
            .send(make(done_tx))
            .await
            .map_err(|_| RvChatError::Transport {
                reason: "session task has exited".into(),
            })?;
        done_rx.await.map_err(|_| RvChatError::Transport {
            reason: "session dropped the operation".into(),
        })?
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

/// Everything the session task needs to run.
pub struct SessionTask {
    dialer: Arc<dyn Dialer>,
    config: SessionConfig,
    rvmanager: Arc<RvManager>,
    blob_tx: mpsc::Sender<InboundBlob>,
    invoice_tx: mpsc::Sender<InvoiceDemand>,
    notify: Arc<NotifyBus>,
    shutdown_rx: watch::Receiver<bool>,
}

/// A server payment demand, forwarded to the paid-policy gate.
#[derive(Clone, Debug)]
pub struct InvoiceDemand {
    /// The rendezvous tag the payment covers.
    pub rv: RvTag,
    /// Amount in atoms.
    pub amount_atoms: u64,
    /// The invoice to settle.
    pub invoice: String,
}

impl SessionTask {
    /// Spawns the session task, returning its handle and join handle.
    pub fn spawn(
        dialer: Arc<dyn Dialer>,
        config: SessionConfig,
        rvmanager: Arc<RvManager>,
        blob_tx: mpsc::Sender<InboundBlob>,
        invoice_tx: mpsc::Sender<InvoiceDemand>,
        notify: Arc<NotifyBus>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (op_tx, op_rx) = mpsc::channel(OP_CHANNEL_SIZE);
        let (connected_tx, connected_rx) = watch::channel(false);

        let window = config.inflight_window;
        let handle = SessionHandle {
            op_tx,
            subscribe_window: Arc::new(Semaphore::new(window)),
            push_window: Arc::new(Semaphore::new(window)),
            ack_window: Arc::new(Semaphore::new(window)),
            pay_window: Arc::new(Semaphore::new(window)),
            connected_rx,
        };

        let task = Self {
            dialer,
            config,
            rvmanager,
            blob_tx,
            invoice_tx,
            notify,
            shutdown_rx,
        };
        let join = tokio::spawn(task.run(op_rx, connected_tx));
        (handle, join)
    }

    async fn run(mut self, mut op_rx: mpsc::Receiver<SessionOp>, connected_tx: watch::Sender<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            match self.dialer.dial().await {
                Ok(conn) => {
                    attempt = 0;
                    let _ = connected_tx.send(true);
                    self.notify.publish(&ClientEvent::Connectivity {
                        connected: true,
                        reason: "connected to relay".into(),
                    });

                    let reason = self.run_connection(conn, &mut op_rx).await;
                    let _ = connected_tx.send(false);
                    self.notify.publish(&ClientEvent::Connectivity {
                        connected: false,
                        reason: reason.clone(),
                    });

                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                    tracing::warn!(%reason, "relay connection lost");
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "relay dial failed");
                }
            }

            // Exponential backoff with jitter before the next dial.
            let base = self.config.backoff.delay_ms(attempt);
            let jitter = rand::thread_rng().gen_range(0..=base / 4 + 1);
            attempt = attempt.saturating_add(1);

            let sleep = tokio::time::sleep(Duration::from_millis(base + jitter));
            tokio::pin!(sleep);
            tokio::select! {
                _ = &mut sleep => {}
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        op_rx.close();
        while let Ok(op) = op_rx.try_recv() {
            op.fail("session shut down");
        }
        tracing::info!("session task exited");
    }

    /// Drives one live connection until it fails or shutdown begins.
    /// Returns a human-readable reason.
    async fn run_connection(
        &mut self,
        conn: Box<dyn crate::transport::Conn>,
        op_rx: &mut mpsc::Receiver<SessionOp>,
    ) -> String {
        let (read_half, mut write_half) = tokio::io::split(conn);
        let (frame_tx, mut frame_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        let reader = spawn_reader(read_half, frame_tx);

        // Re-subscribe every live tag before anything else.
        for (rv, paid) in self.rvmanager.live_tags() {
            if let Err(e) = write_frame(&mut write_half, &ClientFrame::Subscribe { rv, paid }).await
            {
                reader.abort();
                return format!("re-subscribe failed: {e}");
            }
        }

        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_pong = Instant::now();

        let reason = loop {
            tokio::select! {
                op = op_rx.recv() => {
                    let Some(op) = op else { break "operation channel closed".to_string() };
                    if let Err(reason) = handle_op(&mut write_half, op).await {
                        break reason;
                    }
                }

                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => self.handle_server_frame(frame, &mut last_pong).await,
                        None => break "server closed the connection".to_string(),
                    }
                }

                _ = keepalive.tick() => {
                    if last_pong.elapsed() > self.config.keepalive_interval * 2 {
                        break "missed keepalives".to_string();
                    }
                    if let Err(e) = write_frame(&mut write_half, &ClientFrame::Ping).await {
                        break format!("keepalive write failed: {e}");
                    }
                }

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        drain_ops(&mut write_half, op_rx, self.config.shutdown_grace).await;
                        break "shutdown".to_string();
                    }
                }
            }
        };

        reader.abort();
        reason
    }

    async fn handle_server_frame(&self, frame: ServerFrame, last_pong: &mut Instant) {
        match frame {
            ServerFrame::PushPayload { rv, payload, delivery_id } => {
                let blob = InboundBlob {
                    tag: rv,
                    payload,
                    delivery_id,
                };
                if self.blob_tx.send(blob).await.is_err() {
                    tracing::warn!("inbound dispatcher gone, dropping blob");
                }
            }
            ServerFrame::InvoiceRequest { rv, amount_atoms, invoice } => {
                let demand = InvoiceDemand {
                    rv,
                    amount_atoms,
                    invoice,
                };
                if self.invoice_tx.send(demand).await.is_err() {
                    tracing::warn!("invoice consumer gone, dropping invoice request");
                }
            }
            ServerFrame::Error { code, text } => {
                tracing::warn!(code, %text, "relay reported error");
            }
            ServerFrame::Pong => {
                *last_pong = Instant::now();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection helpers
// ---------------------------------------------------------------------------

fn spawn_reader<R>(mut read_half: R, frame_tx: mpsc::Sender<ServerFrame>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match read_frame::<_, ServerFrame>(&mut read_half).await {
                Ok(frame) => {
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "session reader stopped");
                    break;
                }
            }
        }
    })
}

/// Writes one operation's frame. An operation completes (its `done`
/// fires `Ok`) once the frame is flushed; that is the session's ack to
/// the outbox.
async fn handle_op<W>(write_half: &mut W, op: SessionOp) -> std::result::Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    let (frame, done) = match op {
        SessionOp::Subscribe { rv, paid, done } => (ClientFrame::Subscribe { rv, paid }, done),
        SessionOp::Unsubscribe { rv, done } => (ClientFrame::Unsubscribe { rv }, done),
        SessionOp::Push { rv, payload, payment, done } => {
            (ClientFrame::Push { rv, payload, payment }, done)
        }
        SessionOp::Ack { rv, done } => (ClientFrame::AckReceived { rv }, done),
        SessionOp::Pay { invoice, preimage, done } => (ClientFrame::Pay { invoice, preimage }, done),
    };

    match write_frame(write_half, &frame).await {
        Ok(()) => {
            let _ = done.send(Ok(()));
            Ok(())
        }
        Err(e) => {
            let reason = format!("operation write failed: {e}");
            let _ = done.send(Err(RvChatError::Transport {
                reason: reason.clone(),
            }));
            Err(reason)
        }
    }
}

/// Flushes already-queued operations at shutdown, abandoning whatever
/// remains past the grace period.
async fn drain_ops<W>(write_half: &mut W, op_rx: &mut mpsc::Receiver<SessionOp>, grace: Duration)
where
    W: AsyncWrite + Unpin,
{
    let deadline = Instant::now() + grace;
    while let Ok(op) = op_rx.try_recv() {
        if Instant::now() > deadline {
            op.fail("shutdown grace period expired");
            continue;
        }
        if handle_op(write_half, op).await.is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::io::DuplexStream;

    /// Dialer handing out pre-created in-memory connections.
    struct MemoryDialer {
        conns: StdMutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl Dialer for MemoryDialer {
        async fn dial(&self) -> Result<Box<dyn crate::transport::Conn>> {
            let mut conns = self.conns.lock().unwrap();
            match conns.pop() {
                Some(conn) => Ok(Box::new(conn)),
                None => Err(RvChatError::Transport {
                    reason: "no more test connections".into(),
                }),
            }
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            keepalive_interval: Duration::from_secs(30),
            backoff: BackoffConfig {
                base_ms: 10,
                cap_ms: 50,
                max_attempts: 3,
            },
            inflight_window: 4,
            shutdown_grace: Duration::from_millis(200),
        }
    }

    fn tag(b: u8) -> RvTag {
        RvTag::new([b; 32])
    }

    struct Harness {
        handle: SessionHandle,
        server: DuplexStream,
        _blob_rx: mpsc::Receiver<InboundBlob>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn start_session(rvmanager: Arc<RvManager>) -> Harness {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let dialer = Arc::new(MemoryDialer {
            conns: StdMutex::new(vec![client_end]),
        });
        let (blob_tx, blob_rx) = mpsc::channel(16);
        let (invoice_tx, _invoice_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (handle, _join) = SessionTask::spawn(
            dialer,
            test_config(),
            rvmanager,
            blob_tx,
            invoice_tx,
            Arc::new(NotifyBus::new()),
            shutdown_rx,
        );

        Harness {
            handle,
            server: server_end,
            _blob_rx: blob_rx,
            shutdown_tx,
        }
    }

    #[tokio::test]
    async fn push_writes_frame_and_completes() {
        let mut h = start_session(Arc::new(RvManager::new()));

        h.handle
            .push(tag(1), vec![0xAB], None)
            .await
            .expect("push should complete");

        let frame: ClientFrame = read_frame(&mut h.server).await.unwrap();
        assert_eq!(
            frame,
            ClientFrame::Push {
                rv: tag(1),
                payload: vec![0xAB],
                payment: None
            }
        );
        let _ = h.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn connect_resubscribes_live_tags() {
        let rvmanager = Arc::new(RvManager::new());
        rvmanager
            .register(tag(7), Arc::new(|_| {}), true, true)
            .unwrap();

        let mut h = start_session(rvmanager);

        let frame: ClientFrame = read_frame(&mut h.server).await.unwrap();
        assert_eq!(frame, ClientFrame::Subscribe { rv: tag(7), paid: true });
        let _ = h.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn inbound_payload_reaches_dispatcher() {
        let (client_end, mut server_end) = tokio::io::duplex(64 * 1024);
        let dialer = Arc::new(MemoryDialer {
            conns: StdMutex::new(vec![client_end]),
        });
        let (blob_tx, mut blob_rx) = mpsc::channel(16);
        let (invoice_tx, _invoice_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (_handle, _join) = SessionTask::spawn(
            dialer,
            test_config(),
            Arc::new(RvManager::new()),
            blob_tx,
            invoice_tx,
            Arc::new(NotifyBus::new()),
            shutdown_rx,
        );

        write_frame(
            &mut server_end,
            &ServerFrame::PushPayload {
                rv: tag(3),
                payload: vec![1, 2],
                delivery_id: 9,
            },
        )
        .await
        .unwrap();

        let blob = blob_rx.recv().await.unwrap();
        assert_eq!(blob.tag, tag(3));
        assert_eq!(blob.delivery_id, 9);
        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn shutdown_fails_queued_ops_cleanly() {
        let h = start_session(Arc::new(RvManager::new()));
        let _ = h.shutdown_tx.send(true);
        // Give the task a moment to observe shutdown.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = h.handle.push(tag(1), vec![], None).await;
        assert!(result.is_err());
    }
}
