//! End-to-end tests: full clients talking through an in-memory relay
//! that speaks the real frame protocol.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rvchat_client::client::RvClient;
use rvchat_client::command::ClientCommand;
use rvchat_client::payment::{ConfirmGate, FixedGate, NoPayments, PaymentClient};
use rvchat_client::transport::{Conn, Dialer};
use rvchat_storage::PendingRecord;
use rvchat_types::config::{BackoffConfig, ClientConfig, PaidPolicy};
use rvchat_types::{Result, RvChatError, RvTag, SequenceId, StreamKind};
use rvchat_wire::{read_frame, write_frame, ClientFrame, ServerFrame};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// In-memory relay
// ---------------------------------------------------------------------------

/// A store-and-forward relay over in-memory streams. Blobs are keyed by
/// rendezvous tag, delivered to at most one subscriber, and dropped on
/// ack.
#[derive(Clone)]
struct MemoryRelay {
    conn_tx: mpsc::UnboundedSender<DuplexStream>,
}

impl MemoryRelay {
    fn start() -> Self {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        tokio::spawn(relay_main(conn_rx));
        Self { conn_tx }
    }

    fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(RelayDialer {
            relay: self.clone(),
        })
    }
}

struct RelayDialer {
    relay: MemoryRelay,
}

#[async_trait]
impl Dialer for RelayDialer {
    async fn dial(&self) -> Result<Box<dyn Conn>> {
        let (client_end, server_end) = tokio::io::duplex(256 * 1024);
        self.relay
            .conn_tx
            .send(server_end)
            .map_err(|_| RvChatError::Transport {
                reason: "relay is gone".into(),
            })?;
        Ok(Box::new(client_end))
    }
}

/// Dialer that always fails, simulating an unreachable relay.
struct DeadDialer;

#[async_trait]
impl Dialer for DeadDialer {
    async fn dial(&self) -> Result<Box<dyn Conn>> {
        Err(RvChatError::Transport {
            reason: "relay unreachable".into(),
        })
    }
}

async fn relay_main(mut conn_rx: mpsc::UnboundedReceiver<DuplexStream>) {
    let mut stored: HashMap<RvTag, VecDeque<Vec<u8>>> = HashMap::new();
    let mut subs: HashMap<RvTag, usize> = HashMap::new();
    let mut conns: HashMap<usize, mpsc::UnboundedSender<ServerFrame>> = HashMap::new();
    let mut next_conn: usize = 0;
    let mut next_delivery: u64 = 1;

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<(usize, ClientFrame)>();

    loop {
        tokio::select! {
            conn = conn_rx.recv() => {
                let Some(conn) = conn else { break };
                next_conn += 1;
                let id = next_conn;
                let (mut read_half, mut write_half) = tokio::io::split(conn);

                let tx = frame_tx.clone();
                tokio::spawn(async move {
                    while let Ok(frame) = read_frame::<_, ClientFrame>(&mut read_half).await {
                        if tx.send((id, frame)).is_err() {
                            break;
                        }
                    }
                });

                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
                tokio::spawn(async move {
                    while let Some(frame) = out_rx.recv().await {
                        if write_frame(&mut write_half, &frame).await.is_err() {
                            break;
                        }
                    }
                });
                conns.insert(id, out_tx);
            }

            frame = frame_rx.recv() => {
                let Some((id, frame)) = frame else { break };
                match frame {
                    ClientFrame::Subscribe { rv, .. } => {
                        subs.insert(rv, id);
                        if let Some(queue) = stored.get_mut(&rv) {
                            while let Some(payload) = queue.pop_front() {
                                deliver(&conns, id, rv, payload, &mut next_delivery);
                            }
                        }
                    }
                    ClientFrame::Unsubscribe { rv } => {
                        subs.remove(&rv);
                    }
                    ClientFrame::Push { rv, payload, .. } => {
                        match subs.get(&rv) {
                            Some(sub) => deliver(&conns, *sub, rv, payload, &mut next_delivery),
                            None => stored.entry(rv).or_default().push_back(payload),
                        }
                    }
                    ClientFrame::AckReceived { rv } => {
                        stored.remove(&rv);
                    }
                    ClientFrame::Pay { .. } => {}
                    ClientFrame::Ping => {
                        if let Some(out) = conns.get(&id) {
                            let _ = out.send(ServerFrame::Pong);
                        }
                    }
                }
            }
        }
    }
}

fn deliver(
    conns: &HashMap<usize, mpsc::UnboundedSender<ServerFrame>>,
    conn: usize,
    rv: RvTag,
    payload: Vec<u8>,
    next_delivery: &mut u64,
) {
    let delivery_id = *next_delivery;
    *next_delivery += 1;
    if let Some(out) = conns.get(&conn) {
        let _ = out.send(ServerFrame::PushPayload {
            rv,
            payload,
            delivery_id,
        });
    }
}

// ---------------------------------------------------------------------------
// Client helpers
// ---------------------------------------------------------------------------

fn config(nick: &str, dir: &std::path::Path) -> ClientConfig {
    ClientConfig {
        network: "simnet".into(),
        nick: nick.into(),
        server: "relay:0".into(),
        app_dir: dir.to_path_buf(),
        ratchet_window: 16,
        outbox_backoff: BackoffConfig {
            base_ms: 50,
            cap_ms: 500,
            max_attempts: 5,
        },
        keepalive_interval: Duration::from_secs(30),
        paid_policy: PaidPolicy::Confirm,
        kx_timeout: Duration::from_secs(30),
        inflight_window: 8,
        backup_depth: 1,
    }
}

async fn start_client(
    nick: &str,
    dir: &std::path::Path,
    dialer: Arc<dyn Dialer>,
    gate: Arc<dyn ConfirmGate>,
) -> RvClient {
    start_client_with_payment(nick, dir, dialer, gate, Arc::new(NoPayments)).await
}

async fn start_client_with_payment(
    nick: &str,
    dir: &std::path::Path,
    dialer: Arc<dyn Dialer>,
    gate: Arc<dyn ConfirmGate>,
    payment: Arc<dyn PaymentClient>,
) -> RvClient {
    RvClient::start(config(nick, dir), dialer, payment, gate)
        .await
        .expect("client start")
}

/// Sends a command and awaits its reply.
async fn cmd<T>(
    client: &RvClient,
    make: impl FnOnce(oneshot::Sender<Result<T>>) -> ClientCommand,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    client
        .command_sender()
        .send(make(tx))
        .await
        .expect("command channel");
    timeout(WAIT, rx).await.expect("command timeout").expect("reply dropped")
}

/// Completes a direct key exchange: `inviter` invites, `responder`
/// accepts, both observe the completion on their KX streams.
async fn kx_pair(inviter: &RvClient, responder: &RvClient) {
    let mut inviter_kx = inviter
        .delivery()
        .subscribe(StreamKind::Kx, inviter.delivery().last_seq(StreamKind::Kx).unwrap())
        .unwrap();
    let mut responder_kx = responder
        .delivery()
        .subscribe(StreamKind::Kx, responder.delivery().last_seq(StreamKind::Kx).unwrap())
        .unwrap();

    let invitation = cmd(inviter, |reply| ClientCommand::CreateInvitation { reply })
        .await
        .expect("create invitation");
    cmd(responder, |reply| ClientCommand::AcceptInvitation {
        invitation: Box::new(invitation),
        reply,
    })
    .await
    .expect("accept invitation");

    next_record(&mut inviter_kx).await;
    next_record(&mut responder_kx).await;
}

async fn next_record(rx: &mut mpsc::Receiver<PendingRecord>) -> PendingRecord {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for stream record")
        .expect("stream closed")
}

async fn expect_silence(rx: &mut mpsc::Receiver<PendingRecord>) {
    let quiet = timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(quiet.is_err(), "unexpected stream record: {quiet:?}");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn two_party_pm_roundtrip() {
    let relay = MemoryRelay::start();
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();

    let alice = start_client("alice", alice_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;
    let bob = start_client("bob", bob_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;

    kx_pair(&alice, &bob).await;

    let mut bob_pm = bob.delivery().subscribe(StreamKind::Pm, 0).unwrap();
    cmd(&alice, |reply| ClientCommand::SendPm {
        user: "bob".into(),
        msg: "hello".into(),
        reply,
    })
    .await
    .expect("send pm");

    let record = next_record(&mut bob_pm).await;
    assert_eq!(record.sequence_id, 1);
    assert_eq!(record.payload["nick"], "alice");
    assert_eq!(record.payload["msg"], "hello");

    // Ack and reopen: no replay.
    bob.delivery().ack(StreamKind::Pm, SequenceId(1)).unwrap();
    let mut reopened = bob.delivery().subscribe(StreamKind::Pm, 1).unwrap();
    expect_silence(&mut reopened).await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_message_survives_restart_and_delivers_once() {
    let relay = MemoryRelay::start();
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();

    // Establish the pairing and one delivered message.
    let alice = start_client("alice", alice_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;
    let bob = start_client("bob", bob_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;
    kx_pair(&alice, &bob).await;

    let mut bob_pm = bob.delivery().subscribe(StreamKind::Pm, 0).unwrap();
    cmd(&alice, |reply| ClientCommand::SendPm {
        user: "bob".into(),
        msg: "hello".into(),
        reply,
    })
    .await
    .unwrap();
    assert_eq!(next_record(&mut bob_pm).await.sequence_id, 1);
    alice.shutdown().await;

    // Alice, offline, queues a message; enqueue succeeds because the
    // outbox records it durably before any push.
    let alice_offline = start_client(
        "alice",
        alice_dir.path(),
        Arc::new(DeadDialer),
        Arc::new(FixedGate(true)),
    )
    .await;
    cmd(&alice_offline, |reply| ClientCommand::SendPm {
        user: "bob".into(),
        msg: "boom".into(),
        reply,
    })
    .await
    .expect("offline enqueue");
    // Give the outbox a moment to attempt (and durably seal) the entry.
    tokio::time::sleep(Duration::from_millis(300)).await;
    alice_offline.shutdown().await;

    // Restarted with a working relay, the queued entry goes out and is
    // delivered exactly once.
    let alice_back = start_client("alice", alice_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;
    let record = next_record(&mut bob_pm).await;
    assert_eq!(record.sequence_id, 2);
    assert_eq!(record.payload["msg"], "boom");
    expect_silence(&mut bob_pm).await;

    alice_back.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn mediated_kx_connects_strangers() {
    let relay = MemoryRelay::start();
    let carol_dir = tempfile::tempdir().unwrap();
    let dan_dir = tempfile::tempdir().unwrap();
    let mal_dir = tempfile::tempdir().unwrap();

    let carol = start_client("carol", carol_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;
    let dan = start_client("dan", dan_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;
    let mal = start_client("mal", mal_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;

    kx_pair(&carol, &mal).await;
    kx_pair(&dan, &mal).await;

    let mut carol_kx = carol
        .delivery()
        .subscribe(StreamKind::Kx, carol.delivery().last_seq(StreamKind::Kx).unwrap())
        .unwrap();
    let mut dan_kx = dan
        .delivery()
        .subscribe(StreamKind::Kx, dan.delivery().last_seq(StreamKind::Kx).unwrap())
        .unwrap();

    cmd(&carol, |reply| ClientCommand::MediateKx {
        mediator: "mal".into(),
        target: dan.local_id(),
        reply,
    })
    .await
    .expect("mediate");

    let carol_event = next_record(&mut carol_kx).await;
    assert_eq!(carol_event.payload["peer"], serde_json::to_value(dan.local_id()).unwrap());
    assert_eq!(carol_event.payload["mediated"], true);

    let dan_event = next_record(&mut dan_kx).await;
    assert_eq!(dan_event.payload["peer"], serde_json::to_value(carol.local_id()).unwrap());

    // The new pair can message directly.
    let mut dan_pm = dan.delivery().subscribe(StreamKind::Pm, 0).unwrap();
    cmd(&carol, |reply| ClientCommand::SendPm {
        user: "dan".into(),
        msg: "hi dan".into(),
        reply,
    })
    .await
    .unwrap();
    assert_eq!(next_record(&mut dan_pm).await.payload["msg"], "hi dan");

    carol.shutdown().await;
    dan.shutdown().await;
    mal.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn group_invite_join_and_message() {
    let relay = MemoryRelay::start();
    let gina_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();

    let gina = start_client("gina", gina_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;
    let bob = start_client("bob", bob_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;
    kx_pair(&gina, &bob).await;

    let gc_id = cmd(&gina, |reply| ClientCommand::CreateGc {
        name: "room".into(),
        reply,
    })
    .await
    .expect("create gc");

    cmd(&gina, |reply| ClientCommand::InviteToGc {
        gc: "room".into(),
        user: "bob".into(),
        reply,
    })
    .await
    .expect("invite");

    // Join and membership update propagate; then a group message
    // reaches bob at the current generation.
    let mut bob_gcm = bob.delivery().subscribe(StreamKind::Gcm, 0).unwrap();

    // The join round-trips through the relay; retry the send until the
    // fan-out includes bob.
    let mut delivered = None;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        cmd(&gina, |reply| ClientCommand::SendGcm {
            gc: "room".into(),
            msg: "welcome".into(),
            reply,
        })
        .await
        .expect("send gcm");
        if let Ok(Some(record)) = timeout(Duration::from_millis(500), bob_gcm.recv()).await {
            delivered = Some(record);
            break;
        }
    }

    let record = delivered.expect("group message never delivered");
    assert_eq!(record.payload["gc"], serde_json::to_value(gc_id).unwrap());
    assert_eq!(record.payload["msg"], "welcome");
    assert_eq!(record.payload["nick"], "gina");

    gina.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_kx_restores_messaging() {
    let relay = MemoryRelay::start();
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();

    let alice = start_client("alice", alice_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;
    let bob = start_client("bob", bob_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;
    kx_pair(&alice, &bob).await;

    let mut bob_pm = bob.delivery().subscribe(StreamKind::Pm, 0).unwrap();
    cmd(&alice, |reply| ClientCommand::SendPm {
        user: "bob".into(),
        msg: "before".into(),
        reply,
    })
    .await
    .unwrap();
    assert_eq!(next_record(&mut bob_pm).await.payload["msg"], "before");

    // Fresh ratchet on suspicion of desync.
    let mut alice_kx = alice
        .delivery()
        .subscribe(StreamKind::Kx, alice.delivery().last_seq(StreamKind::Kx).unwrap())
        .unwrap();
    cmd(&alice, |reply| ClientCommand::ResetKx {
        user: "bob".into(),
        reply,
    })
    .await
    .expect("reset");
    next_record(&mut alice_kx).await;

    // Messaging continues on the superseding ratchet.
    cmd(&alice, |reply| ClientCommand::SendPm {
        user: "bob".into(),
        msg: "after".into(),
        reply,
    })
    .await
    .unwrap();
    assert_eq!(next_record(&mut bob_pm).await.payload["msg"], "after");

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn declined_confirmation_fails_tip_with_policy_error() {
    let relay = MemoryRelay::start();
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();

    // Gate answers "no"; the payment daemon would accept.
    let alice = start_client("alice", alice_dir.path(), relay.dialer(), Arc::new(FixedGate(false))).await;
    let bob = start_client("bob", bob_dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;
    kx_pair(&alice, &bob).await;

    let result = cmd(&alice, |reply| ClientCommand::TipUser {
        user: "bob".into(),
        dcr_amount: 0.5,
        reply,
    })
    .await;

    assert!(matches!(result, Err(RvChatError::PolicyRejected { .. })));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_recipient_is_rejected_synchronously() {
    let relay = MemoryRelay::start();
    let dir = tempfile::tempdir().unwrap();
    let alice = start_client("alice", dir.path(), relay.dialer(), Arc::new(FixedGate(true))).await;

    let result = cmd(&alice, |reply| ClientCommand::SendPm {
        user: "nobody".into(),
        msg: "x".into(),
        reply,
    })
    .await;
    assert!(matches!(result, Err(RvChatError::UserNotFound { .. })));

    alice.shutdown().await;
}
