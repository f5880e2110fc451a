use super::*;

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Mutex as StdMutex,
};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use tokio::time::timeout;

use crate::crypto::{generate_chat_key, CryptoError};
use shared::domain::{ChatKind, ContentState, MessageKind};
use shared::protocol::{Envelope, EnvelopeEncryption, MessageFrame};
use storage::Storage;

struct RelayBehavior {
    auth_ok: bool,
    confirm_joins: bool,
    fail_first_dials: u32,
}

impl Default for RelayBehavior {
    fn default() -> Self {
        Self {
            auth_ok: true,
            confirm_joins: true,
            fail_first_dials: 0,
        }
    }
}

struct RelayState {
    behavior: RelayBehavior,
    dials: AtomicU32,
    sent: StdMutex<Vec<ClientFrame>>,
    conns: StdMutex<Vec<mpsc::Sender<TransportEvent>>>,
}

/// Scripted in-process relay: answers the handshake and join requests
/// according to its behavior flags, records every outbound frame, and lets a
/// test inject inbound frames or kill the live connection.
#[derive(Clone)]
struct FakeRelay {
    state: Arc<RelayState>,
}

impl FakeRelay {
    fn new() -> Self {
        Self::with(RelayBehavior::default())
    }

    fn with(behavior: RelayBehavior) -> Self {
        Self {
            state: Arc::new(RelayState {
                behavior,
                dials: AtomicU32::new(0),
                sent: StdMutex::new(Vec::new()),
                conns: StdMutex::new(Vec::new()),
            }),
        }
    }

    fn dial_count(&self) -> u32 {
        self.state.dials.load(Ordering::SeqCst)
    }

    fn sent_frames(&self) -> Vec<ClientFrame> {
        self.state.sent.lock().expect("sent").clone()
    }

    fn join_requests(&self) -> Vec<ChatId> {
        self.sent_frames()
            .into_iter()
            .filter_map(|frame| match frame {
                ClientFrame::JoinChat { chat_id } => Some(chat_id),
                _ => None,
            })
            .collect()
    }

    fn sent_messages(&self) -> Vec<MessageFrame> {
        self.sent_frames()
            .into_iter()
            .filter_map(|frame| match frame {
                ClientFrame::SendMessage { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    async fn deliver(&self, frame: ServerFrame) {
        let tx = {
            self.state
                .conns
                .lock()
                .expect("conns")
                .last()
                .cloned()
                .expect("no live connection")
        };
        tx.send(TransportEvent::Frame(frame)).await.expect("deliver");
    }

    async fn drop_connection(&self) {
        let tx = { self.state.conns.lock().expect("conns").last().cloned() };
        if let Some(tx) = tx {
            let _ = tx
                .send(TransportEvent::Closed {
                    reason: "test drop".into(),
                })
                .await;
        }
    }
}

#[async_trait]
impl Transport for FakeRelay {
    async fn connect(&self, _server_url: &str) -> anyhow::Result<TransportLink> {
        let dial = self.state.dials.fetch_add(1, Ordering::SeqCst);
        if dial < self.state.behavior.fail_first_dials {
            return Err(anyhow!("dial refused"));
        }

        let (sink_tx, mut sink_rx) = mpsc::channel::<ClientFrame>(64);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(64);
        self.state
            .conns
            .lock()
            .expect("conns")
            .push(event_tx.clone());

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(frame) = sink_rx.recv().await {
                state.sent.lock().expect("sent").push(frame.clone());
                match frame {
                    ClientFrame::Authenticate { .. } => {
                        let reply = ServerFrame::Authenticated {
                            success: state.behavior.auth_ok,
                            error: (!state.behavior.auth_ok).then(|| "bad token".to_string()),
                        };
                        if event_tx.send(TransportEvent::Frame(reply)).await.is_err() {
                            break;
                        }
                    }
                    ClientFrame::JoinChat { chat_id } => {
                        if state.behavior.confirm_joins
                            && event_tx
                                .send(TransportEvent::Frame(ServerFrame::JoinedChat { chat_id }))
                                .await
                                .is_err()
                        {
                            break;
                        }
                    }
                    ClientFrame::SendMessage { .. } | ClientFrame::Typing { .. } => {}
                }
            }
        });

        Ok(TransportLink {
            sink: sink_tx,
            events: event_rx,
        })
    }
}

struct FailingCrypto;

impl CryptoGateway for FailingCrypto {
    fn encrypt(&self, _plaintext: &[u8], _key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::EncryptionFailed)
    }

    fn decrypt(&self, _envelope: &[u8], _key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::DecryptionFailed)
    }
}

struct Harness {
    engine: Arc<SyncEngine>,
    relay: FakeRelay,
    storage: Storage,
    events: broadcast::Receiver<EngineEvent>,
    chat: ChatId,
    me: UserId,
}

fn test_config() -> SyncConfig {
    SyncConfig {
        server_url: "ws://test.relay".into(),
        connect_timeout: Duration::from_millis(500),
        auth_timeout: Duration::from_millis(500),
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(40),
        max_reconnect_attempts: 4,
        join_timeout: Duration::from_millis(200),
        join_gap: Duration::from_millis(1),
        reconcile_attempts: 2,
        reconcile_retry_delay: Duration::from_millis(10),
        outbox_ttl: Duration::from_secs(300),
        outbox_cap: 32,
        processed_cap: 16,
        event_buffer: 256,
    }
}

async fn harness_with(
    relay: FakeRelay,
    config: SyncConfig,
    crypto: Arc<dyn CryptoGateway>,
) -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let me = UserId::from("u-alice");
    storage.upsert_user(&me, "alice", None).await.expect("user");
    let chat = ChatId::from("c-general");
    storage
        .create_chat(&chat, "general", ChatKind::Group, &me)
        .await
        .expect("chat");

    let identity = SessionIdentity {
        user_id: me.clone(),
        username: "alice".into(),
        token: "tok-1".into(),
    };
    let engine = SyncEngine::with_storage(
        config,
        identity,
        Arc::new(relay.clone()),
        storage.clone(),
        crypto,
    );
    let events = engine.subscribe_events();
    Harness {
        engine,
        relay,
        storage,
        events,
        chat,
        me,
    }
}

async fn harness() -> Harness {
    harness_with(FakeRelay::new(), test_config(), Arc::new(PassthroughCrypto)).await
}

async fn wait_for<F>(events: &mut broadcast::Receiver<EngineEvent>, mut predicate: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event before timeout")
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition before timeout");
}

async fn wait_ready(harness: &mut Harness) {
    wait_for(&mut harness.events, |event| {
        matches!(event, EngineEvent::StateChanged(SessionState::Ready))
    })
    .await;
}

async fn wait_settled(harness: &mut Harness) {
    wait_for(&mut harness.events, |event| {
        matches!(event, EngineEvent::ReconcileSettled { .. })
    })
    .await;
}

fn inbound(id: &str, chat: &ChatId, sender: &str, envelope: Envelope) -> ServerFrame {
    ServerFrame::NewMessage {
        message: MessageFrame {
            message_id: MessageId::from(id),
            chat_id: chat.clone(),
            sender_id: UserId::from(sender),
            sender_username: None,
            kind: MessageKind::Text,
            envelope,
            sent_at: Utc::now(),
        },
    }
}

#[tokio::test]
async fn reaches_ready_and_reconciles_membership() {
    let mut h = harness().await;
    h.engine.connect().await.expect("connect");

    wait_ready(&mut h).await;
    wait_for(&mut h.events, |event| {
        matches!(event, EngineEvent::RoomJoined { .. })
    })
    .await;
    let settled = wait_for(&mut h.events, |event| {
        matches!(event, EngineEvent::ReconcileSettled { .. })
    })
    .await;
    assert!(matches!(settled, EngineEvent::ReconcileSettled { unconfirmed: 0 }));

    assert_eq!(h.relay.join_requests(), vec![h.chat.clone()]);
    let status = h.engine.reconcile_status().await;
    assert!(status.settled);
    assert_eq!(status.confirmed, 1);
    assert_eq!(status.unconfirmed, 0);
}

#[tokio::test]
async fn duplicate_delivery_persists_exactly_once() {
    let mut h = harness().await;
    h.engine.connect().await.expect("connect");
    wait_settled(&mut h).await;

    let envelope = Envelope::plain("hi from bob");
    h.relay
        .deliver(inbound("m-dup", &h.chat, "u-bob", envelope.clone()))
        .await;
    wait_for(&mut h.events, |event| {
        matches!(event, EngineEvent::MessageReceived { .. })
    })
    .await;

    h.relay
        .deliver(inbound("m-dup", &h.chat, "u-bob", envelope))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stored = h.storage.chat_messages(&h.chat, 10, 0).await.expect("rows");
    assert_eq!(stored.len(), 1);

    let mut extra_receives = 0;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, EngineEvent::MessageReceived { .. }) {
            extra_receives += 1;
        }
    }
    assert_eq!(extra_receives, 0);
}

#[tokio::test]
async fn dedupe_survives_processed_set_eviction() {
    let mut config = test_config();
    config.processed_cap = 1;
    let mut h = harness_with(FakeRelay::new(), config, Arc::new(PassthroughCrypto)).await;
    h.engine.connect().await.expect("connect");
    wait_settled(&mut h).await;

    h.relay
        .deliver(inbound("m-1", &h.chat, "u-bob", Envelope::plain("one")))
        .await;
    wait_for(&mut h.events, |e| matches!(e, EngineEvent::MessageReceived { .. })).await;
    h.relay
        .deliver(inbound("m-2", &h.chat, "u-bob", Envelope::plain("two")))
        .await;
    wait_for(&mut h.events, |e| matches!(e, EngineEvent::MessageReceived { .. })).await;

    // m-1 has been evicted from the in-memory set; the store must still
    // suppress the replay.
    h.relay
        .deliver(inbound("m-1", &h.chat, "u-bob", Envelope::plain("one")))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stored = h.storage.chat_messages(&h.chat, 10, 0).await.expect("rows");
    assert_eq!(stored.len(), 2);
    let mut extra_receives = 0;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, EngineEvent::MessageReceived { .. }) {
            extra_receives += 1;
        }
    }
    assert_eq!(extra_receives, 0);
}

#[tokio::test]
async fn server_echo_of_own_send_creates_no_duplicate() {
    let mut h = harness().await;
    h.engine.connect().await.expect("connect");
    wait_settled(&mut h).await;

    h.engine
        .send_message(&h.chat, "my own words")
        .await
        .expect("send");
    wait_until(|| h.relay.sent_messages().len() == 1).await;

    let echoed = h.relay.sent_messages().remove(0);
    h.relay
        .deliver(ServerFrame::NewMessage { message: echoed })
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stored = h.storage.chat_messages(&h.chat, 10, 0).await.expect("rows");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "my own words");
    assert!(stored[0].transmitted_at.is_some());
}

#[tokio::test]
async fn offline_compose_is_durable_and_flushes_on_connect() {
    let mut h = harness().await;

    for n in 0..3 {
        h.engine
            .send_message(&h.chat, &format!("offline {n}"))
            .await
            .expect("send");
    }
    assert!(h.relay.sent_frames().is_empty());

    let stored = h.storage.chat_messages(&h.chat, 10, 0).await.expect("rows");
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|m| m.transmitted_at.is_none()));

    h.engine.connect().await.expect("connect");
    wait_ready(&mut h).await;
    wait_until(|| h.relay.sent_messages().len() == 3).await;

    let frames = h.relay.sent_frames();
    let first_join = frames
        .iter()
        .position(|f| matches!(f, ClientFrame::JoinChat { .. }))
        .expect("join frame");
    let first_send = frames
        .iter()
        .position(|f| matches!(f, ClientFrame::SendMessage { .. }))
        .expect("send frame");
    assert!(first_join < first_send, "flush must join before sending");

    timeout(Duration::from_secs(5), async {
        loop {
            let pending = h.storage.undelivered_messages(&h.me).await.expect("pending");
            if pending.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("flushed sends recorded as transmitted");
}

#[tokio::test]
async fn outbox_discards_sends_older_than_ttl() {
    let mut config = test_config();
    config.outbox_ttl = Duration::from_millis(50);
    let mut h = harness_with(FakeRelay::new(), config, Arc::new(PassthroughCrypto)).await;

    h.engine
        .send_message(&h.chat, "already stale")
        .await
        .expect("send");
    tokio::time::sleep(Duration::from_millis(120)).await;

    h.engine.connect().await.expect("connect");
    wait_settled(&mut h).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.relay.sent_messages().is_empty());
    // Discarded from the outbox, not from the world: the message is still
    // durable locally and visible to a later re-sync.
    let pending = h.storage.undelivered_messages(&h.me).await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].content, "already stale");
}

#[tokio::test]
async fn reconnect_resets_confirmed_join_cache() {
    let mut h = harness().await;
    h.engine.connect().await.expect("connect");
    wait_settled(&mut h).await;
    assert_eq!(h.relay.join_requests().len(), 1);

    h.relay.drop_connection().await;
    wait_for(&mut h.events, |event| {
        matches!(event, EngineEvent::StateChanged(SessionState::Degraded))
    })
    .await;

    wait_ready(&mut h).await;
    wait_settled(&mut h).await;

    // The new physical connection re-joined from scratch.
    assert_eq!(h.relay.join_requests().len(), 2);
    assert_eq!(h.relay.dial_count(), 2);
    let status = h.engine.reconcile_status().await;
    assert_eq!(status.confirmed, 1);
}

#[tokio::test]
async fn concurrent_reconcile_passes_do_not_rejoin_confirmed_rooms() {
    let mut h = harness().await;
    h.engine.connect().await.expect("connect");
    wait_settled(&mut h).await;
    assert_eq!(h.relay.join_requests().len(), 1);

    let epoch = { h.engine.inner.lock().await.epoch };
    let first = Arc::clone(&h.engine);
    let second = Arc::clone(&h.engine);
    tokio::join!(first.reconcile_rooms(epoch), second.reconcile_rooms(epoch));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.relay.join_requests().len(), 1);
}

#[tokio::test]
async fn unconfirmed_rooms_are_reported_not_fatal() {
    let relay = FakeRelay::with(RelayBehavior {
        confirm_joins: false,
        ..RelayBehavior::default()
    });
    let mut config = test_config();
    config.join_timeout = Duration::from_millis(40);
    let mut h = harness_with(relay, config, Arc::new(PassthroughCrypto)).await;

    h.engine.connect().await.expect("connect");
    let settled = wait_for(&mut h.events, |event| {
        matches!(event, EngineEvent::ReconcileSettled { .. })
    })
    .await;
    assert!(matches!(settled, EngineEvent::ReconcileSettled { unconfirmed: 1 }));

    let status = h.engine.reconcile_status().await;
    assert!(status.settled);
    assert_eq!(status.unconfirmed, 1);
    assert_eq!(status.confirmed, 0);
    // Both passes tried the room.
    assert_eq!(h.relay.join_requests().len(), 2);

    // Offline-first: the unconfirmed room still accepts sends.
    h.engine
        .send_message(&h.chat, "best effort")
        .await
        .expect("send");
    wait_until(|| !h.relay.sent_messages().is_empty()).await;
}

#[tokio::test]
async fn auth_rejection_is_terminal_and_surfaced() {
    let relay = FakeRelay::with(RelayBehavior {
        auth_ok: false,
        ..RelayBehavior::default()
    });
    let mut h = harness_with(relay, test_config(), Arc::new(PassthroughCrypto)).await;

    h.engine.connect().await.expect("connect");
    let failed = wait_for(&mut h.events, |event| {
        matches!(event, EngineEvent::AuthFailed { .. })
    })
    .await;
    assert!(matches!(failed, EngineEvent::AuthFailed { reason } if reason == "bad token"));
    wait_for(&mut h.events, |event| {
        matches!(event, EngineEvent::StateChanged(SessionState::Disconnected))
    })
    .await;

    // No automatic retry after a credential rejection.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.relay.dial_count(), 1);
    assert_eq!(h.engine.current_state().await, SessionState::Disconnected);
}

#[tokio::test]
async fn reconnect_cap_parks_engine_in_disconnected() {
    let relay = FakeRelay::with(RelayBehavior {
        fail_first_dials: u32::MAX,
        ..RelayBehavior::default()
    });
    let mut config = test_config();
    config.max_reconnect_attempts = 2;
    let mut h = harness_with(relay, config, Arc::new(PassthroughCrypto)).await;

    h.engine.connect().await.expect("connect");
    wait_for(&mut h.events, |event| {
        matches!(event, EngineEvent::ConnectionLost)
    })
    .await;
    wait_for(&mut h.events, |event| {
        matches!(event, EngineEvent::StateChanged(SessionState::Disconnected))
    })
    .await;

    assert_eq!(h.relay.dial_count(), 3, "initial dial plus two retries");
    // The cap is terminal until the caller reconnects explicitly.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.relay.dial_count(), 3);
    assert!(h.engine.connect().await.is_ok());
}

#[tokio::test]
async fn encryption_failure_falls_back_to_tagged_plaintext() {
    let mut h = harness_with(FakeRelay::new(), test_config(), Arc::new(FailingCrypto)).await;
    h.storage
        .save_chat_key(&h.chat, &generate_chat_key())
        .await
        .expect("key");

    h.engine.connect().await.expect("connect");
    wait_settled(&mut h).await;

    h.engine
        .send_message(&h.chat, "supposed to be secret")
        .await
        .expect("send");
    wait_until(|| h.relay.sent_messages().len() == 1).await;

    let frame = h.relay.sent_messages().remove(0);
    assert_eq!(frame.envelope.encryption, EnvelopeEncryption::Plain);
    assert_eq!(frame.envelope.payload().expect("payload"), b"supposed to be secret");

    let stored = h.storage.chat_messages(&h.chat, 10, 0).await.expect("rows");
    assert_eq!(stored[0].content_state, ContentState::Unencrypted);
    assert_eq!(stored[0].content, "supposed to be secret");
}

#[tokio::test]
async fn sealed_messages_round_trip_through_the_gateway() {
    let mut h = harness_with(FakeRelay::new(), test_config(), Arc::new(SealedCrypto)).await;
    let key = generate_chat_key();
    h.storage.save_chat_key(&h.chat, &key).await.expect("key");

    h.engine.connect().await.expect("connect");
    wait_settled(&mut h).await;

    let ciphertext = SealedCrypto.encrypt("chiffré".as_bytes(), &key).expect("encrypt");
    h.relay
        .deliver(inbound("m-sealed", &h.chat, "u-bob", Envelope::sealed(&ciphertext)))
        .await;
    wait_for(&mut h.events, |e| matches!(e, EngineEvent::MessageReceived { .. })).await;

    let stored = h.storage.chat_messages(&h.chat, 10, 0).await.expect("rows");
    assert_eq!(stored[0].content_state, ContentState::Clear);
    assert_eq!(stored[0].content, "chiffré");
}

#[tokio::test]
async fn decryption_failure_persists_marker_with_envelope() {
    let mut h = harness_with(FakeRelay::new(), test_config(), Arc::new(SealedCrypto)).await;
    h.storage
        .save_chat_key(&h.chat, &generate_chat_key())
        .await
        .expect("key");

    h.engine.connect().await.expect("connect");
    wait_settled(&mut h).await;

    let garbage = STANDARD.encode([0u8; 40]);
    let envelope = Envelope {
        encryption: EnvelopeEncryption::Sealed,
        payload_b64: garbage.clone(),
    };
    h.relay
        .deliver(inbound("m-opaque", &h.chat, "u-bob", envelope))
        .await;
    wait_for(&mut h.events, |e| matches!(e, EngineEvent::MessageReceived { .. })).await;

    // Content loss is worse than a visible error state.
    let stored = h.storage.chat_messages(&h.chat, 10, 0).await.expect("rows");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content_state, ContentState::DecryptFailed);
    assert_eq!(stored[0].content, garbage);
}

#[tokio::test]
async fn typing_is_ready_only_and_never_queued() {
    let mut h = harness().await;

    let err = h.engine.send_typing(&h.chat, true).await.expect_err("not ready");
    assert!(matches!(err, EngineError::NotReady));

    h.engine.connect().await.expect("connect");
    wait_settled(&mut h).await;
    h.engine.send_typing(&h.chat, true).await.expect("typing");
    wait_until(|| {
        h.relay
            .sent_frames()
            .iter()
            .any(|f| matches!(f, ClientFrame::Typing { is_typing: true, .. }))
    })
    .await;
}

#[tokio::test]
async fn typing_events_are_surfaced() {
    let mut h = harness().await;
    h.engine.connect().await.expect("connect");
    wait_settled(&mut h).await;

    h.relay
        .deliver(ServerFrame::UserTyping {
            chat_id: h.chat.clone(),
            user_id: UserId::from("u-bob"),
            is_typing: true,
        })
        .await;
    let event = wait_for(&mut h.events, |e| matches!(e, EngineEvent::Typing { .. })).await;
    assert!(matches!(event, EngineEvent::Typing { is_typing: true, .. }));
}

#[tokio::test]
async fn explicit_disconnect_never_reconnects() {
    let mut h = harness().await;
    h.engine.connect().await.expect("connect");
    wait_settled(&mut h).await;
    let dials = h.relay.dial_count();

    h.engine.disconnect().await;
    wait_for(&mut h.events, |event| {
        matches!(event, EngineEvent::StateChanged(SessionState::Disconnected))
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.relay.dial_count(), dials);
    assert_eq!(h.engine.current_state().await, SessionState::Disconnected);
    assert!(h.engine.reconcile_status().await.confirmed == 0);
}

mod ws_end_to_end {
    use super::*;
    use axum::{
        extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        response::IntoResponse,
        routing::get,
        Router,
    };

    async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
        ws.on_upgrade(relay_socket)
    }

    async fn relay_socket(mut socket: WebSocket) {
        while let Some(Ok(message)) = socket.recv().await {
            let WsMessage::Text(text) = message else {
                continue;
            };
            let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                continue;
            };
            let reply = match frame {
                ClientFrame::Authenticate { .. } => Some(ServerFrame::Authenticated {
                    success: true,
                    error: None,
                }),
                ClientFrame::JoinChat { chat_id } => Some(ServerFrame::JoinedChat { chat_id }),
                ClientFrame::SendMessage { message } => Some(ServerFrame::NewMessage {
                    message: MessageFrame {
                        message_id: MessageId::from("m-reply"),
                        chat_id: message.chat_id.clone(),
                        sender_id: UserId::from("u-bob"),
                        sender_username: Some("bob".into()),
                        kind: MessageKind::Text,
                        envelope: Envelope::plain("reply from bob"),
                        sent_at: Utc::now(),
                    },
                }),
                ClientFrame::Typing { .. } => None,
            };
            if let Some(reply) = reply {
                let text = serde_json::to_string(&reply).expect("encode");
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn spawn_relay() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = Router::new().route("/", get(ws_handler));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn engine_runs_over_a_real_websocket() {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let me = UserId::from("u-alice");
        storage.upsert_user(&me, "alice", None).await.expect("user");
        let chat = ChatId::from("c-ws");
        storage
            .create_chat(&chat, "ws", ChatKind::Group, &me)
            .await
            .expect("chat");

        let mut config = test_config();
        config.server_url = spawn_relay().await;

        let engine = SyncEngine::with_storage(
            config,
            SessionIdentity {
                user_id: me.clone(),
                username: "alice".into(),
                token: "tok-ws".into(),
            },
            Arc::new(WsTransport),
            storage.clone(),
            Arc::new(PassthroughCrypto),
        );
        let mut events = engine.subscribe_events();

        engine.connect().await.expect("connect");
        wait_for(&mut events, |event| {
            matches!(event, EngineEvent::ReconcileSettled { unconfirmed: 0 })
        })
        .await;

        engine.send_message(&chat, "over the wire").await.expect("send");
        let received = wait_for(&mut events, |event| {
            matches!(event, EngineEvent::MessageReceived { .. })
        })
        .await;
        let EngineEvent::MessageReceived { message } = received else {
            unreachable!();
        };
        assert_eq!(message.sender_id, UserId::from("u-bob"));
        assert_eq!(message.content, "reply from bob");

        let stored = storage.chat_messages(&chat, 10, 0).await.expect("rows");
        assert_eq!(stored.len(), 2);

        engine.disconnect().await;
    }
}
