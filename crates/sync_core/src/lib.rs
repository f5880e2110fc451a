//! The connection & synchronization engine: one logical relay connection,
//! auto-join reconciliation, a de-duplicating message pipeline and a
//! TTL-bounded outbox, all in front of a local-first store.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::debug;

use shared::{
    domain::{ChatId, MessageId, UserId},
    protocol::{ClientFrame, ServerFrame},
};
use storage::StoredMessage;

pub mod config;
mod connection;
pub mod crypto;
pub mod outbox;
mod pipeline;
mod reconcile;
pub mod store;
pub mod transport;

pub use config::{load_config, SyncConfig};
pub use crypto::{CryptoGateway, PassthroughCrypto, SealedCrypto};
pub use pipeline::ProcessedMessageSet;
pub use reconcile::ReconcileStatus;
pub use store::{ChatMembershipProvider, LocalStore};
pub use transport::{Transport, TransportEvent, TransportLink, WsTransport};

use outbox::Outbox;

/// Who this engine instance acts as. The token was obtained by the (external)
/// login flow; the engine only replays it in the authenticate frame.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub username: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Degraded,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is already connected")]
    AlreadyConnected,
    #[error("engine is not connected")]
    NotConnected,
    #[error("session is not ready")]
    NotReady,
    #[error("join for chat {chat_id} timed out")]
    JoinTimeout { chat_id: ChatId },
    #[error("join for chat {chat_id} refused: {reason}")]
    JoinRefused { chat_id: ChatId, reason: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Events surfaced to subscribers (UI layer, CLI, tests).
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(SessionState),
    /// Credentials were refused; the engine will not retry on its own.
    AuthFailed { reason: String },
    /// Reconnect retries are exhausted; the caller must reconnect explicitly.
    ConnectionLost,
    /// Optimistic echo, emitted before the durable write completes.
    MessagePending { message: StoredMessage },
    /// The optimistic entry for this id must be rolled back.
    MessageFailed { message_id: MessageId, error: String },
    /// Persisted and safe to render.
    MessageReceived { message: StoredMessage },
    RoomJoined { chat_id: ChatId },
    ReconcileSettled { unconfirmed: usize },
    Typing {
        chat_id: ChatId,
        user_id: UserId,
        is_typing: bool,
    },
    Error(String),
}

pub struct SyncEngine {
    pub(crate) config: SyncConfig,
    pub(crate) identity: SessionIdentity,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) membership: Arc<dyn ChatMembershipProvider>,
    pub(crate) crypto: Arc<dyn CryptoGateway>,
    pub(crate) inner: Mutex<EngineState>,
    pub(crate) events: broadcast::Sender<EngineEvent>,
}

pub(crate) struct EngineState {
    pub(crate) session: SessionState,
    /// Bumped on every connect() and disconnect(). Tasks spawned for an older
    /// epoch observe the change at their next await point and stop, which is
    /// what invalidates every per-session cache below atomically.
    pub(crate) epoch: u64,
    pub(crate) writer: Option<mpsc::Sender<ClientFrame>>,
    pub(crate) supervisor: Option<JoinHandle<()>>,
    pub(crate) confirmed_rooms: HashSet<ChatId>,
    pub(crate) pending_joins: HashMap<ChatId, PendingJoin>,
    pub(crate) processed: ProcessedMessageSet,
    pub(crate) outbox: Outbox,
    pub(crate) reconcile: ReconcileStatus,
}

/// One in-flight join request; every concurrent waiter for the same chat
/// shares it, and the frame dispatcher resolves all of them at once.
pub(crate) struct PendingJoin {
    pub(crate) waiters: Vec<oneshot::Sender<Result<(), String>>>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        identity: SessionIdentity,
        transport: Arc<dyn Transport>,
        store: Arc<dyn LocalStore>,
        membership: Arc<dyn ChatMembershipProvider>,
        crypto: Arc<dyn CryptoGateway>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer);
        let state = EngineState {
            session: SessionState::Disconnected,
            epoch: 0,
            writer: None,
            supervisor: None,
            confirmed_rooms: HashSet::new(),
            pending_joins: HashMap::new(),
            processed: ProcessedMessageSet::new(config.processed_cap),
            outbox: Outbox::new(config.outbox_cap, config.outbox_ttl),
            reconcile: ReconcileStatus::default(),
        };
        Arc::new(Self {
            config,
            identity,
            transport,
            store,
            membership,
            crypto,
            inner: Mutex::new(state),
            events,
        })
    }

    /// Convenience constructor for the common case where one [`Storage`]
    /// value backs both the local store and the membership provider.
    pub fn with_storage(
        config: SyncConfig,
        identity: SessionIdentity,
        transport: Arc<dyn Transport>,
        storage: storage::Storage,
        crypto: Arc<dyn CryptoGateway>,
    ) -> Arc<Self> {
        let store = Arc::new(storage);
        Self::new(
            config,
            identity,
            transport,
            store.clone(),
            store,
            crypto,
        )
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn current_state(&self) -> SessionState {
        self.inner.lock().await.session
    }

    pub async fn is_ready(&self) -> bool {
        matches!(self.inner.lock().await.session, SessionState::Ready)
    }

    pub async fn reconcile_status(&self) -> ReconcileStatus {
        self.inner.lock().await.reconcile
    }

    /// Starts the connection supervisor. The engine must be disconnected;
    /// repeated calls while a session is live are an error, never a second
    /// physical connection.
    pub async fn connect(self: &Arc<Self>) -> Result<(), EngineError> {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if !matches!(inner.session, SessionState::Disconnected) {
                return Err(EngineError::AlreadyConnected);
            }
            inner.epoch += 1;
            inner.session = SessionState::Connecting;
            inner.epoch
        };
        let _ = self
            .events
            .send(EngineEvent::StateChanged(SessionState::Connecting));

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.run_connection(epoch).await });
        self.inner.lock().await.supervisor = Some(handle);
        Ok(())
    }

    /// Explicit teardown; never triggers auto-reconnect. Per-session caches
    /// are reset wholesale; they are caches, not authoritative state.
    pub async fn disconnect(&self) {
        let supervisor = {
            let mut inner = self.inner.lock().await;
            inner.epoch += 1;
            inner.session = SessionState::Disconnected;
            inner.writer = None;
            inner.confirmed_rooms.clear();
            inner.pending_joins.clear();
            inner.processed.clear();
            inner.reconcile = ReconcileStatus::default();
            inner.supervisor.take()
        };
        if let Some(handle) = supervisor {
            handle.abort();
        }
        let _ = self
            .events
            .send(EngineEvent::StateChanged(SessionState::Disconnected));
    }

    /// Central dispatcher for inbound frames while the session is live.
    pub(crate) async fn handle_frame(self: &Arc<Self>, frame: ServerFrame) {
        match frame {
            ServerFrame::NewMessage { message } => self.receive_message(message).await,
            ServerFrame::JoinedChat { chat_id } => self.resolve_join(&chat_id, Ok(())).await,
            ServerFrame::JoinChatError { chat_id, error } => {
                self.resolve_join(&chat_id, Err(error)).await
            }
            ServerFrame::UserTyping {
                chat_id,
                user_id,
                is_typing,
            } => {
                let _ = self.events.send(EngineEvent::Typing {
                    chat_id,
                    user_id,
                    is_typing,
                });
            }
            ServerFrame::Authenticated { .. } => {
                debug!("sync: authenticated frame outside handshake ignored");
            }
            ServerFrame::Error(err) => {
                let _ = self.events.send(EngineEvent::Error(err.to_string()));
            }
        }
    }

    pub(crate) async fn transmit(&self, frame: ClientFrame) -> Result<(), EngineError> {
        let writer = { self.inner.lock().await.writer.clone() };
        let writer = writer.ok_or(EngineError::NotConnected)?;
        writer
            .send(frame)
            .await
            .map_err(|_| EngineError::Transport("transport writer closed".into()))
    }

    pub(crate) async fn epoch_changed(&self, epoch: u64) -> bool {
        self.inner.lock().await.epoch != epoch
    }

    /// Epoch-guarded state transition; returns false when the session this
    /// transition belongs to has been superseded.
    pub(crate) async fn set_state(&self, epoch: u64, state: SessionState) -> bool {
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return false;
            }
            if inner.session == state {
                return true;
            }
            inner.session = state;
        }
        let _ = self.events.send(EngineEvent::StateChanged(state));
        true
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
