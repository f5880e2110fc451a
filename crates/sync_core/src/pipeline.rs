//! The message pipeline. Send: optimistic echo, encrypt with fallback,
//! persist first, then transmit or defer. Receive: dedupe, drop self-echo,
//! decrypt with a tagged failure state, persist, then notify.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use shared::{
    domain::{ChatId, ContentState, MessageId, MessageKind},
    protocol::{ClientFrame, Envelope, EnvelopeEncryption, MessageFrame},
};
use storage::StoredMessage;

use crate::{
    outbox::PendingKind, EngineError, EngineEvent, SyncEngine,
};

/// Bounded set of message ids already applied in this process lifetime,
/// evicting oldest-first. Purely an idempotence cache in front of the
/// store's duplicate-insert protection, never authoritative.
pub struct ProcessedMessageSet {
    cap: usize,
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl ProcessedMessageSet {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.seen.contains(message_id)
    }

    pub fn insert(&mut self, message_id: MessageId) {
        if self.seen.contains(&message_id) {
            return;
        }
        while self.order.len() >= self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(message_id.clone());
        self.seen.insert(message_id);
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl SyncEngine {
    /// Send path. Never blocks on connectivity: the message is durable in
    /// the local store before the network is consulted at all, and a session
    /// that is not ready only costs live delivery, not the message.
    pub async fn send_message(
        self: &Arc<Self>,
        chat_id: &ChatId,
        text: &str,
    ) -> Result<MessageId, EngineError> {
        let sent_at = Utc::now();
        let message_id = MessageId::generate(sent_at, &self.identity.user_id);

        let mut record = StoredMessage {
            message_id: message_id.clone(),
            chat_id: chat_id.clone(),
            sender_id: self.identity.user_id.clone(),
            kind: MessageKind::Text,
            content: text.to_string(),
            content_state: ContentState::Clear,
            sent_at,
            transmitted_at: None,
        };

        // Optimistic echo before any await on the store or the network.
        let _ = self.events.send(EngineEvent::MessagePending {
            message: record.clone(),
        });

        let (envelope, content_state) = self.seal_envelope(chat_id, text).await;
        record.content_state = content_state;

        // The durability point. A message that only ever existed in the
        // optimistic event does not count as sent.
        if let Err(err) = self.store.save_message(&record).await {
            let _ = self.events.send(EngineEvent::MessageFailed {
                message_id: message_id.clone(),
                error: err.to_string(),
            });
            return Err(EngineError::Store(err));
        }

        let frame = MessageFrame {
            message_id: message_id.clone(),
            chat_id: chat_id.clone(),
            sender_id: self.identity.user_id.clone(),
            sender_username: Some(self.identity.username.clone()),
            kind: MessageKind::Text,
            envelope,
            sent_at,
        };

        if self.is_ready().await {
            // Opportunistic join-then-send; an unconfirmed room does not
            // block the send, it only weakens the live-delivery guarantee.
            if let Err(err) = self.ensure_in_room(chat_id).await {
                debug!(chat_id = %chat_id, error = %err, "sync: sending to unconfirmed room");
            }
            match self
                .transmit(ClientFrame::SendMessage {
                    message: frame.clone(),
                })
                .await
            {
                Ok(()) => {
                    if let Err(err) = self.store.mark_transmitted(&message_id, Utc::now()).await {
                        warn!(message_id = %message_id, error = %err, "sync: transmission not recorded");
                    }
                }
                Err(_) => self.defer_send(frame).await,
            }
        } else {
            self.defer_send(frame).await;
        }

        Ok(message_id)
    }

    /// Typing is ephemeral: transmitted only on a ready session, never
    /// deferred. Replaying a stale typing signal is meaningless.
    pub async fn send_typing(&self, chat_id: &ChatId, is_typing: bool) -> Result<(), EngineError> {
        if !self.is_ready().await {
            return Err(EngineError::NotReady);
        }
        self.transmit(ClientFrame::Typing {
            chat_id: chat_id.clone(),
            is_typing,
        })
        .await
    }

    async fn seal_envelope(&self, chat_id: &ChatId, text: &str) -> (Envelope, ContentState) {
        match self.store.recipient_key_for_chat(chat_id).await {
            Ok(Some(mut key)) => {
                let sealed = self.crypto.encrypt(text.as_bytes(), &key);
                key.zeroize();
                match sealed {
                    Ok(ciphertext) => (Envelope::sealed(&ciphertext), ContentState::Clear),
                    Err(err) => {
                        warn!(chat_id = %chat_id, error = %err, "sync: encryption failed, sending unencrypted");
                        (Envelope::plain(text), ContentState::Unencrypted)
                    }
                }
            }
            Ok(None) => {
                warn!(chat_id = %chat_id, "sync: no recipient key, sending unencrypted");
                (Envelope::plain(text), ContentState::Unencrypted)
            }
            Err(err) => {
                warn!(chat_id = %chat_id, error = %err, "sync: key lookup failed, sending unencrypted");
                (Envelope::plain(text), ContentState::Unencrypted)
            }
        }
    }

    /// Queues a send for the next ready session, with a join ahead of it so
    /// the flush subscribes before it transmits.
    async fn defer_send(&self, frame: MessageFrame) {
        let mut inner = self.inner.lock().await;
        if !inner.outbox.has_pending_join(&frame.chat_id) {
            inner.outbox.enqueue(PendingKind::Join {
                chat_id: frame.chat_id.clone(),
            });
        }
        inner.outbox.enqueue(PendingKind::Send { frame });
        debug!(queued = inner.outbox.len(), "outbox: send deferred");
    }

    /// Drains the outbox on ready. Stale entries are dropped inside
    /// `drain_fresh`; a transmit failure stops the flush, and whatever was
    /// not replayed is still durable and visible via `undelivered_messages`.
    pub(crate) async fn flush_outbox(self: &Arc<Self>, epoch: u64) {
        let ops = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            inner.outbox.drain_fresh(Instant::now())
        };
        if ops.is_empty() {
            return;
        }
        info!(operations = ops.len(), "outbox: flushing");

        for op in ops {
            if self.epoch_changed(epoch).await {
                return;
            }
            match op {
                PendingKind::Join { chat_id } => {
                    if let Err(err) = self.ensure_in_room(&chat_id).await {
                        debug!(chat_id = %chat_id, error = %err, "outbox: deferred join failed");
                    }
                }
                PendingKind::Send { frame } => {
                    let message_id = frame.message_id.clone();
                    match self
                        .transmit(ClientFrame::SendMessage { message: frame })
                        .await
                    {
                        Ok(()) => {
                            if let Err(err) =
                                self.store.mark_transmitted(&message_id, Utc::now()).await
                            {
                                warn!(message_id = %message_id, error = %err, "outbox: transmission not recorded");
                            }
                        }
                        Err(err) => {
                            debug!(message_id = %message_id, error = %err, "outbox: flush interrupted");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Receive path for one inbound message frame.
    pub(crate) async fn receive_message(self: &Arc<Self>, frame: MessageFrame) {
        {
            let inner = self.inner.lock().await;
            if inner.processed.contains(&frame.message_id) {
                debug!(message_id = %frame.message_id, "sync: duplicate delivery discarded");
                return;
            }
        }

        if frame.sender_id == self.identity.user_id {
            // The send path owns the authoritative local copy; the server
            // echo only serves as the delivery acknowledgment.
            if let Err(err) = self
                .store
                .mark_transmitted(&frame.message_id, Utc::now())
                .await
            {
                debug!(message_id = %frame.message_id, error = %err, "sync: echo ack not recorded");
            }
            return;
        }

        let (content, content_state) = self.open_envelope(&frame).await;
        let record = StoredMessage {
            message_id: frame.message_id.clone(),
            chat_id: frame.chat_id.clone(),
            sender_id: frame.sender_id.clone(),
            kind: frame.kind,
            content,
            content_state,
            sent_at: frame.sent_at,
            transmitted_at: None,
        };

        match self.store.save_message(&record).await {
            Ok(inserted) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.processed.insert(record.message_id.clone());
                }
                if inserted {
                    let _ = self
                        .events
                        .send(EngineEvent::MessageReceived { message: record });
                } else {
                    debug!(message_id = %record.message_id, "sync: store already held message");
                }
            }
            Err(err) => {
                // Lost for this delivery attempt only; recovery belongs to a
                // future re-sync, not an inline retry loop.
                warn!(message_id = %frame.message_id, error = %err, "sync: failed to persist inbound message");
            }
        }
    }

    async fn open_envelope(&self, frame: &MessageFrame) -> (String, ContentState) {
        let retained = || (frame.envelope.payload_b64.clone(), ContentState::DecryptFailed);

        match frame.envelope.encryption {
            EnvelopeEncryption::Plain => match frame.envelope.payload() {
                Ok(bytes) => (
                    String::from_utf8_lossy(&bytes).into_owned(),
                    ContentState::Unencrypted,
                ),
                Err(_) => retained(),
            },
            EnvelopeEncryption::Sealed => {
                let mut key = match self.store.recipient_key_for_chat(&frame.chat_id).await {
                    Ok(Some(key)) => key,
                    Ok(None) => {
                        warn!(chat_id = %frame.chat_id, "sync: no key for sealed message, keeping envelope");
                        return retained();
                    }
                    Err(err) => {
                        warn!(chat_id = %frame.chat_id, error = %err, "sync: key lookup failed, keeping envelope");
                        return retained();
                    }
                };
                let ciphertext = match frame.envelope.payload() {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        key.zeroize();
                        return retained();
                    }
                };
                let opened = self.crypto.decrypt(&ciphertext, &key);
                key.zeroize();
                match opened {
                    Ok(plaintext) => (
                        String::from_utf8_lossy(&plaintext).into_owned(),
                        ContentState::Clear,
                    ),
                    Err(err) => {
                        warn!(message_id = %frame.message_id, error = %err, "sync: decryption failed, keeping envelope");
                        retained()
                    }
                }
            }
        }
    }
}
