//! Room-membership reconciliation ("auto-join"): after every ready
//! transition, make the relay's live subscription set match the local
//! membership set, with bounded retries and per-room confirmation.

use std::sync::Arc;

use tokio::{sync::oneshot, time::timeout};
use tracing::{debug, info, warn};

use shared::{domain::ChatId, protocol::ClientFrame};

use crate::{EngineError, EngineEvent, PendingJoin, SessionState, SyncEngine};

/// Introspectable reconciliation state. `settled` means the bounded retries
/// are exhausted, not that every room is confirmed; the unconfirmed count
/// is the diagnostic for manual retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileStatus {
    pub in_flight: bool,
    pub settled: bool,
    pub confirmed: usize,
    pub unconfirmed: usize,
}

impl SyncEngine {
    /// One reconciliation run, triggered per ready entry. Single-flight: a
    /// second trigger while a run is live returns immediately, and rooms the
    /// dispatcher has confirmed in the meantime are skipped by every pass.
    pub(crate) async fn reconcile_rooms(self: &Arc<Self>, epoch: u64) {
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || inner.reconcile.in_flight {
                return;
            }
            inner.reconcile.in_flight = true;
            inner.reconcile.settled = false;
        }

        let mut unconfirmed = 0usize;
        for attempt in 0..self.config.reconcile_attempts {
            if self.epoch_changed(epoch).await {
                return;
            }

            let targets = match self
                .membership
                .chat_ids_for_user(&self.identity.user_id)
                .await
            {
                Ok(targets) => targets,
                Err(err) => {
                    warn!(error = %err, "join: failed to read membership target set");
                    break;
                }
            };

            let missing: Vec<ChatId> = {
                let inner = self.inner.lock().await;
                targets
                    .into_iter()
                    .filter(|chat_id| !inner.confirmed_rooms.contains(chat_id))
                    .collect()
            };
            if missing.is_empty() {
                unconfirmed = 0;
                break;
            }

            info!(
                attempt = attempt + 1,
                rooms = missing.len(),
                "join: reconciliation pass"
            );
            for chat_id in &missing {
                if self.epoch_changed(epoch).await {
                    return;
                }
                if let Err(err) = self.join_room(chat_id).await {
                    debug!(chat_id = %chat_id, error = %err, "join: room not confirmed this pass");
                }
                tokio::time::sleep(self.config.join_gap).await;
            }

            unconfirmed = {
                let inner = self.inner.lock().await;
                missing
                    .iter()
                    .filter(|chat_id| !inner.confirmed_rooms.contains(*chat_id))
                    .count()
            };
            if unconfirmed == 0 {
                break;
            }
            if attempt + 1 < self.config.reconcile_attempts {
                tokio::time::sleep(self.config.reconcile_retry_delay).await;
            }
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            inner.reconcile.in_flight = false;
            inner.reconcile.settled = true;
            inner.reconcile.unconfirmed = unconfirmed;
            inner.reconcile.confirmed = inner.confirmed_rooms.len();
        }
        if unconfirmed > 0 {
            warn!(unconfirmed, "join: reconciliation settled with unconfirmed rooms");
        }
        let _ = self
            .events
            .send(EngineEvent::ReconcileSettled { unconfirmed });
    }

    /// Join-then-send hook for the pipeline. Requires a ready session; a
    /// room that is already confirmed is a no-op (rooms are never left for
    /// the lifetime of a connection, so there is no inverse operation).
    pub async fn ensure_in_room(&self, chat_id: &ChatId) -> Result<(), EngineError> {
        {
            let inner = self.inner.lock().await;
            if !matches!(inner.session, SessionState::Ready) {
                return Err(EngineError::NotReady);
            }
            if inner.confirmed_rooms.contains(chat_id) {
                return Ok(());
            }
        }
        self.join_room(chat_id).await
    }

    /// Sends one join request and waits for the dispatcher to resolve it.
    /// Waiters for one room share a single in-flight request; the pending
    /// entry is removed on confirmation, refusal and timeout alike so no
    /// listener survives its wait.
    pub(crate) async fn join_room(&self, chat_id: &ChatId) -> Result<(), EngineError> {
        let (rx, must_send) = {
            let mut inner = self.inner.lock().await;
            if inner.confirmed_rooms.contains(chat_id) {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            match inner.pending_joins.get_mut(chat_id) {
                Some(pending) => {
                    pending.waiters.push(tx);
                    (rx, false)
                }
                None => {
                    inner
                        .pending_joins
                        .insert(chat_id.clone(), PendingJoin { waiters: vec![tx] });
                    (rx, true)
                }
            }
        };

        if must_send {
            if let Err(err) = self
                .transmit(ClientFrame::JoinChat {
                    chat_id: chat_id.clone(),
                })
                .await
            {
                self.abandon_join(chat_id).await;
                return Err(err);
            }
        }

        match timeout(self.config.join_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(EngineError::JoinRefused {
                chat_id: chat_id.clone(),
                reason,
            }),
            Ok(Err(_)) => Err(EngineError::Transport(
                "connection dropped during join".into(),
            )),
            Err(_) => {
                self.abandon_join(chat_id).await;
                Err(EngineError::JoinTimeout {
                    chat_id: chat_id.clone(),
                })
            }
        }
    }

    async fn abandon_join(&self, chat_id: &ChatId) {
        self.inner.lock().await.pending_joins.remove(chat_id);
    }

    /// Dispatcher half of the pending-request table: one confirmation (or
    /// refusal) resolves every waiter registered for the room.
    pub(crate) async fn resolve_join(&self, chat_id: &ChatId, result: Result<(), String>) {
        let waiters = {
            let mut inner = self.inner.lock().await;
            if result.is_ok() {
                inner.confirmed_rooms.insert(chat_id.clone());
                inner.reconcile.confirmed = inner.confirmed_rooms.len();
            }
            inner
                .pending_joins
                .remove(chat_id)
                .map(|pending| pending.waiters)
                .unwrap_or_default()
        };

        match &result {
            Ok(()) => {
                info!(chat_id = %chat_id, "join: confirmed");
                let _ = self.events.send(EngineEvent::RoomJoined {
                    chat_id: chat_id.clone(),
                });
            }
            Err(reason) => warn!(chat_id = %chat_id, reason = %reason, "join: refused"),
        }

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}
