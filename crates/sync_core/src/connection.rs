//! Lifecycle of the single transport session: dial, authenticate, hold the
//! read loop, and reconnect with exponential backoff when the session drops
//! out from under us.

use std::{sync::Arc, time::Duration};

use tokio::time::timeout;
use tracing::{info, warn};

use shared::protocol::{ClientFrame, ServerFrame};

use crate::{
    transport::{TransportEvent, TransportLink},
    EngineEvent, SessionState, SyncConfig, SyncEngine,
};

enum SessionOutcome {
    /// The epoch moved on (explicit disconnect or a newer connect).
    Superseded,
    /// Credentials refused. Terminal for this connect() call.
    AuthRejected(String),
    Dropped {
        reached_ready: bool,
        reason: String,
    },
}

pub(crate) fn backoff_delay(config: &SyncConfig, attempt: u32) -> Duration {
    let base_ms = config.backoff_base.as_millis() as u64;
    let cap_ms = config.backoff_cap.as_millis() as u64;
    let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(multiplier).min(cap_ms))
}

impl SyncEngine {
    /// Supervisor task: one iteration per physical connection attempt. The
    /// failure-attempt counter resets only on reaching ready.
    pub(crate) async fn run_connection(self: Arc<Self>, epoch: u64) {
        let mut failures: u32 = 0;
        loop {
            if !self.set_state(epoch, SessionState::Connecting).await {
                return;
            }

            let outcome = self.run_session(epoch).await;
            self.clear_session_link(epoch).await;

            match outcome {
                SessionOutcome::Superseded => return,
                SessionOutcome::AuthRejected(reason) => {
                    warn!(reason = %reason, "sync: authentication rejected, not retrying");
                    let _ = self.events.send(EngineEvent::AuthFailed {
                        reason: reason.clone(),
                    });
                    self.set_state(epoch, SessionState::Disconnected).await;
                    return;
                }
                SessionOutcome::Dropped {
                    reached_ready,
                    reason,
                } => {
                    if reached_ready {
                        failures = 0;
                    }
                    failures += 1;
                    if failures > self.config.max_reconnect_attempts {
                        warn!(
                            attempts = failures - 1,
                            reason = %reason,
                            "sync: reconnect attempts exhausted"
                        );
                        let _ = self.events.send(EngineEvent::ConnectionLost);
                        self.set_state(epoch, SessionState::Disconnected).await;
                        return;
                    }

                    let delay = backoff_delay(&self.config, failures - 1);
                    info!(
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "sync: transport dropped, backing off"
                    );
                    if !self.set_state(epoch, SessionState::Degraded).await {
                        return;
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One physical connection: dial, handshake, then pump frames into the
    /// dispatcher until the transport goes away.
    async fn run_session(self: &Arc<Self>, epoch: u64) -> SessionOutcome {
        let dialed = timeout(
            self.config.connect_timeout,
            self.transport.connect(&self.config.server_url),
        )
        .await;
        let link = match dialed {
            Ok(Ok(link)) => link,
            Ok(Err(err)) => {
                return SessionOutcome::Dropped {
                    reached_ready: false,
                    reason: err.to_string(),
                }
            }
            Err(_) => {
                return SessionOutcome::Dropped {
                    reached_ready: false,
                    reason: "connect timed out".into(),
                }
            }
        };
        let TransportLink { sink, mut events } = link;

        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return SessionOutcome::Superseded;
            }
            inner.writer = Some(sink.clone());
        }

        if !self.set_state(epoch, SessionState::Authenticating).await {
            return SessionOutcome::Superseded;
        }

        let auth = ClientFrame::Authenticate {
            user_id: self.identity.user_id.clone(),
            username: self.identity.username.clone(),
            token: self.identity.token.clone(),
        };
        if sink.send(auth).await.is_err() {
            return SessionOutcome::Dropped {
                reached_ready: false,
                reason: "transport closed before authenticate".into(),
            };
        }

        match self.await_authenticated(&mut events).await {
            AuthOutcome::Accepted => {}
            AuthOutcome::Rejected(reason) => return SessionOutcome::AuthRejected(reason),
            AuthOutcome::TransportLost(reason) => {
                return SessionOutcome::Dropped {
                    reached_ready: false,
                    reason,
                }
            }
        }

        if !self.enter_ready(epoch).await {
            return SessionOutcome::Superseded;
        }

        loop {
            match events.recv().await {
                Some(TransportEvent::Frame(frame)) => {
                    if self.epoch_changed(epoch).await {
                        return SessionOutcome::Superseded;
                    }
                    self.handle_frame(frame).await;
                }
                Some(TransportEvent::Closed { reason }) => {
                    return SessionOutcome::Dropped {
                        reached_ready: true,
                        reason,
                    }
                }
                None => {
                    return SessionOutcome::Dropped {
                        reached_ready: true,
                        reason: "transport event stream ended".into(),
                    }
                }
            }
        }
    }

    async fn await_authenticated(
        &self,
        events: &mut tokio::sync::mpsc::Receiver<TransportEvent>,
    ) -> AuthOutcome {
        let wait = timeout(self.config.auth_timeout, async {
            loop {
                match events.recv().await {
                    Some(TransportEvent::Frame(ServerFrame::Authenticated { success, error })) => {
                        return AuthOutcome::from_reply(success, error);
                    }
                    Some(TransportEvent::Frame(_)) => {
                        // The relay must not fan anything out before the
                        // handshake completes; tolerate it anyway.
                        continue;
                    }
                    Some(TransportEvent::Closed { reason }) => {
                        return AuthOutcome::TransportLost(reason);
                    }
                    None => {
                        return AuthOutcome::TransportLost(
                            "transport closed during authentication".into(),
                        );
                    }
                }
            }
        })
        .await;
        match wait {
            Ok(outcome) => outcome,
            Err(_) => AuthOutcome::TransportLost("authentication timed out".into()),
        }
    }

    /// Ready entry: a fresh physical connection means the server has no
    /// memory of prior room subscriptions, so the confirmed-join cache is
    /// cleared before the reconciler and the outbox flush are kicked off.
    async fn enter_ready(self: &Arc<Self>, epoch: u64) -> bool {
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return false;
            }
            inner.session = SessionState::Ready;
            inner.confirmed_rooms.clear();
            inner.reconcile = Default::default();
        }
        let _ = self
            .events
            .send(EngineEvent::StateChanged(SessionState::Ready));
        info!("sync: session ready");

        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.reconcile_rooms(epoch).await });
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.flush_outbox(epoch).await });
        true
    }

    /// Drops the writer and fails all in-flight join waits for this session.
    async fn clear_session_link(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return;
        }
        inner.writer = None;
        inner.pending_joins.clear();
    }
}

enum AuthOutcome {
    Accepted,
    Rejected(String),
    TransportLost(String),
}

impl AuthOutcome {
    fn from_reply(success: bool, error: Option<String>) -> Self {
        if success {
            AuthOutcome::Accepted
        } else {
            AuthOutcome::Rejected(error.unwrap_or_else(|| "credentials refused".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base_up_to_cap() {
        let config = SyncConfig {
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_secs(12),
            ..SyncConfig::default()
        };

        let delays: Vec<Duration> = (0..8).map(|n| backoff_delay(&config, n)).collect();
        assert_eq!(delays[0], Duration::from_millis(1000));
        assert_eq!(delays[1], Duration::from_millis(2000));
        assert_eq!(delays[2], Duration::from_millis(4000));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|d| *d <= config.backoff_cap));
        assert_eq!(*delays.last().expect("delays"), config.backoff_cap);
    }

    #[test]
    fn backoff_survives_large_attempt_counts() {
        let config = SyncConfig::default();
        assert_eq!(backoff_delay(&config, 63), config.backoff_cap);
        assert_eq!(backoff_delay(&config, 64), config.backoff_cap);
    }
}
