use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use shared::{domain::ChatId, protocol::MessageFrame};

#[derive(Debug, Clone)]
pub enum PendingKind {
    Send { frame: MessageFrame },
    Join { chat_id: ChatId },
}

#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub kind: PendingKind,
    pub enqueued_at: Instant,
}

/// Bounded FIFO of operations accepted while the session was not ready.
/// Entries never survive the process, and entries older than the TTL are
/// discarded at flush time rather than replayed. A stale send is worse than
/// a silent drop, because the message itself is already durable in the store.
#[derive(Debug)]
pub struct Outbox {
    entries: VecDeque<PendingOperation>,
    cap: usize,
    ttl: Duration,
}

impl Outbox {
    pub fn new(cap: usize, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            cap,
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn enqueue(&mut self, kind: PendingKind) {
        if self.entries.len() >= self.cap {
            warn!("outbox: full, dropping oldest deferred operation");
            self.entries.pop_front();
        }
        self.entries.push_back(PendingOperation {
            kind,
            enqueued_at: Instant::now(),
        });
    }

    pub fn has_pending_join(&self, chat_id: &ChatId) -> bool {
        self.entries.iter().any(|op| match &op.kind {
            PendingKind::Join { chat_id: pending } => pending == chat_id,
            PendingKind::Send { .. } => false,
        })
    }

    /// FIFO drain. Expired entries are dropped here, not at enqueue time, so
    /// the TTL is measured against the moment connectivity returned.
    pub fn drain_fresh(&mut self, now: Instant) -> Vec<PendingKind> {
        let mut fresh = Vec::new();
        let mut expired = 0usize;
        while let Some(op) = self.entries.pop_front() {
            if now.duration_since(op.enqueued_at) > self.ttl {
                expired += 1;
                continue;
            }
            fresh.push(op.kind);
        }
        if expired > 0 {
            debug!(expired, "outbox: discarded stale operations");
        }
        fresh
    }
}
