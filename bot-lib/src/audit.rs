use bot_db::audit::{AuditEvent, AuditLog};
use bot_traits::ForwardRefToTracing;
use parking_lot::Mutex;
use poise::serenity_prelude::{MessageId, UserId};
use std::collections::VecDeque;

/// Where moderation and lifecycle events end up.
///
/// Recording never fails from the caller's point of view, a lost audit
/// record is logged and otherwise ignored.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

impl AuditSink for AuditLog {
    fn record(&self, event: AuditEvent) {
        tracing::debug!(kind = %event.kind, actor = event.actor_id, "{}", event.reason);
        self.insert(&event).trace_err_ok();
    }
}

/// Longest message excerpt kept for the audit log.
const EXCERPT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remembered {
    pub id: MessageId,
    pub author: UserId,
    pub excerpt: String,
}

/// The last few member messages, so a deletion can say what was deleted.
///
/// Gateway delete events only carry ids.
pub struct MessageMemory {
    capacity: usize,
    messages: Mutex<VecDeque<Remembered>>,
}

impl MessageMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn remember(&self, id: MessageId, author: UserId, content: &str) {
        if self.capacity == 0 {
            return;
        }

        let mut messages = self.messages.lock();
        if messages.len() == self.capacity {
            messages.pop_front();
        }
        messages.push_back(Remembered {
            id,
            author,
            excerpt: content.chars().take(EXCERPT).collect(),
        });
    }

    /// Forgets and returns the message, if it is still remembered.
    pub fn take(&self, id: MessageId) -> Option<Remembered> {
        let mut messages = self.messages.lock();
        let index = messages.iter().position(|m| m.id == id)?;
        messages.remove(index)
    }
}
