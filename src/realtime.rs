//! Realtime change broadcast.
//!
//! Subscribers register per user and receive events over a bounded channel.
//! Delivery is best-effort and non-blocking: a subscriber whose buffer is
//! full is dropped on the spot. There is no replay; clients that miss events
//! reconcile with a normal fetch.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Event types emitted by the core.
pub mod events {
    pub const MAIL_RECEIVED: &str = "mail.received";
    pub const MAIL_UPDATED: &str = "mail.updated";
    pub const MAIL_DELETED: &str = "mail.deleted";
    pub const SYNC_PROGRESS: &str = "sync.progress";
    pub const SYNC_COMPLETED: &str = "sync.completed";
    pub const SYNC_FAILED: &str = "sync.failed";
    pub const MODIFIER_APPLIED: &str = "modifier.applied";
    pub const MODIFIER_CONFLICT: &str = "modifier.conflict";
    pub const CONNECTION_STATUS: &str = "connection.status";
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub user_id: Uuid,
    pub payload: Value,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

pub struct Broadcaster {
    subscribers: DashMap<Uuid, Vec<Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Register a subscriber for a user. The returned id tears the
    /// subscription down via `unsubscribe` when the transport closes.
    pub fn subscribe(&self, user_id: Uuid) -> (u64, mpsc::Receiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        self.subscribers
            .entry(user_id)
            .or_default()
            .push(Subscriber { id, tx });

        (id, rx)
    }

    pub fn unsubscribe(&self, user_id: Uuid, subscriber_id: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(&user_id) {
            entry.retain(|s| s.id != subscriber_id);
        }
        self.subscribers
            .remove_if(&user_id, |_, subs| subs.is_empty());
    }

    /// Deliver an event to every subscriber of `user_id`. Subscribers that
    /// are closed or whose buffer is full are dropped.
    pub fn broadcast(&self, user_id: Uuid, event_type: &str, payload: Value) {
        let Some(mut entry) = self.subscribers.get_mut(&user_id) else {
            return;
        };

        let event = Event {
            event_type: event_type.to_string(),
            user_id,
            payload,
        };

        let before = entry.len();
        entry.retain(|subscriber| match subscriber.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "realtime: dropping slow subscriber {} for user {}",
                    subscriber.id,
                    user_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if entry.len() != before {
            log::debug!(
                "realtime: pruned {} subscribers for user {}",
                before - entry.len(),
                user_id
            );
        }
    }

    pub fn subscriber_count(&self, user_id: Uuid) -> usize {
        self.subscribers
            .get(&user_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}
