//! Typed pub/sub for the domain event taxonomy (§4.5).
//!
//! Publish is non-blocking: a full subscriber queue drops the event and bumps that
//! subscriber's lag counter rather than stalling the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{ChainId, Session, Transfer};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: Session },
    #[serde(rename = "session.recreated")]
    SessionRecreated {
        session: Session,
        original_session_id: Uuid,
    },
    #[serde(rename = "session.expired")]
    SessionExpired { session_id: Uuid },
    #[serde(rename = "session.completed")]
    SessionCompleted {
        session_id: Uuid,
        transfer_id: Uuid,
    },
    #[serde(rename = "transfer.detected")]
    TransferDetected {
        transfer: Transfer,
        session_id: Option<Uuid>,
        matched: bool,
        reason: Option<String>,
    },
    #[serde(rename = "transfer.updated")]
    TransferUpdated { transfer_id: Uuid, confirmations: u64 },
    #[serde(rename = "transfer.confirmed")]
    TransferConfirmed {
        transfer_id: Uuid,
        session_id: Option<Uuid>,
    },
    #[serde(rename = "chain.halted")]
    ChainHalted { network: ChainId, reason: String },
}

struct Subscriber {
    id: u64,
    sender: tokio::sync::mpsc::Sender<DomainEvent>,
    lagged: Arc<AtomicU64>,
}

/// Single-producer-multi-consumer broadcast of [`DomainEvent`]s.
///
/// Cloning an `EventBus` shares the same subscriber list; the registry holds one
/// instance and calls [`EventBus::publish`] after each committed mutation.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<std::sync::Mutex<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
}

pub struct Subscription {
    pub id: u64,
    pub receiver: tokio::sync::mpsc::Receiver<DomainEvent>,
    pub lagged: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(std::sync::Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = tokio::sync::mpsc::channel(self.queue_capacity);
        let lagged = Arc::new(AtomicU64::new(0));
        self.subscribers.lock().unwrap().push(Subscriber {
            id,
            sender,
            lagged: lagged.clone(),
        });
        Subscription { id, receiver, lagged }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().retain(|s| s.id != id);
    }

    /// Publishes to every subscriber without blocking; a full queue is a dropped
    /// delivery plus a `subscriber.lagged` increment, never a stall (§4.5, §5).
    pub fn publish(&self, event: DomainEvent) {
        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            if subscriber.sender.try_send(event.clone()).is_err() {
                subscriber.lagged.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(subscriber_id = subscriber.id, "event bus subscriber lagged, dropping event");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_drops_and_counts_lag_when_queue_is_full() {
        let bus = EventBus::new(2);
        let subscription = bus.subscribe();

        for _ in 0..2 {
            bus.publish(DomainEvent::SessionExpired {
                session_id: Uuid::new_v4(),
            });
        }
        assert_eq!(subscription.lagged.load(Ordering::SeqCst), 0);

        // Queue is now full; publish must not block and must count the drop.
        bus.publish(DomainEvent::SessionExpired {
            session_id: Uuid::new_v4(),
        });
        assert_eq!(subscription.lagged.load(Ordering::SeqCst), 1);

        bus.publish(DomainEvent::SessionExpired {
            session_id: Uuid::new_v4(),
        });
        assert_eq!(subscription.lagged.load(Ordering::SeqCst), 2);

        // The two queued events are still there, delivered in order; the
        // dropped ones never arrive.
        drop(bus);
        let mut receiver = subscription.receiver;
        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_err());
    }
}
