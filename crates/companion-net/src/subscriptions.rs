//! Entity subscriptions requested while the connection was down.
//!
//! Each queued entry already owns its [`ListenerId`] so the caller gets a
//! usable handle immediately; the query that resolves the entity type is
//! issued once the connection opens.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::listeners::{EntityEvent, EventHandler, ListenerId};

/// A subscription waiting for the connection to open.
#[derive(Clone)]
pub struct PendingSubscription {
    pub entity_id: u32,
    pub id: ListenerId,
    pub handler: Arc<dyn EventHandler<EntityEvent>>,
}

impl std::fmt::Debug for PendingSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSubscription")
            .field("entity_id", &self.entity_id)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct SubscriptionQueue {
    pending: Mutex<Vec<PendingSubscription>>,
}

impl SubscriptionQueue {
    pub fn queue(&self, subscription: PendingSubscription) {
        tracing::debug!(entity_id = subscription.entity_id, "queueing subscription until connected");
        self.pending.lock().push(subscription);
    }

    /// Remove and return everything queued, in request order.
    pub fn take_pending(&self) -> Vec<PendingSubscription> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|sub| sub.id != id);
        pending.len() != before
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.pending.lock().iter().any(|sub| sub.id == id)
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
