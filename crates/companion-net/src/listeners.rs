//! Identity-scoped listener registries and the events they receive.
//!
//! Every registration returns a [`ListenerHandle`] that is used uniformly for
//! removal, whatever kind of listener it names. Handlers are async closures;
//! each event is delivered once per handler on its own task.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::identity::ServerIdentity;
use crate::messages::{ChatMessage, EntityPayload, EntityType, MapMarker, TeamInfo};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receives events of type `E`.
pub trait EventHandler<E>: Send + Sync {
    fn handle(&self, event: E) -> BoxFuture;
}

/// Blanket implementation for async closures.
impl<E, F, Fut> EventHandler<E> for F
where
    F: Fn(E) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, event: E) -> BoxFuture {
        Box::pin(self(event))
    }
}

/// Unique id of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque handle naming one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerHandle {
    Team(ListenerId),
    Chat(ListenerId),
    Entity { entity_id: u32, id: ListenerId },
    Marker(ListenerId),
    Protobuf(ListenerId),
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TeamEvent {
    pub player_id: u64,
    pub team: TeamInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEvent {
    pub message: ChatMessage,
}

/// State change of a subscribed entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEvent {
    pub entity_id: u32,
    /// Type reported when the subscription was resolved.
    pub entity_type: EntityType,
    pub payload: EntityPayload,
}

/// Raw inbound frame, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtobufEvent {
    pub bytes: Arc<[u8]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerEvent {
    pub marker: MapMarker,
    pub is_new: bool,
}

/// Resolved metadata stored alongside an entity listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMeta {
    pub entity_id: u32,
    pub entity_type: EntityType,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Entry<E, M> {
    id: ListenerId,
    meta: M,
    handler: Arc<dyn EventHandler<E>>,
}

/// Handlers for one event kind, grouped by server identity.
pub struct ListenerRegistry<E, M = ()> {
    entries: Mutex<HashMap<ServerIdentity, Vec<Entry<E, M>>>>,
}

impl<E, M> Default for ListenerRegistry<E, M> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<E, M> ListenerRegistry<E, M>
where
    E: Clone + Send + 'static,
{
    pub fn register(
        &self,
        identity: &ServerIdentity,
        meta: M,
        handler: Arc<dyn EventHandler<E>>,
    ) -> ListenerId {
        let id = ListenerId::next();
        self.insert(identity, id, meta, handler);
        id
    }

    /// Register under an id allocated earlier.
    pub(crate) fn insert(
        &self,
        identity: &ServerIdentity,
        id: ListenerId,
        meta: M,
        handler: Arc<dyn EventHandler<E>>,
    ) {
        self.entries
            .lock()
            .entry(identity.clone())
            .or_default()
            .push(Entry { id, meta, handler });
    }

    pub fn unregister(&self, identity: &ServerIdentity, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let Some(list) = entries.get_mut(identity) else {
            return false;
        };
        let before = list.len();
        list.retain(|entry| entry.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            entries.remove(identity);
        }
        removed
    }

    pub fn has(&self, identity: &ServerIdentity, id: ListenerId) -> bool {
        self.entries
            .lock()
            .get(identity)
            .is_some_and(|list| list.iter().any(|entry| entry.id == id))
    }

    /// Drop every handler registered for `identity`.
    pub fn unregister_all(&self, identity: &ServerIdentity) {
        self.entries.lock().remove(identity);
    }

    pub fn len(&self, identity: &ServerIdentity) -> usize {
        self.entries.lock().get(identity).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, identity: &ServerIdentity) -> bool {
        self.len(identity) == 0
    }

    /// Deliver `event` to every handler whose metadata satisfies `filter`.
    /// Returns the number of handlers invoked.
    pub fn emit_where(
        &self,
        identity: &ServerIdentity,
        filter: impl Fn(&M) -> bool,
        event: impl Fn(&M) -> E,
    ) -> usize {
        // Snapshot so handlers can (un)register without deadlocking.
        let targets: Vec<_> = {
            let entries = self.entries.lock();
            let Some(list) = entries.get(identity) else {
                return 0;
            };
            list.iter()
                .filter(|entry| filter(&entry.meta))
                .map(|entry| (Arc::clone(&entry.handler), event(&entry.meta)))
                .collect()
        };
        let count = targets.len();
        for (handler, event) in targets {
            tokio::spawn(handler.handle(event));
        }
        count
    }
}

impl<E> ListenerRegistry<E, ()>
where
    E: Clone + Send + 'static,
{
    pub fn emit(&self, identity: &ServerIdentity, event: E) -> usize {
        self.emit_where(identity, |_| true, |_| event.clone())
    }
}

/// Every listener registry a client owns.
#[derive(Default)]
pub struct EventRegistries {
    pub team: ListenerRegistry<TeamEvent>,
    pub chat: ListenerRegistry<ChatEvent>,
    pub entity: ListenerRegistry<EntityEvent, EntityMeta>,
    pub markers: ListenerRegistry<MarkerEvent>,
    pub protobuf: ListenerRegistry<ProtobufEvent>,
}

impl EventRegistries {
    /// Unregister whatever `handle` names. Returns whether anything was removed.
    pub fn remove(&self, identity: &ServerIdentity, handle: &ListenerHandle) -> bool {
        match *handle {
            ListenerHandle::Team(id) => self.team.unregister(identity, id),
            ListenerHandle::Chat(id) => self.chat.unregister(identity, id),
            ListenerHandle::Entity { id, .. } => self.entity.unregister(identity, id),
            ListenerHandle::Marker(id) => self.markers.unregister(identity, id),
            ListenerHandle::Protobuf(id) => self.protobuf.unregister(identity, id),
        }
    }

    pub fn contains(&self, identity: &ServerIdentity, handle: &ListenerHandle) -> bool {
        match *handle {
            ListenerHandle::Team(id) => self.team.has(identity, id),
            ListenerHandle::Chat(id) => self.chat.has(identity, id),
            ListenerHandle::Entity { id, .. } => self.entity.has(identity, id),
            ListenerHandle::Marker(id) => self.markers.has(identity, id),
            ListenerHandle::Protobuf(id) => self.protobuf.has(identity, id),
        }
    }
}
