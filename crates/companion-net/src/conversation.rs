//! Prompt/answer exchanges with one team member over team chat.
//!
//! The dispatch loop offers every incoming team message to the
//! [`ConversationFactory`]; messages from a player with an open
//! [`Conversation`] are delivered to it. Aborting the factory ends every open
//! conversation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::messages::ChatMessage;

struct Slot {
    token: u64,
    tx: mpsc::UnboundedSender<ChatMessage>,
}

/// Open conversations keyed by the target's steam id.
#[derive(Default)]
pub struct ConversationFactory {
    active: Mutex<HashMap<u64, Slot>>,
    tokens: AtomicU64,
}

impl ConversationFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start listening for `target`. Replaces any conversation already open
    /// with the same player.
    pub fn open(self: &Arc<Self>, target: u64) -> Conversation {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(target, Slot { token, tx });
        Conversation {
            target,
            token,
            rx,
            factory: Arc::downgrade(self),
        }
    }

    /// Deliver `message` to the conversation with its sender, if any.
    pub fn route(&self, message: &ChatMessage) -> bool {
        let active = self.active.lock();
        match active.get(&message.steam_id) {
            Some(slot) => slot.tx.send(message.clone()).is_ok(),
            None => false,
        }
    }

    pub fn has_conversation(&self, target: u64) -> bool {
        self.active.lock().contains_key(&target)
    }

    /// End every open conversation.
    pub fn abort_all(&self) {
        let aborted = std::mem::take(&mut *self.active.lock());
        if !aborted.is_empty() {
            tracing::debug!(count = aborted.len(), "aborting conversations");
        }
    }

    fn close(&self, target: u64, token: u64) {
        let mut active = self.active.lock();
        if active.get(&target).is_some_and(|slot| slot.token == token) {
            active.remove(&target);
        }
    }
}

/// Receiving end of one open conversation.
pub struct Conversation {
    target: u64,
    token: u64,
    rx: mpsc::UnboundedReceiver<ChatMessage>,
    factory: Weak<ConversationFactory>,
}

impl Conversation {
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Next message from the target, or `None` once aborted.
    pub async fn next_answer(&mut self) -> Option<ChatMessage> {
        self.rx.recv().await
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        if let Some(factory) = self.factory.upgrade() {
            factory.close(self.target, self.token);
        }
    }
}
