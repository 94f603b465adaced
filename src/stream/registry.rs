//! Kind-keyed fan-out of push messages to handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::stream::proto::{MessageKind, PushMessage};

type Handler = Arc<dyn Fn(&PushMessage) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    handlers: HashMap<MessageKind, Vec<(SubscriptionId, Handler)>>,
}

/// Handlers per [`MessageKind`], invoked in subscription order.
///
/// Clones share the same table.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

/// Capability returned by [`SubscriptionRegistry::subscribe`]. Dropping it
/// does not unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    registry: Weak<Mutex<RegistryInner>>,
    kind: MessageKind,
    id: SubscriptionId,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: MessageKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&PushMessage) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));

        SubscriptionHandle {
            registry: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Runs every handler registered for the message's kind and returns how
    /// many ran. Unknown messages and kinds without handlers are no-ops.
    ///
    /// Handlers run outside the lock, so they may subscribe or unsubscribe.
    pub fn dispatch(&self, message: &PushMessage) -> usize {
        let Some(kind) = message.kind() else {
            return 0;
        };

        let handlers: Vec<Handler> = {
            let inner = lock(&self.inner);
            match inner.handlers.get(&kind) {
                Some(entries) => entries.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
                None => return 0,
            }
        };

        for handler in &handlers {
            handler(message);
        }
        handlers.len()
    }

    /// Drops every registration. Outstanding handles become no-ops.
    pub fn clear(&self) {
        lock(&self.inner).handlers.clear();
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        lock(&self.inner).handlers.get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).handlers.values().all(Vec::is_empty)
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        let mut map = f.debug_map();
        for (kind, entries) in &inner.handlers {
            map.entry(kind, &entries.len());
        }
        map.finish()
    }
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Removes this registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut inner = lock(&registry);
        let Some(entries) = inner.handlers.get_mut(&self.kind) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|(id, _)| *id != self.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            inner.handlers.remove(&self.kind);
        }
        removed
    }
}

fn lock(inner: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
