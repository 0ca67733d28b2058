//! Observer lists for transport events

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Callback invoked with each event
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registration token returned by `on_*` methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Registered handlers, invoked in registration order
pub struct Handlers<E> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(HandlerId, Handler<E>)>>,
}

impl<E> Handlers<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler
    pub fn add(&self, handler: Handler<E>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.push((id, handler));
        id
    }

    /// Unregister a handler. Returns false if the id was not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Invoke every handler with `event`.
    ///
    /// Runs on a snapshot of the list so a handler may register or
    /// unregister handlers while being called.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries.iter().map(|(_, handler)| handler.clone()).collect()
        };
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Handlers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Handlers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").field("len", &self.len()).finish()
    }
}
