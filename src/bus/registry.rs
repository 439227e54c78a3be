//! Subscriber registry.
//!
//! Maps event names to ordered handler lists. Handlers registered under
//! [`WILDCARD`] observe every event, after the name-specific ones.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::error;

use super::events::{BusEvent, WILDCARD};

/// Callback invoked for each matching event.
pub type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Token returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Entry {
    id: HandlerId,
    handler: Handler,
    once: bool,
}

/// Event name to handler list mapping.
#[derive(Default)]
pub struct SubscriberRegistry {
    handlers: RwLock<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every event named `event`.
    pub fn on(&self, event: &str, handler: Handler) -> HandlerId {
        self.insert(event, handler, false)
    }

    /// Register `handler` for the next event named `event` only.
    pub fn once(&self, event: &str, handler: Handler) -> HandlerId {
        self.insert(event, handler, true)
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.write();
        let mut removed = false;
        handlers.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    /// Number of handlers registered for `event`.
    pub fn count(&self, event: &str) -> usize {
        self.read().get(event).map_or(0, Vec::len)
    }

    /// Invoke every handler matching `event`, in registration order.
    ///
    /// The lock is released before handlers run, so a handler may register
    /// or remove handlers; such changes apply from the next event on. A
    /// panicking handler is logged and does not stop the others.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, event: &BusEvent) -> usize {
        let name = event.name();
        let selected = {
            let mut handlers = self.write();
            let mut selected = take_matching(&mut handlers, name);
            if name != WILDCARD {
                selected.extend(take_matching(&mut handlers, WILDCARD));
            }
            selected
        };

        for handler in &selected {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(event = %name, "Event handler panicked");
            }
        }
        selected.len()
    }

    fn insert(&self, event: &str, handler: Handler, once: bool) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write()
            .entry(event.to_string())
            .or_default()
            .push(Entry { id, handler, once });
        id
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Entry>>> {
        self.handlers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Entry>>> {
        self.handlers.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Clone the handlers for `name`, dropping one-shot entries from the map.
fn take_matching(handlers: &mut HashMap<String, Vec<Entry>>, name: &str) -> Vec<Handler> {
    let Some(entries) = handlers.get_mut(name) else {
        return Vec::new();
    };
    let selected = entries.iter().map(|e| Arc::clone(&e.handler)).collect();
    entries.retain(|e| !e.once);
    if entries.is_empty() {
        handlers.remove(name);
    }
    selected
}
