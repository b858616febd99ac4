//! Event hub — minimal synchronous publish/subscribe.
//!
//! Listeners are keyed by event name. [`EventHub::publish`] runs every
//! listener registered at the moment of the call, from a snapshot, so a
//! listener may subscribe or unsubscribe while being dispatched. A listener
//! that panics is logged and does not stop its siblings.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::error;

/// A registered callback.
pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Identifies one registration, returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerMap<A> = HashMap<String, Vec<(ListenerId, Listener<A>)>>;

/// Publish/subscribe hub carrying payloads of type `A`.
pub struct EventHub<A> {
    listeners: Arc<Mutex<ListenerMap<A>>>,
    next_id: AtomicU64,
}

impl<A: 'static> EventHub<A> {
    /// Create a hub with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` for `event`. Dropping the returned
    /// [`Subscription`] does not unsubscribe; call
    /// [`Subscription::unsubscribe`] explicitly.
    pub fn subscribe<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners
                .entry(event.to_string())
                .or_default()
                .push((id, Arc::new(callback)));
        }

        let weak: Weak<Mutex<ListenerMap<A>>> = Arc::downgrade(&self.listeners);
        let event = event.to_string();
        Subscription {
            id,
            remove: Some(Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    remove_listener(&listeners, &event, id);
                }
            })),
        }
    }

    /// Remove one registration.
    pub fn unsubscribe(&self, event: &str, id: ListenerId) {
        remove_listener(&self.listeners, event, id);
    }

    /// Invoke every listener currently registered for `event`.
    pub fn publish(&self, event: &str, args: &A) {
        let snapshot: Vec<Listener<A>> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            match listeners.get(event) {
                Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return,
            }
        };

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(args))).is_err() {
                error!(event = %event, "Listener panicked");
            }
        }
    }

    /// Remove the listeners of one event, or of all events.
    pub fn clear(&self, event: Option<&str>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        match event {
            Some(event) => {
                listeners.remove(event);
            }
            None => listeners.clear(),
        }
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.get(event).map_or(0, Vec::len)
    }
}

impl<A: 'static> Default for EventHub<A> {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_listener<A>(listeners: &Mutex<ListenerMap<A>>, event: &str, id: ListenerId) {
    let mut listeners = listeners.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(list) = listeners.get_mut(event) {
        list.retain(|(lid, _)| *lid != id);
        if list.is_empty() {
            listeners.remove(event);
        }
    }
}

/// Handle to one registration.
pub struct Subscription {
    id: ListenerId,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// The registration id.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. A no-op if the hub is gone.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
