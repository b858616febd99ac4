//! Shared objects and the per-checkout handles that front them.

use crate::events::{EventHub, ListenerId, Subscription};
use crate::router::RouterInner;
use crate::{RouterError, RouterResult};

use async_trait::async_trait;
use mirror_types::error::MirrorResult;
use mirror_types::object::{CallProfile, ObjectKey};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// The canonical implementation behind a key.
///
/// Methods are addressed by name with positional JSON arguments, the same
/// shape they travel in over the wire.
#[async_trait]
pub trait SharedObject: Send + Sync + 'static {
    /// Invoke `method` on this instance.
    async fn call(&self, method: &str, params: Vec<Value>) -> MirrorResult<Value>;

    /// Teardown hook, run once when the last checkout is released.
    fn destroy(&self) {}
}

/// Callback installed by the router to mirror emissions to peers.
pub(crate) type EventMirror = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

/// Event emitter owned by one canonical instance.
///
/// [`emit`](ObjectEvents::emit) notifies local listeners and, for event
/// types declared with the sync profile, every peer holding the object.
/// Events arriving from peers are delivered through the local path only.
#[derive(Clone)]
pub struct ObjectEvents {
    hub: Arc<EventHub<Vec<Value>>>,
    mirror: Arc<Mutex<Option<EventMirror>>>,
}

impl ObjectEvents {
    /// An emitter with no listeners and no mirroring.
    pub fn new() -> Self {
        Self {
            hub: Arc::new(EventHub::new()),
            mirror: Arc::new(Mutex::new(None)),
        }
    }

    /// Emit to local listeners and mirror to peers.
    pub fn emit(&self, event: &str, args: Vec<Value>) {
        self.hub.publish(event, &args);
        let mirror = self
            .mirror
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(mirror) = mirror {
            mirror(event, &args);
        }
    }

    /// Emit to local listeners only.
    pub fn emit_local(&self, event: &str, args: &Vec<Value>) {
        self.hub.publish(event, args);
    }

    /// Listen for `event`.
    pub fn subscribe<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Vec<Value>) + Send + Sync + 'static,
    {
        self.hub.subscribe(event, callback)
    }

    /// Install the mirror unless one is already present.
    pub(crate) fn install_mirror(&self, build: impl FnOnce() -> EventMirror) {
        let mut mirror = self.mirror.lock().unwrap_or_else(|e| e.into_inner());
        if mirror.is_none() {
            *mirror = Some(build());
        }
    }
}

impl Default for ObjectEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// One checkout of a shared object.
///
/// Methods without a remote route call straight into the canonical
/// instance; routed methods are dispatched by the router. Releasing the
/// last handle of a key destroys the instance. Dropping a handle releases
/// it. Listeners registered through [`on`](ObjectHandle::on) end with the
/// checkout.
pub struct ObjectHandle {
    pub(crate) handle_id: u64,
    pub(crate) key: ObjectKey,
    pub(crate) object: Arc<dyn SharedObject>,
    pub(crate) events: ObjectEvents,
    pub(crate) routes: Arc<HashMap<String, CallProfile>>,
    pub(crate) router: Weak<RouterInner>,
    pub(crate) subscriptions: Mutex<Vec<Subscription>>,
    pub(crate) released: AtomicBool,
}

impl ObjectHandle {
    /// The object's key.
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Call `method`, routing it to a peer if this side does not run it.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> RouterResult<Value> {
        if self.is_released() {
            return Err(RouterError::Released(self.key.to_string()));
        }
        match self.routes.get(method) {
            None => Ok(self.object.call(method, params).await?),
            Some(profile) => {
                let router = self.router.upgrade().ok_or(RouterError::ShutDown)?;
                router.dispatch(self, method, params, *profile).await
            }
        }
    }

    /// The routing profile of `method`, if it is forwarded from this side.
    pub fn route(&self, method: &str) -> Option<CallProfile> {
        self.routes.get(method).copied()
    }

    /// Listen for events emitted by the canonical instance until this
    /// checkout is released.
    pub fn on<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&Vec<Value>) + Send + Sync + 'static,
    {
        let subscription = self.events.subscribe(event, callback);
        let id = subscription.id();
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        // Checked under the lock so a concurrent release cannot miss it.
        if self.is_released() {
            drop(subscriptions);
            subscription.unsubscribe();
        } else {
            subscriptions.push(subscription);
        }
        id
    }

    /// Remove a listener registered with [`on`](ObjectHandle::on).
    pub fn off(&self, id: ListenerId) {
        let removed = {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subscriptions
                .iter()
                .position(|s| s.id() == id)
                .map(|i| subscriptions.swap_remove(i))
        };
        if let Some(subscription) = removed {
            subscription.unsubscribe();
        }
    }

    /// Emit an event through the instance's emitter.
    pub fn emit(&self, event: &str, args: Vec<Value>) {
        self.events.emit(event, args);
    }

    /// Whether [`release`](ObjectHandle::release) has run.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// End this checkout. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscriptions =
            std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()));
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        if let Some(router) = self.router.upgrade() {
            router.release_tracker(&self.key, self.handle_id);
        }
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("key", &self.key)
            .field("handle_id", &self.handle_id)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_local_skips_mirror() {
        let events = ObjectEvents::new();
        let local = Arc::new(AtomicUsize::new(0));
        let mirrored = Arc::new(AtomicUsize::new(0));

        let l = Arc::clone(&local);
        events.subscribe("change", move |_| {
            l.fetch_add(1, Ordering::SeqCst);
        });
        let m = Arc::clone(&mirrored);
        events.install_mirror(move || {
            Arc::new(move |_event: &str, _args: &[Value]| {
                m.fetch_add(1, Ordering::SeqCst);
            })
        });

        events.emit("change", vec![]);
        events.emit_local("change", &vec![]);
        assert_eq!(local.load(Ordering::SeqCst), 2);
        assert_eq!(mirrored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mirror_installed_once() {
        let events = ObjectEvents::new();
        let builds = AtomicUsize::new(0);
        for _ in 0..3 {
            events.install_mirror(|| {
                builds.fetch_add(1, Ordering::SeqCst);
                Arc::new(|_: &str, _: &[Value]| {})
            });
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }
}
