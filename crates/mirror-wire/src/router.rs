//! Object router — location-transparent shared objects.
//!
//! The [`ObjectRouter`] keeps one canonical instance per [`ObjectKey`] and
//! hands out an [`ObjectHandle`] per checkout. Each registered type declares
//! which methods run on which [`Side`]; calls to methods this side does not
//! run are dispatched to a connected peer under the method's
//! [`CallProfile`]:
//!
//! - **best match**: one peer executes, the caller awaits its reply (or the
//!   reply timeout);
//! - **broadcast**: one peer executes, nobody waits;
//! - **sync**: like broadcast, and the method also runs locally, whose
//!   result is returned.
//!
//! Target selection prefers a peer that already holds the key and otherwise
//! takes the oldest authenticated connection.
//!
//! Instances are reference counted by their live handles. When the last
//! handle is released the instance's teardown hook runs, the entry is
//! evicted, and every peer that was asked to host the key receives a `free`.
//!
//! Executes and frees from one peer run one at a time, in arrival order, on
//! a worker task per session. Replies and events are handled inline.

use crate::message::{Envelope, EventPayload, ExecuteRequest, FreeNotice, ReplyPayload};
use crate::object::{EventMirror, ObjectEvents, ObjectHandle, SharedObject};
use crate::registry::{PeerRegistry, PEER_CLOSE, PEER_CONNECT};
use crate::session::{PeerSession, SessionSignal, MESSAGE_EVENT};
use crate::{RouterError, RouterResult, WireError};

use dashmap::DashMap;
use mirror_types::config::DEFAULT_REPLY_TIMEOUT_SECS;
use mirror_types::error::MirrorError;
use mirror_types::object::{CallProfile, ObjectKey, Override, OverrideTarget, Side};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Builds a fresh canonical instance for an id.
pub type Constructor = Arc<dyn Fn(&str, ObjectEvents) -> Arc<dyn SharedObject> + Send + Sync>;

/// Router tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long a best-match call waits for its reply.
    pub reply_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(DEFAULT_REPLY_TIMEOUT_SECS),
        }
    }
}

/// A registered type, with its routing table resolved for this side.
struct ObjectDefinition {
    constructor: Constructor,
    /// Methods this side forwards, with their profile.
    routes: Arc<HashMap<String, CallProfile>>,
    /// Sync event declarations.
    mirrored_events: Arc<Vec<Override>>,
}

/// A canonical instance and its live checkouts.
struct ObjectEntry {
    object: Arc<dyn SharedObject>,
    events: ObjectEvents,
    trackers: HashSet<u64>,
}

type PendingReply = oneshot::Sender<Result<Value, String>>;

/// Work a peer asked of us.
enum PeerTask {
    Call {
        handle: Arc<ObjectHandle>,
        method: String,
        params: Vec<Value>,
        call_id: Option<u64>,
    },
    Release(Arc<ObjectHandle>),
}

type PeerTasks = mpsc::UnboundedSender<PeerTask>;

pub(crate) struct RouterInner {
    side: Side,
    registry: PeerRegistry,
    config: RouterConfig,
    definitions: RwLock<HashMap<String, Arc<ObjectDefinition>>>,
    entries: Mutex<HashMap<ObjectKey, ObjectEntry>>,
    pending: DashMap<u64, PendingReply>,
    next_call_id: AtomicU64,
    next_handle_id: AtomicU64,
}

/// Registry of shared object types and their canonical instances.
#[derive(Clone)]
pub struct ObjectRouter {
    inner: Arc<RouterInner>,
}

impl ObjectRouter {
    /// Create a router playing `side` and attach it to `registry`'s
    /// sessions, present and future.
    pub fn new(side: Side, registry: PeerRegistry, config: RouterConfig) -> Self {
        let inner = Arc::new(RouterInner {
            side,
            registry: registry.clone(),
            config,
            definitions: RwLock::new(HashMap::new()),
            entries: Mutex::new(HashMap::new()),
            pending: DashMap::new(),
            next_call_id: AtomicU64::new(1),
            next_handle_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        registry.on(PEER_CONNECT, move |session| {
            if let Some(inner) = weak.upgrade() {
                inner.attach(session);
            }
        });
        let weak = Arc::downgrade(&inner);
        registry.on(PEER_CLOSE, move |session| {
            if let Some(inner) = weak.upgrade() {
                inner.detach(session);
            }
        });
        for session in registry.sessions() {
            inner.attach(&session);
        }

        info!(side = %inner.side, "Object router ready");
        Self { inner }
    }

    /// The side this process plays.
    pub fn side(&self) -> &Side {
        &self.inner.side
    }

    /// The registry whose sessions this router serves.
    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    /// Declare how to build `object_type` and how its methods and events
    /// are routed. Registering a type again replaces its definition for
    /// instances created afterwards.
    pub fn register<F>(&self, object_type: &str, constructor: F, overrides: Vec<Override>)
    where
        F: Fn(&str, ObjectEvents) -> Arc<dyn SharedObject> + Send + Sync + 'static,
    {
        let mut routes = HashMap::new();
        let mut mirrored_events = Vec::new();
        for o in overrides {
            match &o.target {
                OverrideTarget::Method(method) => {
                    if !o.runs_on(&self.inner.side) {
                        routes.insert(method.clone(), o.profile);
                    }
                }
                OverrideTarget::Event(_) => {
                    if o.profile == CallProfile::Sync {
                        mirrored_events.push(o);
                    }
                }
            }
        }

        debug!(
            object_type,
            routed = routes.len(),
            mirrored = mirrored_events.len(),
            "Registered object type"
        );
        let definition = ObjectDefinition {
            constructor: Arc::new(constructor),
            routes: Arc::new(routes),
            mirrored_events: Arc::new(mirrored_events),
        };
        self.inner
            .definitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(object_type.to_string(), Arc::new(definition));
    }

    /// Check out `object_type:id`, creating the canonical instance on first
    /// use.
    pub fn get_or_create(&self, object_type: &str, id: &str) -> RouterResult<Arc<ObjectHandle>> {
        self.inner.get_or_create(object_type, id, None)
    }

    /// Keys with a live canonical instance, sorted.
    pub fn live_objects(&self) -> Vec<ObjectKey> {
        let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<ObjectKey> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of live checkouts of `key`.
    pub fn tracker_count(&self, key: &ObjectKey) -> usize {
        let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).map_or(0, |entry| entry.trackers.len())
    }

    /// Number of best-match calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }
}

impl RouterInner {
    fn definition(&self, object_type: &str) -> Option<Arc<ObjectDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(object_type)
            .cloned()
    }

    /// Route a session's inbound messages into this router.
    fn attach(self: &Arc<Self>, session: &Arc<PeerSession>) {
        let (tasks, queue) = mpsc::unbounded_channel();
        tokio::spawn(run_peer_tasks(Arc::downgrade(session), queue));

        let router = Arc::downgrade(self);
        let peer: Weak<PeerSession> = Arc::downgrade(session);
        session.on(MESSAGE_EVENT, move |signal| {
            let (Some(router), Some(peer)) = (router.upgrade(), peer.upgrade()) else {
                return;
            };
            if let SessionSignal::Message(msg) = signal {
                router.handle_message(&peer, msg.clone(), &tasks);
            }
        });
        debug!(peer = %session.peer_id(), "Router attached to session");
    }

    /// Release everything the closed session held through us.
    fn detach(&self, session: &Arc<PeerSession>) {
        let handles = session.take_all_objects();
        debug!(
            peer = %session.peer_id(),
            released = handles.len(),
            "Releasing checkouts of closed session"
        );
        for handle in handles {
            handle.release();
        }
        session.clear_remote_keys();
    }

    pub(crate) fn get_or_create(
        self: &Arc<Self>,
        object_type: &str,
        id: &str,
        origin: Option<&Arc<PeerSession>>,
    ) -> RouterResult<Arc<ObjectHandle>> {
        let key = ObjectKey::new(object_type, id);

        if let Some(origin) = origin {
            if let Some(handle) = origin.cached_object(&key) {
                return Ok(handle);
            }
        }

        let definition = self
            .definition(object_type)
            .ok_or_else(|| MirrorError::UnknownObjectType(object_type.to_string()))?;

        let handle_id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let (object, events) = self.track(&key, handle_id, &definition);

        let handle = Arc::new(ObjectHandle {
            handle_id,
            key: key.clone(),
            object,
            events,
            routes: Arc::clone(&definition.routes),
            router: Arc::downgrade(self),
            subscriptions: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        });

        if let Some(origin) = origin {
            origin.cache_object(key, Arc::clone(&handle));
        }
        Ok(handle)
    }

    /// Add a tracker to `key`'s entry, constructing the instance if needed.
    fn track(
        self: &Arc<Self>,
        key: &ObjectKey,
        handle_id: u64,
        definition: &ObjectDefinition,
    ) -> (Arc<dyn SharedObject>, ObjectEvents) {
        if let Some(found) = self.track_existing(key, handle_id) {
            return found;
        }

        // Constructors may check out other objects, so run them unlocked.
        let events = ObjectEvents::new();
        let object = (definition.constructor)(&key.id, events.clone());

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(key) {
            // Lost a race with a concurrent checkout.
            entry.trackers.insert(handle_id);
            let found = (Arc::clone(&entry.object), entry.events.clone());
            drop(entries);
            object.destroy();
            return found;
        }

        if !definition.mirrored_events.is_empty() {
            events.install_mirror(|| self.event_mirror(key, &definition.mirrored_events));
        }
        info!(key = %key, "Created canonical instance");
        entries.insert(
            key.clone(),
            ObjectEntry {
                object: Arc::clone(&object),
                events: events.clone(),
                trackers: HashSet::from([handle_id]),
            },
        );
        (object, events)
    }

    fn track_existing(
        &self,
        key: &ObjectKey,
        handle_id: u64,
    ) -> Option<(Arc<dyn SharedObject>, ObjectEvents)> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get_mut(key).map(|entry| {
            entry.trackers.insert(handle_id);
            (Arc::clone(&entry.object), entry.events.clone())
        })
    }

    fn event_mirror(self: &Arc<Self>, key: &ObjectKey, declared: &Arc<Vec<Override>>) -> EventMirror {
        let router = Arc::downgrade(self);
        let key = key.clone();
        let declared = Arc::clone(declared);
        Arc::new(move |event: &str, args: &[Value]| {
            if !declared.iter().any(|o| o.mirrors_event(event)) {
                return;
            }
            if let Some(router) = router.upgrade() {
                router.forward_event(&key, event, args);
            }
        })
    }

    /// Send an event to every authenticated peer holding `key`.
    fn forward_event(&self, key: &ObjectKey, event: &str, args: &[Value]) {
        let msg = Envelope::Event(EventPayload {
            object_type: key.object_type.clone(),
            id: key.id.clone(),
            event: event.to_string(),
            args: args.to_vec(),
        });
        for session in self.registry.sessions() {
            if !session.is_authenticated() || !session.holds(key) {
                continue;
            }
            if let Err(e) = session.send(&msg) {
                debug!(peer = %session.peer_id(), key = %key, "event not forwarded: {}", e);
            }
        }
    }

    pub(crate) fn release_tracker(&self, key: &ObjectKey, handle_id: u64) {
        let evicted = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let now_empty = match entries.get_mut(key) {
                Some(entry) => {
                    entry.trackers.remove(&handle_id);
                    entry.trackers.is_empty()
                }
                None => false,
            };
            if now_empty {
                entries.remove(key)
            } else {
                None
            }
        };

        let Some(entry) = evicted else {
            return;
        };
        info!(key = %key, "Destroying canonical instance");
        entry.object.destroy();

        let notice = Envelope::Free(FreeNotice::for_key(key));
        for session in self.registry.sessions() {
            if !session.remove_remote_key(key) {
                continue;
            }
            if let Err(e) = session.send(&notice) {
                debug!(peer = %session.peer_id(), key = %key, "free not sent: {}", e);
            }
        }
    }

    /// Pick the peer that executes a routed call.
    fn resolve_target(&self, key: &ObjectKey) -> Option<Arc<PeerSession>> {
        let live: Vec<Arc<PeerSession>> = self
            .registry
            .sessions()
            .into_iter()
            .filter(|s| s.is_authenticated() && !s.is_closed())
            .collect();

        if let Some(session) = live.iter().find(|s| s.holds(key)) {
            return Some(Arc::clone(session));
        }
        let oldest = live.into_iter().next()?;
        oldest.add_remote_key(key);
        Some(oldest)
    }

    pub(crate) async fn dispatch(
        &self,
        handle: &ObjectHandle,
        method: &str,
        params: Vec<Value>,
        profile: CallProfile,
    ) -> RouterResult<Value> {
        let key = &handle.key;
        let target = self.resolve_target(key);

        match profile {
            CallProfile::BestMatch => {
                let session = target.ok_or(MirrorError::NoConnectionAvailable)?;
                self.call_remote(&session, key, method, params).await
            }
            CallProfile::Broadcast => {
                if let Some(session) = target {
                    self.fire(&session, key, method, params);
                }
                Ok(Value::Null)
            }
            CallProfile::Sync => {
                if let Some(session) = target {
                    self.fire(&session, key, method, params.clone());
                }
                Ok(handle.object.call(method, params).await?)
            }
        }
    }

    fn fire(&self, session: &PeerSession, key: &ObjectKey, method: &str, params: Vec<Value>) {
        let msg = Envelope::Execute(ExecuteRequest {
            object_type: key.object_type.clone(),
            id: key.id.clone(),
            method: method.to_string(),
            parameters: params,
            call_id: None,
        });
        if let Err(e) = session.send(&msg) {
            debug!(peer = %session.peer_id(), key = %key, method, "execute not sent: {}", e);
        }
    }

    async fn call_remote(
        &self,
        session: &PeerSession,
        key: &ObjectKey,
        method: &str,
        params: Vec<Value>,
    ) -> RouterResult<Value> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);

        debug!(peer = %session.peer_id(), key = %key, method, call_id, "Dispatching call");
        let msg = Envelope::Execute(ExecuteRequest {
            object_type: key.object_type.clone(),
            id: key.id.clone(),
            method: method.to_string(),
            parameters: params,
            call_id: Some(call_id),
        });
        if let Err(e) = session.send(&msg) {
            self.pending.remove(&call_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.config.reply_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(MirrorError::RemoteMethod(message).into()),
            Ok(Err(_)) => Err(RouterError::ShutDown),
            Err(_) => {
                self.pending.remove(&call_id);
                warn!(key = %key, method, call_id, "Timed out waiting for reply");
                Err(MirrorError::ReplyTimeout { call_id }.into())
            }
        }
    }

    fn handle_message(
        self: &Arc<Self>,
        session: &Arc<PeerSession>,
        msg: Envelope,
        tasks: &PeerTasks,
    ) {
        match msg {
            Envelope::Execute(req) => self.handle_execute(session, req, tasks),
            Envelope::Reply(reply) => self.handle_reply(reply),
            Envelope::Event(event) => self.handle_event(event),
            Envelope::Free(notice) => self.handle_free(session, notice, tasks),
            other => debug!(
                peer = %session.peer_id(),
                kind = other.kind(),
                "Ignoring session-level message"
            ),
        }
    }

    fn handle_execute(
        self: &Arc<Self>,
        session: &Arc<PeerSession>,
        req: ExecuteRequest,
        tasks: &PeerTasks,
    ) {
        let handle = match self.get_or_create(&req.object_type, &req.id, Some(session)) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(peer = %session.peer_id(), key = %req.key(), "Cannot execute: {}", e);
                if let Some(call_id) = req.call_id {
                    let _ = session.send(&Envelope::Reply(ReplyPayload::err(call_id, e.to_string())));
                }
                return;
            }
        };

        let ExecuteRequest {
            method,
            parameters,
            call_id,
            ..
        } = req;
        let task = PeerTask::Call {
            handle,
            method,
            params: parameters,
            call_id,
        };
        if tasks.send(task).is_err() {
            debug!(peer = %session.peer_id(), "execute dropped: session worker stopped");
        }
    }

    fn handle_reply(&self, reply: ReplyPayload) {
        match self.pending.remove(&reply.call_id) {
            Some((_, tx)) => {
                let _ = tx.send(reply.into_result());
            }
            None => warn!(
                call_id = reply.call_id,
                "No pending reply found (timed out or duplicate)"
            ),
        }
    }

    fn handle_event(&self, event: EventPayload) {
        let key = event.key();
        let events = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .map(|entry| entry.events.clone());
        match events {
            Some(events) => events.emit_local(&event.event, &event.args),
            None => debug!(key = %key, event = %event.event, "Event for unknown object dropped"),
        }
    }

    fn handle_free(&self, session: &PeerSession, notice: FreeNotice, tasks: &PeerTasks) {
        let key = notice.key();
        let Some(handle) = session.take_object(&key) else {
            debug!(peer = %session.peer_id(), key = %key, "Free for unknown checkout");
            return;
        };
        debug!(peer = %session.peer_id(), key = %key, "Peer released checkout");
        // Executes queued before the free still run on this checkout.
        if let Err(unsent) = tasks.send(PeerTask::Release(handle)) {
            if let PeerTask::Release(handle) = unsent.0 {
                handle.release();
            }
        }
    }
}

/// Drain one peer's queue. Ends when the session is gone.
async fn run_peer_tasks(
    session: Weak<PeerSession>,
    mut queue: mpsc::UnboundedReceiver<PeerTask>,
) {
    while let Some(task) = queue.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        match task {
            PeerTask::Release(handle) => handle.release(),
            PeerTask::Call {
                handle,
                method,
                params,
                call_id,
            } => run_call(&session, &handle, &method, params, call_id).await,
        }
    }
}

async fn run_call(
    session: &PeerSession,
    handle: &ObjectHandle,
    method: &str,
    params: Vec<Value>,
    call_id: Option<u64>,
) {
    let outcome = if handle.is_released() {
        Err(RouterError::Released(handle.key.to_string()))
    } else {
        // The peer routed this call here, so run the implementation itself.
        handle
            .object
            .call(method, params)
            .await
            .map_err(RouterError::from)
    };

    let Some(call_id) = call_id else {
        if let Err(e) = outcome {
            debug!(key = %handle.key, method = %method, "fire-and-forget call failed: {}", e);
        }
        return;
    };
    let reply = match outcome {
        Ok(value) => ReplyPayload::ok(call_id, value),
        Err(e) => ReplyPayload::err(call_id, e.to_string()),
    };
    match session.send(&Envelope::Reply(reply)) {
        Ok(()) => {}
        Err(too_large @ WireError::MessageTooLarge { .. }) => {
            warn!(
                peer = %session.peer_id(),
                key = %handle.key,
                method = %method,
                call_id,
                "Reply not sendable: {}",
                too_large
            );
            let fallback = Envelope::Reply(ReplyPayload::err(call_id, too_large.to_string()));
            if let Err(e) = session.send(&fallback) {
                debug!(peer = %session.peer_id(), call_id, "error reply not sent: {}", e);
            }
        }
        Err(e) => debug!(peer = %session.peer_id(), call_id, "reply not sent: {}", e),
    }
}
