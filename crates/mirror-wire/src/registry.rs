//! Peer registry — the live set of peer sessions.
//!
//! The [`PeerRegistry`] owns every [`PeerSession`] of the process, in
//! connection order, and republishes their lifecycle as [`PEER_CONNECT`] and
//! [`PEER_CLOSE`] events. It is cheap to clone; clones share state.
//!
//! Peers are deduplicated by peer id: when the transport already carries one
//! at [`PeerRegistry::add`], and again when an accepted peer announces its
//! node id during authentication.

use crate::events::{EventHub, Subscription};
use crate::session::{CredentialValidator, DenyAll, PeerSession, AUTH_EVENT, CLOSE_EVENT};
use crate::transport::Transport;

use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Published with the new session after it is stored.
pub const PEER_CONNECT: &str = "connect";
/// Published with the session after it is removed.
pub const PEER_CLOSE: &str = "close";

struct RegistryInner {
    sessions: RwLock<Vec<Arc<PeerSession>>>,
    events: EventHub<Arc<PeerSession>>,
    validator: Arc<dyn CredentialValidator>,
}

/// Thread-safe collection of connected peers.
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<RegistryInner>,
}

impl PeerRegistry {
    /// A registry that rejects every credential. Peers must be added with
    /// the authenticated hint to be usable.
    pub fn new() -> Self {
        Self::with_validator(Arc::new(DenyAll))
    }

    /// A registry whose sessions check credentials with `validator`.
    pub fn with_validator(validator: Arc<dyn CredentialValidator>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(Vec::new()),
                events: EventHub::new(),
                validator,
            }),
        }
    }

    /// Wrap `transport` in a session, store it and start it.
    ///
    /// A transport whose peer id is already registered returns the
    /// existing session; the duplicate transport is dropped.
    pub fn add(&self, transport: Transport, authenticated: bool) -> Arc<PeerSession> {
        if let Some(existing) = transport.peer_id().and_then(|id| self.get(id)) {
            debug!(peer = %existing.peer_id(), "Peer already registered");
            return existing;
        }

        let session = PeerSession::new(transport, authenticated, Arc::clone(&self.inner.validator));
        self.inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&session));

        let registry = Arc::downgrade(&self.inner);
        let peer = Arc::downgrade(&session);
        session.on(AUTH_EVENT, move |_| {
            let (Some(inner), Some(session)) = (registry.upgrade(), peer.upgrade()) else {
                return;
            };
            if inner.has_duplicate(&session) {
                warn!(peer = %session.peer_id(), "Peer id already connected, closing duplicate");
                session.close();
            }
        });

        let registry = Arc::downgrade(&self.inner);
        let peer = Arc::downgrade(&session);
        session.on(CLOSE_EVENT, move |_| {
            let (Some(inner), Some(session)) = (registry.upgrade(), peer.upgrade()) else {
                return;
            };
            inner
                .sessions
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|s| !Arc::ptr_eq(s, &session));
            info!(peer = %session.peer_id(), "Peer disconnected");
            inner.events.publish(PEER_CLOSE, &session);
        });

        info!(peer = %session.peer_id(), authenticated, "Peer connected");
        self.inner.events.publish(PEER_CONNECT, &session);
        session.start();
        session
    }

    /// Listen for [`PEER_CONNECT`] or [`PEER_CLOSE`].
    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Arc<PeerSession>) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(event, callback)
    }

    /// Look up a session by peer id.
    pub fn get(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        let sessions = self.inner.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.iter().find(|s| s.peer_id() == peer_id).cloned()
    }

    /// Snapshot of all sessions, oldest first.
    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of registered sessions.
    pub fn connected_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Number of sessions that have authenticated.
    pub fn authenticated_count(&self) -> usize {
        let sessions = self.inner.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.iter().filter(|s| s.is_authenticated()).count()
    }

    /// Close every session.
    pub fn shutdown(&self) {
        for session in self.sessions() {
            session.close();
        }
    }
}

impl RegistryInner {
    /// Whether another open session already uses `session`'s peer id.
    fn has_duplicate(&self, session: &Arc<PeerSession>) -> bool {
        let peer_id = session.peer_id();
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .iter()
            .any(|s| !Arc::ptr_eq(s, session) && !s.is_closed() && s.peer_id() == peer_id)
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("sessions", &self.connected_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SharedSecret;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_add_publishes_connect() {
        let registry = PeerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        registry.on(PEER_CONNECT, move |session| {
            s.lock().unwrap().push(session.peer_id().to_string());
        });

        let (local, _remote) = Transport::memory_pair();
        let session = registry.add(local.with_peer_id("peer-1"), true);
        assert_eq!(session.peer_id(), "peer-1");
        assert_eq!(*seen.lock().unwrap(), vec!["peer-1".to_string()]);
        assert_eq!(registry.connected_count(), 1);
        assert_eq!(registry.authenticated_count(), 1);
    }

    #[tokio::test]
    async fn test_add_deduplicates_by_peer_id() {
        let registry = PeerRegistry::new();
        let (a, _ra) = Transport::memory_pair();
        let (b, _rb) = Transport::memory_pair();
        let first = registry.add(a.with_peer_id("same"), true);
        let second = registry.add(b.with_peer_id("same"), true);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_announced_node_id_is_deduplicated() {
        let registry = PeerRegistry::with_validator(Arc::new(SharedSecret::new("pw")));
        let mut clients = Vec::new();
        for _ in 0..2 {
            let (local, remote) = Transport::memory_pair();
            registry.add(local, false);
            let client = PeerSession::new(remote, true, Arc::new(DenyAll));
            client.start();
            clients.push(client);
        }

        clients[0]
            .authenticate("pw", Some("laptop"), Duration::from_secs(5))
            .await
            .unwrap();
        let second = clients[1]
            .authenticate("pw", Some("laptop"), Duration::from_secs(5))
            .await;
        assert!(second.is_err());

        for _ in 0..50 {
            if registry.connected_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.connected_count(), 1);
        let kept = registry.get("laptop").unwrap();
        assert!(kept.is_authenticated() && !kept.is_closed());
    }

    #[tokio::test]
    async fn test_sessions_in_connect_order() {
        let registry = PeerRegistry::new();
        let mut remotes = Vec::new();
        for name in ["first", "second", "third"] {
            let (local, remote) = Transport::memory_pair();
            registry.add(local.with_peer_id(name), true);
            remotes.push(remote);
        }
        let ids: Vec<String> = registry
            .sessions()
            .iter()
            .map(|s| s.peer_id().to_string())
            .collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_remote_close_removes_session() {
        let registry = PeerRegistry::with_validator(Arc::new(SharedSecret::new("pw")));
        let closes = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&closes);
        registry.on(PEER_CLOSE, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let (local, remote) = Transport::memory_pair();
        let session = registry.add(local, false);
        assert_eq!(registry.authenticated_count(), 0);
        drop(remote);

        for _ in 0..50 {
            if registry.connected_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.connected_count(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(session.is_closed());
        assert!(registry.get(&session.peer_id()).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_all() {
        let registry = PeerRegistry::new();
        let (a, _ra) = Transport::memory_pair();
        let (b, _rb) = Transport::memory_pair();
        let a = registry.add(a, true);
        let b = registry.add(b, true);
        registry.shutdown();

        for _ in 0..50 {
            if registry.connected_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(registry.connected_count(), 0);
    }
}
