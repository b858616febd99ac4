//! Peer session — one authenticated duplex connection.
//!
//! A [`PeerSession`] wraps a [`Transport`]. Until the peer submits a valid
//! credential every inbound message except `auth` is dropped. Afterwards each
//! envelope is re-published on the session's event hub under
//! [`MESSAGE_EVENT`] for the router, and the end of the connection is
//! published once under [`CLOSE_EVENT`].
//!
//! A credential submission may carry the submitter's node id; the session
//! adopts it as its peer id before announcing [`AUTH_EVENT`].

use crate::events::{EventHub, Subscription};
use crate::message::{decode_message, encode_body, AuthSubmit, Envelope, MAX_MESSAGE_SIZE};
use crate::object::ObjectHandle;
use crate::transport::{FrameSource, Transport};
use crate::WireError;

use mirror_types::error::{MirrorError, MirrorResult};
use mirror_types::object::ObjectKey;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

/// Event carrying each inbound envelope of an authenticated session.
pub const MESSAGE_EVENT: &str = "message";
/// Event published once when the session ends.
pub const CLOSE_EVENT: &str = "close";
/// Event published when a peer's credential is accepted, before the verdict
/// is sent. A listener may still close the session at this point.
pub const AUTH_EVENT: &str = "authenticated";

/// Payload published on a session's event hub.
#[derive(Debug, Clone)]
pub enum SessionSignal {
    /// An inbound envelope.
    Message(Envelope),
    /// The peer submitted a valid credential.
    Authenticated,
    /// The connection ended.
    Closed,
}

/// Checks a submitted credential.
pub trait CredentialValidator: Send + Sync + 'static {
    /// Whether `candidate` grants access.
    fn validate(&self, candidate: &str) -> bool;
}

impl<F> CredentialValidator for F
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    fn validate(&self, candidate: &str) -> bool {
        self(candidate)
    }
}

/// Accepts exactly one pre-shared password.
pub struct SharedSecret(String);

impl SharedSecret {
    /// Accept `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }
}

impl CredentialValidator for SharedSecret {
    fn validate(&self, candidate: &str) -> bool {
        !self.0.is_empty() && bool::from(self.0.as_bytes().ct_eq(candidate.as_bytes()))
    }
}

/// Rejects every credential.
pub struct DenyAll;

impl CredentialValidator for DenyAll {
    fn validate(&self, _candidate: &str) -> bool {
        false
    }
}

/// One connected peer.
pub struct PeerSession {
    peer_id: RwLock<String>,
    authenticated: AtomicBool,
    validator: Arc<dyn CredentialValidator>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: Mutex<Option<Box<dyn FrameSource>>>,
    events: EventHub<SessionSignal>,
    /// Handles granted to this peer: objects it asked us to execute on.
    objects: Mutex<HashMap<ObjectKey, Arc<ObjectHandle>>>,
    /// Keys we asked this peer to host; each owes a `free` on release.
    remote_keys: Mutex<HashSet<ObjectKey>>,
    auth_waiter: Mutex<Option<oneshot::Sender<bool>>>,
    shutdown: Notify,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl PeerSession {
    /// Wrap `transport`. The inbound loop does not run until [`start`].
    ///
    /// [`start`]: PeerSession::start
    pub fn new(
        transport: Transport,
        authenticated: bool,
        validator: Arc<dyn CredentialValidator>,
    ) -> Arc<Self> {
        let Transport {
            peer_id,
            outbound,
            inbound,
        } = transport;
        let peer_id = peer_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Arc::new(Self {
            peer_id: RwLock::new(peer_id),
            authenticated: AtomicBool::new(authenticated),
            validator,
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            events: EventHub::new(),
            objects: Mutex::new(HashMap::new()),
            remote_keys: Mutex::new(HashSet::new()),
            auth_waiter: Mutex::new(None),
            shutdown: Notify::new(),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Stable identifier of the peer.
    pub fn peer_id(&self) -> String {
        self.peer_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether the peer has authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Whether the session has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Listen for [`MESSAGE_EVENT`], [`AUTH_EVENT`] or [`CLOSE_EVENT`].
    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&SessionSignal) + Send + Sync + 'static,
    {
        self.events.subscribe(event, callback)
    }

    /// Queue an envelope for the peer.
    ///
    /// A body the peer would refuse to read is rejected here, so the link
    /// stays usable.
    pub fn send(&self, msg: &Envelope) -> Result<(), WireError> {
        let body = encode_body(msg)?;
        if body.len() > MAX_MESSAGE_SIZE as usize {
            return Err(WireError::MessageTooLarge {
                size: u32::try_from(body.len()).unwrap_or(u32::MAX),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx.send(body).map_err(|_| WireError::ConnectionClosed),
            None => Err(WireError::ConnectionClosed),
        }
    }

    /// Spawn the inbound loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(inbound) = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };

        let greeting = if self.is_authenticated() {
            Envelope::AuthSuccess
        } else {
            Envelope::NeedAuth
        };
        if let Err(e) = self.send(&greeting) {
            debug!(peer = %self.peer_id(), "could not announce auth state: {}", e);
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.run(inbound).await;
        });
    }

    /// End the session. Idempotent.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.shutdown.notify_one();
        let never_started = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        if never_started {
            self.finish();
        }
    }

    /// Submit a credential to the peer and wait for its verdict.
    ///
    /// `node_id` identifies this process to the peer; a peer that already
    /// has a live session with the same node id rejects the duplicate.
    pub async fn authenticate(
        &self,
        credential: impl Into<String>,
        node_id: Option<&str>,
        timeout: Duration,
    ) -> Result<(), WireError> {
        let (tx, rx) = oneshot::channel();
        *self.auth_waiter.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        self.send(&Envelope::Auth(AuthSubmit {
            credential: credential.into(),
            node_id: node_id.map(str::to_string),
        }))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(true)) => {
                info!(peer = %self.peer_id(), "Authenticated with peer");
                Ok(())
            }
            Ok(Ok(false)) => Err(WireError::AuthFailed),
            Ok(Err(_)) => Err(WireError::ConnectionClosed),
            Err(_) => Err(WireError::HandshakeFailed(
                "timed out waiting for authentication verdict".to_string(),
            )),
        }
    }

    async fn run(self: Arc<Self>, mut inbound: Box<dyn FrameSource>) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                frame = inbound.next_frame() => match frame {
                    Some(Ok(body)) => self.handle_frame(&body),
                    Some(Err(e)) => {
                        debug!(peer = %self.peer_id(), "connection ended: {}", e);
                        break;
                    }
                    None => break,
                },
            }
        }
        self.finish();
    }

    fn finish(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.auth_waiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        info!(peer = %self.peer_id(), "Session closed");
        self.events.publish(CLOSE_EVENT, &SessionSignal::Closed);
    }

    pub(crate) fn handle_frame(&self, body: &[u8]) {
        let msg = match self.admit(body) {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e @ MirrorError::AuthRequired) => {
                debug!(peer = %self.peer_id(), error = %e, "Dropping message");
                return;
            }
            Err(e) => {
                warn!(peer = %self.peer_id(), error = %e, "Dropping message");
                return;
            }
        };

        match msg {
            Envelope::AuthSuccess => self.settle_auth(true),
            Envelope::AuthFailed => self.settle_auth(false),
            Envelope::NeedAuth => debug!(peer = %self.peer_id(), "Peer requires authentication"),
            Envelope::Auth(_) => {
                let _ = self.send(&Envelope::AuthSuccess);
            }
            other => self
                .events
                .publish(MESSAGE_EVENT, &SessionSignal::Message(other)),
        }
    }

    /// Parse a frame and apply the authentication gate.
    ///
    /// `Ok(None)` means the frame was consumed by the handshake.
    fn admit(&self, body: &[u8]) -> MirrorResult<Option<Envelope>> {
        let msg =
            decode_message(body).map_err(|e| MirrorError::MalformedMessage(e.to_string()))?;
        if self.is_authenticated() {
            return Ok(Some(msg));
        }
        match msg {
            Envelope::Auth(submit) => self.check_credential(submit).map(|()| None),
            _ => Err(MirrorError::AuthRequired),
        }
    }

    fn check_credential(&self, submit: AuthSubmit) -> MirrorResult<()> {
        if !self.validator.validate(&submit.credential) {
            self.send_verdict(Envelope::AuthFailed);
            return Err(MirrorError::AuthFailed);
        }
        if let Some(node_id) = submit.node_id {
            debug!(peer = %self.peer_id(), node_id = %node_id, "Adopting peer node id");
            *self.peer_id.write().unwrap_or_else(|e| e.into_inner()) = node_id;
        }

        self.events.publish(AUTH_EVENT, &SessionSignal::Authenticated);
        if self.closing.load(Ordering::Acquire) {
            self.send_verdict(Envelope::AuthFailed);
            return Err(MirrorError::AuthFailed);
        }
        self.authenticated.store(true, Ordering::Release);
        info!(peer = %self.peer_id(), "Peer authenticated");
        self.send_verdict(Envelope::AuthSuccess);
        Ok(())
    }

    fn send_verdict(&self, verdict: Envelope) {
        if let Err(e) = self.send(&verdict) {
            debug!(peer = %self.peer_id(), "could not send auth verdict: {}", e);
        }
    }

    fn settle_auth(&self, accepted: bool) {
        let waiter = self
            .auth_waiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match waiter {
            Some(tx) => {
                let _ = tx.send(accepted);
            }
            None => debug!(peer = %self.peer_id(), accepted, "Unsolicited auth verdict"),
        }
    }

    /// Whether this peer hosts `key` for us or we host it for this peer.
    pub fn holds(&self, key: &ObjectKey) -> bool {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
            || self
                .remote_keys
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(key)
    }

    pub(crate) fn cached_object(&self, key: &ObjectKey) -> Option<Arc<ObjectHandle>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub(crate) fn cache_object(&self, key: ObjectKey, handle: Arc<ObjectHandle>) {
        let previous = self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, handle);
        // Released outside the lock.
        if let Some(previous) = previous {
            previous.release();
        }
    }

    pub(crate) fn take_object(&self, key: &ObjectKey) -> Option<Arc<ObjectHandle>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    pub(crate) fn take_all_objects(&self) -> Vec<Arc<ObjectHandle>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect()
    }

    /// Number of handles held on behalf of this peer.
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn add_remote_key(&self, key: &ObjectKey) {
        self.remote_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone());
    }

    pub(crate) fn remove_remote_key(&self, key: &ObjectKey) -> bool {
        self.remote_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    pub(crate) fn clear_remote_keys(&self) {
        self.remote_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Whether we asked this peer to host `key`.
    pub fn has_remote_key(&self, key: &ObjectKey) -> bool {
        self.remote_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id())
            .field("authenticated", &self.is_authenticated())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FreeNotice, ReplyPayload};
    use std::sync::atomic::AtomicUsize;

    fn collect_messages(session: &PeerSession) -> Arc<Mutex<Vec<Envelope>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        session.on(MESSAGE_EVENT, move |signal| {
            if let SessionSignal::Message(msg) = signal {
                s.lock().unwrap().push(msg.clone());
            }
        });
        seen
    }

    fn body(msg: &Envelope) -> Vec<u8> {
        encode_body(msg).unwrap()
    }

    fn free(id: &str) -> Envelope {
        Envelope::Free(FreeNotice {
            object_type: "file".to_string(),
            id: id.to_string(),
        })
    }

    #[tokio::test]
    async fn test_messages_dropped_before_auth() {
        let (local, _remote) = Transport::memory_pair();
        let session = PeerSession::new(local, false, Arc::new(SharedSecret::new("pw")));
        let seen = collect_messages(&session);

        session.handle_frame(&body(&free("/a")));
        assert!(seen.lock().unwrap().is_empty());
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_auth_then_forward() {
        let (local, mut remote) = Transport::memory_pair();
        let session = PeerSession::new(local, false, Arc::new(SharedSecret::new("pw")));
        let seen = collect_messages(&session);

        session.handle_frame(&body(&Envelope::Auth(AuthSubmit {
            credential: "wrong".to_string(),
            node_id: None,
        })));
        assert!(!session.is_authenticated());
        let verdict = remote.inbound.next_frame().await.unwrap().unwrap();
        assert_eq!(decode_message(&verdict).unwrap(), Envelope::AuthFailed);

        session.handle_frame(&body(&Envelope::Auth(AuthSubmit {
            credential: "pw".to_string(),
            node_id: None,
        })));
        assert!(session.is_authenticated());
        let verdict = remote.inbound.next_frame().await.unwrap().unwrap();
        assert_eq!(decode_message(&verdict).unwrap(), Envelope::AuthSuccess);

        session.handle_frame(&body(&free("/a")));
        let reply = Envelope::Reply(ReplyPayload::ok(1, serde_json::json!(true)));
        session.handle_frame(&body(&reply));
        assert_eq!(*seen.lock().unwrap(), vec![free("/a"), reply]);
    }

    #[tokio::test]
    async fn test_malformed_message_is_contained() {
        let (local, _remote) = Transport::memory_pair();
        let session = PeerSession::new(local, true, Arc::new(DenyAll));
        let seen = collect_messages(&session);

        session.handle_frame(b"{ not json");
        session.handle_frame(&body(&free("/b")));
        assert_eq!(*seen.lock().unwrap(), vec![free("/b")]);
    }

    #[tokio::test]
    async fn test_close_event_fires_once() {
        let (local, remote) = Transport::memory_pair();
        let session = PeerSession::new(local, true, Arc::new(DenyAll));
        let closes = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&closes);
        session.on(CLOSE_EVENT, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        session.start();

        drop(remote);
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close();
        assert!(session.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            session.send(&Envelope::NeedAuth),
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_authenticate_round_trip() {
        let (client_side, server_side) = Transport::memory_pair();
        let server = PeerSession::new(server_side, false, Arc::new(SharedSecret::new("pw")));
        let client = PeerSession::new(client_side, true, Arc::new(DenyAll));
        server.start();
        client.start();

        let bad = client
            .authenticate("nope", None, Duration::from_secs(5))
            .await;
        assert!(matches!(bad, Err(WireError::AuthFailed)));
        client
            .authenticate("pw", Some("node-a"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(server.is_authenticated());
        assert_eq!(server.peer_id(), "node-a");
    }

    #[tokio::test]
    async fn test_admit_classifies_dropped_frames() {
        let (local, _remote) = Transport::memory_pair();
        let session = PeerSession::new(local, false, Arc::new(SharedSecret::new("pw")));

        assert!(matches!(
            session.admit(b"{ not json"),
            Err(MirrorError::MalformedMessage(_))
        ));
        assert!(matches!(
            session.admit(&body(&free("/a"))),
            Err(MirrorError::AuthRequired)
        ));
        let bad = Envelope::Auth(AuthSubmit {
            credential: "nope".to_string(),
            node_id: Some("intruder".to_string()),
        });
        assert!(matches!(
            session.admit(&body(&bad)),
            Err(MirrorError::AuthFailed)
        ));
        // A rejected submission does not rename the session.
        assert_ne!(session.peer_id(), "intruder");
    }

    #[tokio::test]
    async fn test_closed_during_auth_is_rejected() {
        let (local, mut remote) = Transport::memory_pair();
        let session = PeerSession::new(local, false, Arc::new(SharedSecret::new("pw")));
        let weak = Arc::downgrade(&session);
        session.on(AUTH_EVENT, move |_| {
            if let Some(session) = weak.upgrade() {
                session.close();
            }
        });
        session.start();
        let greeting = remote.inbound.next_frame().await.unwrap().unwrap();
        assert_eq!(decode_message(&greeting).unwrap(), Envelope::NeedAuth);

        session.handle_frame(&body(&Envelope::Auth(AuthSubmit {
            credential: "pw".to_string(),
            node_id: Some("twin".to_string()),
        })));
        assert!(!session.is_authenticated());
        let verdict = remote.inbound.next_frame().await.unwrap().unwrap();
        assert_eq!(decode_message(&verdict).unwrap(), Envelope::AuthFailed);
    }

    #[tokio::test]
    async fn test_oversized_send_rejected_and_link_kept() {
        let (local, mut remote) = Transport::memory_pair();
        let session = PeerSession::new(local, true, Arc::new(DenyAll));
        let huge = Envelope::Reply(ReplyPayload::ok(
            1,
            serde_json::json!("x".repeat(MAX_MESSAGE_SIZE as usize)),
        ));
        match session.send(&huge) {
            Err(WireError::MessageTooLarge { size, max }) => {
                assert!(size > max);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }

        session.send(&free("/after")).unwrap();
        let frame = remote.inbound.next_frame().await.unwrap().unwrap();
        assert_eq!(decode_message(&frame).unwrap(), free("/after"));
    }

    #[test]
    fn test_shared_secret() {
        let secret = SharedSecret::new("letmein");
        assert!(secret.validate("letmein"));
        assert!(!secret.validate("letmein2"));
        assert!(!SharedSecret::new("").validate(""));
        let closure = |c: &str| c.len() == 3;
        assert!(closure.validate("abc"));
    }
}
