//! PeerNode — TCP listener and dialer feeding the peer registry.
//!
//! Accepted connections are registered unauthenticated; the remote side must
//! submit a credential before anything else is processed, and is known by the
//! node id it submits with it. Outbound connections trust the listener and
//! authenticate against it before [`connect`] returns.

use crate::registry::PeerRegistry;
use crate::session::PeerSession;
use crate::transport::Transport;
use crate::WireError;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A bound listener registering every accepted peer.
pub struct PeerNode {
    registry: PeerRegistry,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
}

impl PeerNode {
    /// Bind `addr` and start accepting in a spawned task.
    pub async fn listen(
        addr: SocketAddr,
        registry: PeerRegistry,
    ) -> Result<(Arc<Self>, JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Listening for peers");

        let node = Arc::new(Self {
            registry: registry.clone(),
            local_addr,
        });
        let accept_handle = tokio::spawn(accept_loop(listener, registry));
        Ok((node, accept_handle))
    }

    /// The actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The registry accepted peers are added to.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }
}

async fn accept_loop(listener: TcpListener, registry: PeerRegistry) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(addr = %addr, "Accepted connection");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(addr = %addr, "could not set TCP_NODELAY: {}", e);
                }
                registry.add(Transport::tcp(stream), false);
            }
            Err(e) => {
                error!("accept error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Dial `addr`, register the connection and authenticate with `credential`,
/// announcing this process as `node_id`.
///
/// The session is closed again if authentication does not succeed within
/// `timeout`. The listener rejects a second connection under a node id it
/// already serves.
pub async fn connect(
    addr: SocketAddr,
    registry: &PeerRegistry,
    credential: &str,
    node_id: &str,
    timeout: Duration,
) -> Result<Arc<PeerSession>, WireError> {
    info!(addr = %addr, "Connecting to peer");
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    let session = registry.add(Transport::tcp(stream), true);
    if let Err(e) = session
        .authenticate(credential, Some(node_id), timeout)
        .await
    {
        warn!(addr = %addr, "Authentication with peer failed: {}", e);
        session.close();
        return Err(e);
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SharedSecret;

    async fn wait_for(registry: &PeerRegistry, authenticated: usize) {
        for _ in 0..100 {
            if registry.authenticated_count() == authenticated {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_listen_and_connect() {
        let server = PeerRegistry::with_validator(Arc::new(SharedSecret::new("hunter2")));
        let (node, _task) = PeerNode::listen("127.0.0.1:0".parse().unwrap(), server.clone())
            .await
            .unwrap();

        let client = PeerRegistry::new();
        let session = connect(
            node.local_addr(),
            &client,
            "hunter2",
            "node-1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(session.is_authenticated());
        assert_eq!(client.connected_count(), 1);

        wait_for(&server, 1).await;
        assert_eq!(server.authenticated_count(), 1);
        assert!(server.get("node-1").is_some());
    }

    #[tokio::test]
    async fn test_second_connection_with_same_node_id_rejected() {
        let server = PeerRegistry::with_validator(Arc::new(SharedSecret::new("hunter2")));
        let (node, _task) = PeerNode::listen("127.0.0.1:0".parse().unwrap(), server.clone())
            .await
            .unwrap();
        let timeout = Duration::from_secs(5);

        let first = connect(node.local_addr(), &PeerRegistry::new(), "hunter2", "desk", timeout)
            .await
            .unwrap();
        let again = connect(node.local_addr(), &PeerRegistry::new(), "hunter2", "desk", timeout).await;
        assert!(again.is_err());

        for _ in 0..100 {
            if server.connected_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.connected_count(), 1);
        assert!(!first.is_closed());
        assert!(server.get("desk").is_some_and(|s| s.is_authenticated()));

        // A different node id is still welcome.
        connect(node.local_addr(), &PeerRegistry::new(), "hunter2", "laptop", timeout)
            .await
            .unwrap();
        wait_for(&server, 2).await;
        assert_eq!(server.authenticated_count(), 2);
    }

    #[tokio::test]
    async fn test_connect_with_bad_credential() {
        let server = PeerRegistry::with_validator(Arc::new(SharedSecret::new("hunter2")));
        let (node, _task) = PeerNode::listen("127.0.0.1:0".parse().unwrap(), server.clone())
            .await
            .unwrap();

        let client = PeerRegistry::new();
        let result = connect(
            node.local_addr(),
            &client,
            "guess",
            "node-1",
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(WireError::AuthFailed)));
        assert_eq!(server.authenticated_count(), 0);
    }
}
