//! A server and a client over TCP sharing `dir` and `file` objects.

use mirror_objects::{register_all, VirtualRoot, CHANGE_EVENT, DIR_TYPE, FILE_TYPE};
use mirror_types::object::{ObjectKey, Side};
use mirror_wire::{
    connect, ObjectRouter, PeerNode, PeerRegistry, PeerSession, RouterConfig, SharedSecret,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PASSWORD: &str = "correct horse";

struct Server {
    router: ObjectRouter,
    addr: SocketAddr,
    _root: tempfile::TempDir,
}

async fn start_server() -> Server {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("readme.md"), "hello").unwrap();
    std::fs::create_dir(root.path().join("docs")).unwrap();

    let registry = PeerRegistry::with_validator(Arc::new(SharedSecret::new(PASSWORD)));
    let router = ObjectRouter::new(Side::SERVER, registry.clone(), RouterConfig::default());
    register_all(&router, VirtualRoot::new(root.path()));
    let (node, _task) = PeerNode::listen("127.0.0.1:0".parse().unwrap(), registry)
        .await
        .unwrap();

    Server {
        router,
        addr: node.local_addr(),
        _root: root,
    }
}

async fn start_client(addr: SocketAddr, node_id: &str) -> (ObjectRouter, Arc<PeerSession>) {
    let registry = PeerRegistry::new();
    let router = ObjectRouter::new(Side::CLIENT, registry.clone(), RouterConfig::default());
    // The client never touches its own root: every method runs on the server.
    register_all(&router, VirtualRoot::new("/nonexistent"));
    let session = connect(addr, &registry, PASSWORD, node_id, Duration::from_secs(5))
        .await
        .unwrap();
    (router, session)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn listing_survives_reconnect_with_fresh_instance() {
    let server = start_server().await;
    let key = ObjectKey::new(DIR_TYPE, "/");
    let expected = json!([
        { "name": "docs", "isDirectory": true, "path": "/docs" },
        { "name": "readme.md", "isDirectory": false, "path": "/readme.md" },
    ]);

    for round in 0..2 {
        let (client, session) = start_client(server.addr, &format!("client-{round}")).await;
        let dir = client.get_or_create(DIR_TYPE, "/").unwrap();
        let listing = dir.call("listFiles", vec![json!("/")]).await.unwrap();
        assert_eq!(listing, expected);
        assert_eq!(server.router.live_objects(), vec![key.clone()]);

        // Disconnect while still holding the checkout.
        session.close();
        assert!(wait_until(|| server.router.live_objects().is_empty()).await);
        drop(dir);
    }
}

#[tokio::test]
async fn file_edits_reach_every_holder() {
    let server = start_server().await;
    let (alice, _alice_session) = start_client(server.addr, "alice").await;
    let (bob, _bob_session) = start_client(server.addr, "bob").await;

    let alice_file = alice.get_or_create(FILE_TYPE, "/readme.md").unwrap();
    let bob_file = bob.get_or_create(FILE_TYPE, "/readme.md").unwrap();
    assert_eq!(
        bob_file.call("getContent", vec![]).await.unwrap(),
        json!("hello")
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    bob_file.on(CHANGE_EVENT, move |args| {
        s.lock().unwrap().push(args.clone());
    });

    alice_file
        .call("setContent", vec![json!("hello, bob")])
        .await
        .unwrap();
    assert!(wait_until(|| seen.lock().unwrap().len() == 1).await);
    assert_eq!(seen.lock().unwrap()[0], vec![json!("hello, bob")]);

    // The buffer is shared through the server's single instance.
    assert_eq!(
        bob_file.call("getContent", vec![]).await.unwrap(),
        json!("hello, bob")
    );
    assert_eq!(
        server.router.tracker_count(&ObjectKey::new(FILE_TYPE, "/readme.md")),
        2
    );
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let server = start_server().await;
    let registry = PeerRegistry::new();
    let result = connect(
        server.addr,
        &registry,
        "guess",
        "mallory",
        Duration::from_secs(5),
    )
    .await;
    assert!(result.is_err());
}
