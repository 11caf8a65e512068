//! End-to-end tests against a live server: websocket handshake, relay
//! between participants, liveness closes, and the provisioning endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use scriptcast::assignment::AssignmentService;
use scriptcast::authz::{AccessRequest, Authorize, AuthzError, Permissions};
use scriptcast::broker::MemoryBroker;
use scriptcast::config::Config;
use scriptcast::gateway::Gateway;
use scriptcast::multiplexer::Multiplexer;
use scriptcast::presence::PresenceStore;
use scriptcast::server::{self, AppState};
use scriptcast::store::MemoryStore;

struct ApproveAll;

#[async_trait]
impl Authorize for ApproveAll {
    async fn authorize(&self, request: &AccessRequest) -> Result<Permissions, AuthzError> {
        // Numeric tokens double as the resolved user id, so tests can model
        // distinct participants
        Ok(Permissions {
            approved: vec![
                "CREATE".to_string(),
                "READ".to_string(),
                "UPDATE".to_string(),
            ],
            denied: vec![],
            user: request.token.parse().unwrap_or(7),
        })
    }
}

async fn start_server(config: Config) -> (SocketAddr, Arc<Gateway>) {
    let store = Arc::new(MemoryStore::from_pairs(&[(1, "host-1".to_string())]));
    let broker = Arc::new(MemoryBroker::new());

    let gateway = Arc::new(Gateway {
        assignment: Arc::new(AssignmentService::new(store)),
        multiplexer: Arc::new(Multiplexer::new(
            broker,
            config.subscription_threshold,
            config.receive_buffer,
        )),
        authorizer: Arc::new(ApproveAll),
        presence: Arc::new(PresenceStore::new()),
        config,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let state = AppState {
        gateway: gateway.clone(),
    };
    tokio::spawn(async move {
        server::serve(listener, state).await.unwrap();
    });

    (addr, gateway)
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

const AUTH: &str = r#"auth,{"session":42,"token":"t","actions":[]}"#;

fn auth_frame(token: &str) -> String {
    format!(r#"auth,{{"session":42,"token":"{}","actions":[]}}"#, token)
}

#[tokio::test]
async fn test_auth_then_relay_between_participants() {
    let (addr, gateway) = start_server(Config::default()).await;
    let url = format!("ws://{}/room", addr);

    let (mut alice, _) = connect_async(&url).await.unwrap();
    alice
        .send(Message::Text(auth_frame("100").into()))
        .await
        .unwrap();

    let (mut bob, _) = connect_async(&url).await.unwrap();
    bob.send(Message::Text(auth_frame("200").into()))
        .await
        .unwrap();

    // Both participants share one subscription on the cold-start node
    let gw = gateway.clone();
    wait_for("both participants subscribed", || {
        gw.multiplexer.subscription_count(1) == 1 && gw.presence.count(42) == 2
    })
    .await;

    let node = gateway.assignment.resolve(42).await.unwrap().unwrap();
    assert_eq!(node.host, "host-1");
    assert_eq!(gateway.multiplexer.connection_count(1), 1);

    alice
        .send(Message::Text("msg,hello from alice".into()))
        .await
        .unwrap();

    // Bob receives the relayed payload
    let received = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match bob.next().await {
                Some(Ok(Message::Text(text))) => break text.to_string(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended early: {:?}", other),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received, "hello from alice");
}

#[tokio::test]
async fn test_unauthenticated_connection_is_closed() {
    let config = Config {
        heartbeat_interval: Duration::from_millis(20),
        auth_deadline_ticks: 3,
        ..Config::default()
    };
    let (addr, _gateway) = start_server(config).await;

    let (mut socket, _) = connect_async(format!("ws://{}/room", addr))
        .await
        .unwrap();

    let close = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break None,
            }
        }
    })
    .await
    .unwrap()
    .expect("expected a close frame");

    assert_eq!(close.code, CloseCode::Policy);
    assert_eq!(close.reason.as_str(), "not authenticated");
}

#[tokio::test]
async fn test_idle_connection_is_closed_for_no_status() {
    let config = Config {
        heartbeat_interval: Duration::from_millis(20),
        activity_timeout: Duration::from_millis(100),
        auth_deadline_ticks: 1000,
        ..Config::default()
    };
    let (addr, _gateway) = start_server(config).await;

    let (mut socket, _) = connect_async(format!("ws://{}/room", addr))
        .await
        .unwrap();
    socket.send(Message::Text(AUTH.into())).await.unwrap();

    let close = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break None,
            }
        }
    })
    .await
    .unwrap()
    .expect("expected a close frame");

    assert_eq!(close.code, CloseCode::Normal);
    assert_eq!(close.reason.as_str(), "no status received");
}

#[tokio::test]
async fn test_provisioning_endpoint_assigns_sticky_node() {
    let (addr, _gateway) = start_server(Config::default()).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/scripts/stream", addr);

    let first: serde_json::Value = client
        .post(&url)
        .json(&serde_json::json!({ "script_id": 9, "user_id": 3 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["node"], "host-1");

    // Sticky: same node on repeat, for any user
    let second: serde_json::Value = client
        .post(&url)
        .json(&serde_json::json!({ "script_id": 9, "user_id": 4 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["node"], "host-1");

    let bad = client
        .post(&url)
        .json(&serde_json::json!({ "script_id": 0, "user_id": 3 }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_corrupted_frame_drops_connection() {
    let (addr, _gateway) = start_server(Config::default()).await;

    let (mut socket, _) = connect_async(format!("ws://{}/room", addr))
        .await
        .unwrap();
    socket
        .send(Message::Text("no separator here".into()))
        .await
        .unwrap();

    // The server aborts without a close handshake; the socket just ends
    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(_))) => panic!("unexpected data after corrupt frame"),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "connection should drop after a corrupt frame");
}
