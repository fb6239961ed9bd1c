//! End-to-end relay tests: a real listener, a stub authentication service
//! and tungstenite clients.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use beach_beacon::{config::ServerConfig, routes::build_router, state::AppState};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DATE: &str = "2024-01-01";
const WAIT: Duration = Duration::from_secs(5);
const SLOW_AUTH: Duration = Duration::from_secs(3);

#[derive(Clone, Default)]
struct StubAuth {
    seen_cids: Arc<Mutex<Vec<String>>>,
}

#[derive(Deserialize)]
struct CidQuery {
    cid: String,
}

/// `Bearer user-<n>` resolves to uid n and `Bearer slow-<n>` does the same
/// after `SLOW_AUTH`. A couple of fixed tokens exercise the identity edge
/// cases; anything else is a 401.
async fn stub_auth(
    State(stub): State<StubAuth>,
    headers: HeaderMap,
    Query(query): Query<CidQuery>,
) -> Response {
    stub.seen_cids.lock().unwrap().push(query.cid);
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    match bearer.strip_prefix("Bearer ") {
        Some(token) if token.starts_with("user-") => {
            let uid = token.trim_start_matches("user-").to_string();
            Json(json!({ "data": { "uid": uid } })).into_response()
        }
        Some(token) if token.starts_with("slow-") => {
            tokio::time::sleep(SLOW_AUTH).await;
            let uid = token.trim_start_matches("slow-").to_string();
            Json(json!({ "data": { "uid": uid } })).into_response()
        }
        Some("text-uid") => Json(json!({ "data": { "uid": "abc" } })).into_response(),
        Some("no-uid") => Json(json!({ "data": {} })).into_response(),
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

struct Harness {
    addr: SocketAddr,
    state: Arc<AppState>,
    stub: StubAuth,
}

impl Harness {
    async fn start(handshake_timeout: Option<Duration>) -> Self {
        let stub = StubAuth::default();
        let auth_addr = serve(
            Router::new()
                .route("/auth", get(stub_auth))
                .with_state(stub.clone()),
        )
        .await;

        let mut config = ServerConfig::new(format!("http://{auth_addr}/auth"), "client", "secret");
        config.handshake_timeout = handshake_timeout;
        let state = Arc::new(AppState::from_config(&config).unwrap());
        let addr = serve(build_router(state.clone())).await;

        Self { addr, state, stub }
    }

    async fn connect(&self, cid: &str) -> Client {
        let url = format!("ws://{}/ws?cid={}", self.addr, cid);
        let (client, _) = timeout(WAIT, connect_async(url)).await.unwrap().unwrap();
        client
    }

    async fn connect_as(&self, cid: &str, token: &str) -> Client {
        let mut client = self.connect(cid).await;
        send_json(&mut client, json!({ "token": token })).await;
        client
    }

    async fn wait_for_channels(&self, user_id: i64, expected: usize) {
        timeout(WAIT, async {
            while self.state.registry.channel_count(user_id) != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("user {user_id} never reached {expected} channels"));
    }

    async fn notify(&self, notifications: Value) -> Value {
        let response = reqwest::Client::new()
            .post(format!("http://{}/notify", self.addr))
            .header("authorization", self.state.tokens.bearer(DATE))
            .json(&json!({ "date": DATE, "notifications": notifications }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.unwrap()
    }
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn next_notification(client: &mut Client) -> Value {
    timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(text.as_str()).unwrap()
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected notification, got {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

/// Reads until the relay closes the socket; returns the close code if a
/// close frame carried one.
async fn close_code(client: &mut Client) -> Option<u16> {
    timeout(WAIT, async {
        while let Some(frame) = client.next().await {
            match frame {
                Ok(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    })
    .await
    .expect("timed out waiting for close")
}

#[tokio::test]
async fn authenticated_channel_receives_notifications() {
    let harness = Harness::start(Some(WAIT)).await;
    let mut client = harness.connect_as("conn-7", "user-7").await;
    harness.wait_for_channels(7, 1).await;

    let results = harness
        .notify(json!([{ "user_id": 7, "body": { "x": 1 } }]))
        .await;
    assert_eq!(results, json!([{ "user_id": 7, "status": "success_sent" }]));
    assert_eq!(next_notification(&mut client).await, json!({ "x": 1 }));

    assert_eq!(
        harness.stub.seen_cids.lock().unwrap().as_slice(),
        ["conn-7".to_string()]
    );
}

#[tokio::test]
async fn every_channel_of_a_user_receives_the_fan_out() {
    let harness = Harness::start(Some(WAIT)).await;
    let mut phone = harness.connect_as("phone", "user-3").await;
    let mut laptop = harness.connect_as("laptop", "user-3").await;
    let mut other = harness.connect_as("other", "user-4").await;
    harness.wait_for_channels(3, 2).await;
    harness.wait_for_channels(4, 1).await;

    let results = harness
        .notify(json!([
            { "user_id": 3, "body": { "title": "hi" } },
            { "user_id": 99, "body": { "title": "nobody" } }
        ]))
        .await;
    assert_eq!(
        results,
        json!([
            { "user_id": 3, "status": "success_sent" },
            { "user_id": 99, "status": "success_not_connected" }
        ])
    );

    assert_eq!(next_notification(&mut phone).await, json!({ "title": "hi" }));
    assert_eq!(next_notification(&mut laptop).await, json!({ "title": "hi" }));
    assert!(
        timeout(Duration::from_millis(200), other.next()).await.is_err(),
        "user 4 must not receive user 3's notification"
    );
}

#[tokio::test]
async fn rejected_token_closes_with_policy_violation() {
    let harness = Harness::start(Some(WAIT)).await;
    let mut client = harness.connect_as("conn-1", "wrong").await;
    assert_eq!(close_code(&mut client).await, Some(1008));
    assert!(harness.state.registry.is_empty());
}

#[tokio::test]
async fn non_integer_identity_closes_with_unsupported_data() {
    let harness = Harness::start(Some(WAIT)).await;
    let mut client = harness.connect_as("conn-1", "text-uid").await;
    assert_eq!(close_code(&mut client).await, Some(1003));
    assert!(harness.state.registry.is_empty());
}

#[tokio::test]
async fn missing_identity_closes_normally() {
    let harness = Harness::start(Some(WAIT)).await;
    let mut client = harness.connect_as("conn-1", "no-uid").await;
    assert_eq!(close_code(&mut client).await, Some(1000));
    assert!(harness.state.registry.is_empty());
}

#[tokio::test]
async fn token_frame_without_token_is_rejected() {
    let harness = Harness::start(Some(WAIT)).await;
    let mut client = harness.connect("conn-1").await;
    send_json(&mut client, json!({ "hello": "world" })).await;
    assert_eq!(close_code(&mut client).await, Some(1008));
    assert!(harness.stub.seen_cids.lock().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_token_frame_is_an_internal_error() {
    let harness = Harness::start(Some(WAIT)).await;
    let mut client = harness.connect("conn-1").await;
    client
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    assert_eq!(close_code(&mut client).await, Some(1011));
}

#[tokio::test]
async fn silent_client_hits_handshake_timeout() {
    let harness = Harness::start(Some(Duration::from_millis(200))).await;
    let mut client = harness.connect("conn-1").await;
    assert_eq!(close_code(&mut client).await, Some(1008));
}

#[tokio::test]
async fn disconnect_unregisters_channel() {
    let harness = Harness::start(Some(WAIT)).await;
    let mut first = harness.connect_as("a", "user-12").await;
    let mut second = harness.connect_as("b", "user-12").await;
    harness.wait_for_channels(12, 2).await;

    first.close(None).await.unwrap();
    harness.wait_for_channels(12, 1).await;
    assert!(harness.state.registry.contains_user(12));

    // inbound JSON after registration is accepted and ignored
    send_json(&mut second, json!({ "ack": true })).await;
    let results = harness
        .notify(json!([{ "user_id": 12, "body": { "still": "here" } }]))
        .await;
    assert_eq!(results[0]["status"], "success_sent");
    assert_eq!(next_notification(&mut second).await, json!({ "still": "here" }));

    second.close(None).await.unwrap();
    harness.wait_for_channels(12, 0).await;
    assert!(!harness.state.registry.contains_user(12));

    let results = harness
        .notify(json!([{ "user_id": 12, "body": { "late": true } }]))
        .await;
    assert_eq!(results[0]["status"], "success_not_connected");
}

#[tokio::test]
async fn invalid_frame_after_registration_closes_and_unregisters() {
    let harness = Harness::start(Some(WAIT)).await;
    let mut client = harness.connect_as("conn-1", "user-8").await;
    harness.wait_for_channels(8, 1).await;

    client
        .send(Message::Text("{broken".to_string().into()))
        .await
        .unwrap();
    assert_eq!(close_code(&mut client).await, Some(1011));
    harness.wait_for_channels(8, 0).await;
}

#[tokio::test]
async fn missing_cid_is_rejected_before_upgrade() {
    let harness = Harness::start(Some(WAIT)).await;
    let url = format!("ws://{}/ws", harness.addr);
    let result = timeout(WAIT, connect_async(url)).await.unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn batch_larger_than_channel_depth_reaches_live_client() {
    let harness = Harness::start(Some(WAIT)).await;
    let mut client = harness.connect_as("conn-7", "user-7").await;
    harness.wait_for_channels(7, 1).await;

    let items: Vec<Value> = (0..100)
        .map(|seq| json!({ "user_id": 7, "body": { "seq": seq } }))
        .collect();
    let results = harness.notify(Value::Array(items)).await;

    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 100);
    assert!(results
        .iter()
        .all(|result| result["status"] == "success_sent"));
    assert_eq!(harness.state.registry.channel_count(7), 1);

    for seq in 0..100 {
        assert_eq!(next_notification(&mut client).await, json!({ "seq": seq }));
    }
}

#[tokio::test]
async fn slow_auth_call_does_not_block_other_handshakes() {
    let harness = Harness::start(Some(WAIT)).await;
    let _slow = harness.connect_as("slow-conn", "slow-21").await;
    let _fast = harness.connect_as("fast-conn", "user-22").await;

    timeout(SLOW_AUTH / 2, harness.wait_for_channels(22, 1))
        .await
        .expect("fast handshake waited on the slow one");
    assert_eq!(harness.state.registry.channel_count(21), 0);

    harness.wait_for_channels(21, 1).await;
}

#[tokio::test]
async fn non_object_token_frame_is_an_internal_error() {
    let harness = Harness::start(Some(WAIT)).await;
    let mut client = harness.connect("conn-1").await;
    send_json(&mut client, json!(["token"])).await;
    assert_eq!(close_code(&mut client).await, Some(1011));
    assert!(harness.stub.seen_cids.lock().unwrap().is_empty());
}
