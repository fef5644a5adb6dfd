//! Socket-level tests for the relay, registry, and question flow: a real
//! listener, real browser/worker WebSocket clients, and the HTTP API.

use futures::{SinkExt, StreamExt};
use hq_fleet::{ComputeBackend, MockComputeBackend};
use hq_server::http::build_router;
use hq_server::{AppState, Services};
use hq_settings::HqSettings;
use hq_store::{ConnectionConfig, Store, new_in_memory};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> (SocketAddr, Arc<Services>) {
    let mut settings = HqSettings::default();
    settings.server.skip_auth = true;
    let settings = Arc::new(settings);

    let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
    let store = Arc::new(Store::open(pool).unwrap());
    let fleet: Arc<dyn ComputeBackend> = Arc::new(MockComputeBackend::new());
    let services = Services::new(settings, store, fleet, None);

    let router = build_router(AppState::new(Arc::clone(&services)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _ = tokio::spawn(axum::serve(listener, router).into_future());
    (addr, services)
}

async fn connect_browser(addr: SocketAddr, device_id: &str) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/ws?deviceId={device_id}"))
        .await
        .unwrap();
    ws
}

async fn connect_worker(
    addr: SocketAddr,
    session_id: &str,
    token: &str,
) -> Result<WsClient, tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{addr}/ws/relay/{session_id}")
        .into_client_request()
        .unwrap();
    let _ = request.headers_mut().insert(
        "authorization",
        format!("Bearer {token}").parse().unwrap(),
    );
    connect_async(request).await.map(|(ws, _)| ws)
}

/// Read text frames until `predicate` matches, skipping everything else.
async fn next_matching(ws: &mut WsClient, predicate: impl Fn(&Value) -> bool) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            let message = ws.next().await.expect("socket closed early").unwrap();
            if let Message::Text(text) = message {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if predicate(&value) {
                    return value;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

async fn create_session(addr: SocketAddr, prompt: &str) -> (String, String) {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/api/sessions"))
        .json(&json!({"prompt": prompt}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    (
        body["sessionId"].as_str().unwrap().to_string(),
        body["accessToken"].as_str().unwrap().to_string(),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection registry over real sockets
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn browser_handshake_sends_connected() {
    let (addr, _services) = start_server().await;
    let mut ws = connect_browser(addr, "dev-hello").await;
    let frame = next_matching(&mut ws, |v| v["type"] == "connected").await;
    assert_eq!(frame["payload"]["deviceId"], "dev-hello");
    assert!(frame["timestamp"].is_string(), "envelope carries timestamp");
}

#[tokio::test]
async fn missing_device_id_reports_error_then_closes() {
    let (addr, _services) = start_server().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let frame = next_matching(&mut ws, |v| v["type"] == "error").await;
    assert_eq!(frame["payload"]["code"], "MISSING_DEVICE_ID");
    // Server closes after the error report.
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => {}
                Some(Err(_)) => return true,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
}

#[tokio::test]
async fn duplicate_device_id_closes_first_socket() {
    let (addr, services) = start_server().await;
    let mut first = connect_browser(addr, "same-device").await;
    let _ = next_matching(&mut first, |v| v["type"] == "connected").await;

    let mut second = connect_browser(addr, "same-device").await;
    let _ = next_matching(&mut second, |v| v["type"] == "connected").await;

    // The first socket receives close 1000 / "New connection established".
    let close = tokio::time::timeout(WAIT, async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await
    .unwrap()
    .expect("expected a close frame");
    assert_eq!(u16::from(close.code), 1000);
    assert_eq!(close.reason.as_str(), "New connection established");

    assert_eq!(services.registry.len(), 1);
}

#[tokio::test]
async fn ping_gets_enveloped_pong() {
    let (addr, _services) = start_server().await;
    let mut ws = connect_browser(addr, "dev-ping").await;
    let _ = next_matching(&mut ws, |v| v["type"] == "connected").await;
    ws.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
    let frame = next_matching(&mut ws, |v| v["type"] == "pong").await;
    assert!(frame["payload"]["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn unknown_frame_type_fails_connection_with_protocol_error() {
    let (addr, _services) = start_server().await;
    let mut ws = connect_browser(addr, "dev-proto").await;
    let _ = next_matching(&mut ws, |v| v["type"] == "connected").await;
    ws.send(Message::text(r#"{"type":"session_teleport","payload":{}}"#))
        .await
        .unwrap();
    let frame = next_matching(&mut ws, |v| v["type"] == "error").await;
    assert_eq!(frame["payload"]["code"], "PROTOCOL_ERROR");
}

// ─────────────────────────────────────────────────────────────────────────────
// Relay end-to-end
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn relay_delivers_initial_prompt_first_and_reports_phases() {
    let (addr, _services) = start_server().await;
    let (session_id, token) = create_session(addr, "Relay E2E live test").await;

    // Browser subscribes before the worker attaches.
    let mut browser = connect_browser(addr, "dev-relay").await;
    let _ = next_matching(&mut browser, |v| v["type"] == "connected").await;
    browser
        .send(Message::text(
            json!({"type": "session_subscribe", "payload": {"sessionId": session_id}}).to_string(),
        ))
        .await
        .unwrap();
    // Subscription snapshot: still starting.
    let snapshot = next_matching(&mut browser, |v| v["type"] == "session_status").await;
    assert_eq!(snapshot["payload"]["status"], "starting");

    // Worker dials the relay with its access token.
    let mut worker = connect_worker(addr, &session_id, &token).await.unwrap();

    // The FIRST frame the worker receives is the initial prompt.
    let first = tokio::time::timeout(WAIT, worker.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = first else {
        panic!("expected a text frame, got {first:?}");
    };
    let frame: Value = serde_json::from_str(text.as_str().trim()).unwrap();
    assert_eq!(frame["type"], "user");
    assert_eq!(frame["content"], "Relay E2E live test");

    // Browser sees the startup phase advance to initializing…
    let status = next_matching(&mut browser, |v| {
        v["type"] == "session_status" && v["payload"]["startupPhase"] == "initializing"
    })
    .await;
    assert_eq!(status["payload"]["sessionId"], session_id);

    // …and to ready once the worker reports system/init.
    worker
        .send(Message::text(
            "{\"type\":\"system\",\"subtype\":\"init\",\"capabilities\":{\"tools\":[\"bash\"]}}\n",
        ))
        .await
        .unwrap();
    let status = next_matching(&mut browser, |v| {
        v["type"] == "session_status" && v["payload"]["startupPhase"] == "ready"
    })
    .await;
    assert_eq!(status["payload"]["status"], "active");

    // Worker output fans out as session_message with the raw frame.
    worker
        .send(Message::text(
            "{\"type\":\"assistant\",\"content\":\"On it.\"}\n",
        ))
        .await
        .unwrap();
    let message = next_matching(&mut browser, |v| v["type"] == "session_message").await;
    assert_eq!(message["payload"]["messageType"], "assistant");
    assert_eq!(message["payload"]["content"], "On it.");

    // Browser input reaches the worker as a user frame.
    browser
        .send(Message::text(
            json!({
                "type": "session_user_message",
                "payload": {"sessionId": session_id, "content": "continue"}
            })
            .to_string(),
        ))
        .await
        .unwrap();
    let forwarded = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(Ok(Message::Text(text))) = worker.next().await {
                let value: Value = serde_json::from_str(text.as_str().trim()).unwrap();
                if value["type"] == "user" {
                    return value;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(forwarded["content"], "continue");
}

#[tokio::test]
async fn access_token_is_single_use() {
    let (addr, _services) = start_server().await;
    let (session_id, token) = create_session(addr, "single use").await;

    let worker = connect_worker(addr, &session_id, &token).await.unwrap();
    drop(worker);

    // Replay is rejected before the upgrade completes.
    let err = connect_worker(addr, &session_id, &token).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 403);
        }
        other => panic!("expected HTTP 403 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn relay_rejects_missing_token() {
    let (addr, _services) = start_server().await;
    let (session_id, _token) = create_session(addr, "no token").await;
    let request = format!("ws://{addr}/ws/relay/{session_id}")
        .into_client_request()
        .unwrap();
    let err = connect_async(request).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_worker_lines_are_dropped_not_fatal() {
    let (addr, _services) = start_server().await;
    let (session_id, token) = create_session(addr, "noise tolerant").await;

    let mut browser = connect_browser(addr, "dev-noise").await;
    let _ = next_matching(&mut browser, |v| v["type"] == "connected").await;
    browser
        .send(Message::text(
            json!({"type": "session_subscribe", "payload": {"sessionId": session_id}}).to_string(),
        ))
        .await
        .unwrap();

    let mut worker = connect_worker(addr, &session_id, &token).await.unwrap();
    let _ = tokio::time::timeout(WAIT, worker.next()).await.unwrap(); // initial prompt

    // stderr noise, then a valid frame: the session survives.
    worker
        .send(Message::text("warning: something scribbled on stdout\n"))
        .await
        .unwrap();
    worker
        .send(Message::text(
            "{\"type\":\"system\",\"subtype\":\"init\"}\n",
        ))
        .await
        .unwrap();

    let status = next_matching(&mut browser, |v| {
        v["type"] == "session_status" && v["payload"]["status"] == "active"
    })
    .await;
    assert_eq!(status["payload"]["sessionId"], session_id);
}

// ─────────────────────────────────────────────────────────────────────────────
// Question flow over HTTP
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn question_round_trip_over_api() {
    let (addr, _services) = start_server().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let response = client
        .post(format!("{base}/api/workers"))
        .json(&json!({"id": "test-worker", "name": "Test Worker", "status": "running"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let response = client
        .post(format!("{base}/api/workers/test-worker/questions"))
        .json(&json!({"text": "What branch?"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["question"]["status"], "pending");
    let question_id = body["question"]["questionId"].as_str().unwrap().to_string();

    // Worker suspended.
    let body: Value = client
        .get(format!("{base}/api/workers/test-worker"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["worker"]["status"], "waiting_input");

    let response = client
        .post(format!(
            "{base}/api/workers/test-worker/questions/{question_id}/answer"
        ))
        .json(&json!({"answer": "main"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["question"]["status"], "answered");
    assert_eq!(body["question"]["answer"], "main");

    // Worker resumed.
    let body: Value = client
        .get(format!("{base}/api/workers/test-worker"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["worker"]["status"], "running");

    // Answering again conflicts.
    let response = client
        .post(format!(
            "{base}/api/workers/test-worker/questions/{question_id}/answer"
        ))
        .json(&json!({"answer": "develop"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn question_validation_over_api() {
    let (addr, _services) = start_server().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let _ = client
        .post(format!("{base}/api/workers"))
        .json(&json!({"id": "picky-worker", "name": "Picky"}))
        .send()
        .await
        .unwrap();

    // Duplicate option ids.
    let response = client
        .post(format!("{base}/api/workers/picky-worker/questions"))
        .json(&json!({
            "text": "Pick",
            "options": [{"id": "a", "text": "A"}, {"id": "a", "text": "B"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(
        body["message"].as_str().unwrap().contains("Duplicate option ID"),
        "{body}"
    );

    // Unknown worker.
    let response = client
        .post(format!("{base}/api/workers/ghost/questions"))
        .json(&json!({"text": "Anyone?"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Option-constrained answers.
    let response = client
        .post(format!("{base}/api/workers/picky-worker/questions"))
        .json(&json!({
            "text": "Pick",
            "options": [{"id": "opt-a", "text": "A"}, {"id": "opt-b", "text": "B"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    let question_id = body["question"]["questionId"].as_str().unwrap().to_string();

    let response = client
        .post(format!(
            "{base}/api/workers/picky-worker/questions/{question_id}/answer"
        ))
        .json(&json!({"answer": "invalid-option"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .contains("must be one of the option IDs"),
        "{body}"
    );

    let response = client
        .post(format!(
            "{base}/api/workers/picky-worker/questions/{question_id}/answer"
        ))
        .json(&json!({"answer": "opt-a"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn session_messages_page_by_sequence() {
    let (addr, services) = start_server().await;
    let (session_id, token) = create_session(addr, "paging").await;

    let mut worker = connect_worker(addr, &session_id, &token).await.unwrap();
    let _ = tokio::time::timeout(WAIT, worker.next()).await.unwrap(); // prompt
    worker
        .send(Message::text("{\"type\":\"system\",\"subtype\":\"init\"}\n"))
        .await
        .unwrap();
    for i in 1..=3 {
        worker
            .send(Message::text(format!(
                "{{\"type\":\"assistant\",\"content\":\"step {i}\"}}\n"
            )))
            .await
            .unwrap();
    }

    // Wait until all three are persisted.
    let session = hq_core::ids::SessionId::from_string(session_id.clone());
    tokio::time::timeout(WAIT, async {
        loop {
            let messages = services.store.messages_after(&session, 0).unwrap();
            if messages.len() >= 3 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let client = reqwest::Client::new();
    let body: Value = client
        .get(format!("http://{addr}/api/sessions/{session_id}/messages?after=1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 2);
    assert_eq!(body["messages"][0]["sequence"], 2);
    assert_eq!(body["messages"][1]["sequence"], 3);
    assert_eq!(body["messages"][1]["content"], "step 3");
}
