use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::util::ServiceExt;

use exec_gateway::channel::{ChannelHub, ConnectionIdentity};
use exec_gateway::collaborators::Collaborators;
use exec_gateway::config::GatewayConfig;
use exec_gateway::crypto::{CredentialCipher, TokenSigner};
use exec_gateway::event_buffer::EventBuffer;
use exec_gateway::idempotency::{
    IdempotencyGate, InMemoryIdempotencyStore, IDEMPOTENCY_KEY_HEADER, REPLAY_HEADER,
};
use exec_gateway::router::{build_router, AppState};
use exec_gateway::scheduler::{InMemoryInstanceStore, RecordingLauncher, Scheduler};
use exec_gateway::sse_relay::SseRelay;
use exec_gateway_wire::GatewayMessage;

struct TestApp {
    app: Router,
    hub: Arc<ChannelHub>,
    launcher: Arc<RecordingLauncher>,
    gate: IdempotencyGate,
}

impl TestApp {
    fn new() -> Self {
        let signer = TokenSigner::new(b"integration-signing-secret".to_vec());
        let cipher = CredentialCipher::from_secret("integration-cipher-secret");

        let mut config = GatewayConfig::default();
        config.scheduler.bootstrap_command = Some(vec!["launch-instance".to_string()]);
        config
            .provider_secrets
            .insert("anthropic".to_string(), "sk-test".to_string());

        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            Arc::new(InMemoryInstanceStore::default()),
            launcher.clone(),
            signer.clone(),
        ));
        let hub = Arc::new(ChannelHub::new(
            scheduler,
            signer,
            cipher,
            Collaborators::in_memory(),
            Arc::new(EventBuffer::new(config.event_buffer_capacity)),
            Arc::new(SseRelay::new()),
            config,
        ));
        let gate = IdempotencyGate {
            store: Arc::new(InMemoryIdempotencyStore::default()),
            ttl: Duration::from_secs(300),
        };
        let app = build_router(AppState {
            hub: hub.clone(),
            gate: gate.clone(),
        });

        Self {
            app,
            hub,
            launcher,
            gate,
        }
    }

    fn bearer(&self, user_id: &str, org_id: &str) -> String {
        let token = self
            .hub
            .signer
            .issue(user_id, org_id, Duration::from_secs(300))
            .expect("issue token");
        format!("Bearer {token}")
    }
}

async fn send_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    let request_body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };

    let request = builder.body(request_body).expect("build request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();

    (status, headers, bytes.to_vec())
}

fn parse_json(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes).expect("valid json")
    }
}

#[tokio::test]
async fn health_needs_no_token() {
    let test = TestApp::new();
    let (status, _, body) = send_request(&test.app, Method::GET, "/v1/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["status"], "ok");
}

#[tokio::test]
async fn missing_token_yields_problem_details() {
    let test = TestApp::new();
    let (status, _, body) = send_request(&test.app, Method::GET, "/v1/vm/status", None, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let problem = parse_json(&body);
    assert_eq!(problem["type"], "urn:exec-gateway:error:token_invalid");
    assert_eq!(problem["status"], 401);
}

#[tokio::test]
async fn garbage_token_is_rejected() {
    let test = TestApp::new();
    let (status, _, _) = send_request(
        &test.app,
        Method::GET,
        "/v1/vm/status",
        None,
        &[("authorization", "Bearer not-a-token")],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ensure_bootstraps_once_then_backs_off() {
    let test = TestApp::new();
    let auth = test.bearer("user-1", "org-1");

    let (status, _, body) = send_request(
        &test.app,
        Method::POST,
        "/v1/vm/ensure",
        None,
        &[("authorization", &auth)],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let result = parse_json(&body);
    assert_eq!(result["ready"], false);
    assert_eq!(result["status"], "provisioning");
    assert_eq!(test.launcher.spawn_count(), 1);

    let (status, _, body) = send_request(
        &test.app,
        Method::POST,
        "/v1/vm/ensure",
        None,
        &[("authorization", &auth)],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let result = parse_json(&body);
    assert_eq!(result["ready"], false);
    assert!(result["retryAfterMs"].as_u64().is_some());
    assert_eq!(test.launcher.spawn_count(), 1);
}

#[tokio::test]
async fn status_reflects_bootstrap_progress() {
    let test = TestApp::new();
    let auth = test.bearer("user-1", "org-1");

    send_request(
        &test.app,
        Method::POST,
        "/v1/vm/ensure",
        None,
        &[("authorization", &auth)],
    )
    .await;

    let (status, _, body) = send_request(
        &test.app,
        Method::GET,
        "/v1/vm/status",
        None,
        &[("authorization", &auth)],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let view = parse_json(&body);
    assert_eq!(view["status"], "provisioning");
    assert_eq!(view["bootstrapAttempts"], 1);
    assert!(view["instanceId"].as_str().is_some());
}

#[tokio::test]
async fn rebootstrap_bypasses_cooldown() {
    let test = TestApp::new();
    let auth = test.bearer("user-1", "org-1");

    send_request(
        &test.app,
        Method::POST,
        "/v1/vm/ensure",
        None,
        &[("authorization", &auth)],
    )
    .await;
    assert_eq!(test.launcher.spawn_count(), 1);

    let (status, _, _) = send_request(
        &test.app,
        Method::POST,
        "/v1/vm/rebootstrap",
        None,
        &[("authorization", &auth)],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(test.launcher.spawn_count(), 2);
}

#[tokio::test]
async fn message_without_live_instance_is_persisted_then_unavailable() {
    let test = TestApp::new();
    let auth = test.bearer("user-1", "org-1");

    let (status, _, body) = send_request(
        &test.app,
        Method::POST,
        "/v1/sessions/s-1/messages",
        Some(json!({"message": {"text": "run the report"}})),
        &[("authorization", &auth)],
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let problem = parse_json(&body);
    assert_eq!(
        problem["type"],
        "urn:exec-gateway:error:instance_unavailable"
    );

    // The message outlives the failed dispatch.
    let stored = test
        .hub
        .collaborators
        .messages
        .session_messages("s-1")
        .await
        .expect("session messages");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].kind, "user");
}

#[tokio::test]
async fn message_dispatches_to_live_instance() {
    let test = TestApp::new();
    let auth = test.bearer("user-1", "org-1");

    let (tx, mut rx) = mpsc::channel(8);
    test.hub
        .register(
            &ConnectionIdentity {
                user_id: "user-1".to_string(),
                org_id: "org-1".to_string(),
                instance_id: None,
            },
            tx,
        )
        .await;

    let (status, _, body) = send_request(
        &test.app,
        Method::POST,
        "/v1/sessions/s-1/messages",
        Some(json!({"message": {"text": "run the report"}})),
        &[("authorization", &auth)],
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let response = parse_json(&body);
    assert_eq!(response["accepted"], true);
    assert_eq!(response["sessionId"], "s-1");

    match rx.recv().await.expect("dispatched message") {
        GatewayMessage::Execute {
            session_id,
            message,
        } => {
            assert_eq!(session_id, "s-1");
            assert_eq!(message["text"], "run the report");
        }
        other => panic!("expected execute, got {other:?}"),
    }
}

#[tokio::test]
async fn idempotency_key_replays_completed_response() {
    let test = TestApp::new();
    let auth = test.bearer("user-1", "org-1");
    let headers = [
        ("authorization", auth.as_str()),
        (IDEMPOTENCY_KEY_HEADER, "ensure-1"),
    ];

    let (status, _, first_body) =
        send_request(&test.app, Method::POST, "/v1/vm/ensure", None, &headers).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(test.launcher.spawn_count(), 1);

    let (status, reply_headers, second_body) =
        send_request(&test.app, Method::POST, "/v1/vm/ensure", None, &headers).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second_body, first_body);
    assert_eq!(
        reply_headers
            .get(REPLAY_HEADER)
            .and_then(|value| value.to_str().ok()),
        Some("true")
    );
    // The handler never ran a second time.
    assert_eq!(test.launcher.spawn_count(), 1);
}

#[tokio::test]
async fn idempotency_key_replays_error_responses_too() {
    let test = TestApp::new();
    let auth = test.bearer("user-1", "org-1");
    let headers = [
        ("authorization", auth.as_str()),
        (IDEMPOTENCY_KEY_HEADER, "msg-1"),
    ];

    // No live instance: the handler answers 503 and bootstraps once.
    let (status, _, first_body) = send_request(
        &test.app,
        Method::POST,
        "/v1/sessions/s-1/messages",
        Some(json!({"message": {"text": "run"}})),
        &headers,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(test.launcher.spawn_count(), 1);

    // The retry replays that outcome instead of re-running the handler.
    let (status, reply_headers, second_body) = send_request(
        &test.app,
        Method::POST,
        "/v1/sessions/s-1/messages",
        Some(json!({"message": {"text": "run"}})),
        &headers,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(second_body, first_body);
    assert_eq!(
        reply_headers
            .get(REPLAY_HEADER)
            .and_then(|value| value.to_str().ok()),
        Some("true")
    );
    assert_eq!(test.launcher.spawn_count(), 1);

    let stored = test
        .hub
        .collaborators
        .messages
        .session_messages("s-1")
        .await
        .expect("session messages");
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn in_flight_duplicate_conflicts() {
    let test = TestApp::new();
    let auth = test.bearer("user-1", "org-1");

    // Hold the claim as if another request were mid-handler.
    test.gate
        .store
        .claim("ensure-2", test.gate.ttl)
        .await
        .expect("claim key");

    let (status, _, body) = send_request(
        &test.app,
        Method::POST,
        "/v1/vm/ensure",
        None,
        &[
            ("authorization", &auth),
            (IDEMPOTENCY_KEY_HEADER, "ensure-2"),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let problem = parse_json(&body);
    assert_eq!(problem["type"], "urn:exec-gateway:error:duplicate_request");
}

#[tokio::test]
async fn sse_replays_events_after_last_event_id() {
    let test = TestApp::new();
    let auth = test.bearer("user-1", "org-1");

    for n in 1..=3 {
        test.hub
            .events
            .push("s-1", "agent_progress", json!({"step": n}))
            .await;
    }

    let request = Request::builder()
        .method(Method::GET)
        .uri("/v1/sessions/s-1/events/sse")
        .header("authorization", &auth)
        .header("last-event-id", "1")
        .body(Body::empty())
        .expect("build request");
    let response = test
        .app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::OK);

    // End the live tail so the body stream terminates.
    test.hub.relay.close_all("s-1").await;

    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    let text = String::from_utf8(bytes.to_vec()).expect("utf8 body");

    let ids: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("id:").map(str::trim))
        .collect();
    assert_eq!(ids, ["2", "3"]);
    let events: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("event:").map(str::trim))
        .collect();
    assert_eq!(events, ["agent_progress", "agent_progress"]);
    assert!(text.contains(r#"{"step":3}"#));
}

#[tokio::test]
async fn unknown_route_is_404() {
    let test = TestApp::new();
    let (status, _, _) = send_request(&test.app, Method::GET, "/v1/nope", None, &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
