use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Extension, Json};
use axum::Router;
use futures::{stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use exec_gateway_error::{ErrorType, GatewayError, ProblemDetails};
use exec_gateway_wire::{EncryptedSecret, RoutingConfig};

use crate::channel::{reject_socket, serve_socket, ChannelHub};
use crate::idempotency::{idempotency_middleware, IdempotencyGate};
use crate::scheduler::{EnsureResult, InstanceStatus, InstanceStatusView};

static SSE_CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);
const SSE_QUEUE_DEPTH: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ChannelHub>,
    pub gate: IdempotencyGate,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Control-plane caller identity, extracted from the verified bearer
/// token by [`require_token`].
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub user_id: String,
    pub org_id: String,
}

pub fn build_router(state: AppState) -> Router {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/vm/status", get(get_vm_status))
        .route("/vm/ensure", post(post_vm_ensure))
        .route("/vm/rebootstrap", post(post_vm_rebootstrap))
        .route("/sessions/:session_id/messages", post(post_message))
        .route("/sessions/:session_id/events/sse", get(get_events_sse))
        .route("/channel", get(get_channel))
        .layer(axum::middleware::from_fn_with_state(
            state.gate.clone(),
            idempotency_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_token,
        ))
        .with_state(state);

    let mut router = Router::new().nest("/v1", v1_router).fallback(not_found);

    let http_logging = match std::env::var("EXEC_GATEWAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    router
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_vm_status,
        post_vm_ensure,
        post_vm_rebootstrap,
        post_message,
        get_events_sse
    ),
    components(
        schemas(
            HealthResponse,
            EnsureResult,
            InstanceStatus,
            InstanceStatusView,
            MessageRequest,
            MessageResponse,
            EncryptedSecret,
            RoutingConfig,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "vm", description = "Execution instance lifecycle"),
        (name = "sessions", description = "Session messaging and event streaming")
    )
)]
pub struct ApiDoc;

#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem = self.0.to_problem_details();
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

async fn require_token(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path();
    // The channel authenticates inside the websocket handshake with a
    // ticket or token of its own.
    if path.ends_with("/health") || path.ends_with("/channel") {
        return Ok(next.run(req).await);
    }

    let token = extract_token(req.headers()).ok_or(GatewayError::TokenInvalid {
        message: Some("missing bearer token".to_string()),
    })?;
    let claims = state.hub.signer.verify(&token)?;
    req.extensions_mut().insert(CallerIdentity {
        user_id: claims.user_id,
        org_id: claims.org_id,
    });
    Ok(next.run(req).await)
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = value.trim().split_once(' ')?;
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.trim().to_string()),
        _ => None,
    }
}

async fn not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, "404 Not Found".to_string())
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/vm/status",
    responses(
        (status = 200, body = InstanceStatusView),
        (status = 401, body = ProblemDetails)
    ),
    tag = "vm"
)]
async fn get_vm_status(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<Json<InstanceStatusView>, ApiError> {
    let status = state
        .hub
        .scheduler
        .get_status(&caller.user_id, &caller.org_id)
        .await?;
    Ok(Json(status))
}

#[utoipa::path(
    post,
    path = "/v1/vm/ensure",
    responses(
        (status = 200, body = EnsureResult),
        (status = 401, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "vm"
)]
async fn post_vm_ensure(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<Json<EnsureResult>, ApiError> {
    let ws_ready = state.hub.is_connected(&caller.user_id).await;
    let result = state
        .hub
        .scheduler
        .ensure(&caller.user_id, &caller.org_id, ws_ready)
        .await?;
    Ok(Json(result))
}

#[utoipa::path(
    post,
    path = "/v1/vm/rebootstrap",
    responses(
        (status = 200, body = EnsureResult),
        (status = 401, body = ProblemDetails)
    ),
    tag = "vm"
)]
async fn post_vm_rebootstrap(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<Json<EnsureResult>, ApiError> {
    let result = state
        .hub
        .scheduler
        .force_rebootstrap(&caller.user_id, &caller.org_id)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MessageRequest {
    pub message: Value,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub accepted: bool,
    pub session_id: String,
    pub instance_status: InstanceStatus,
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/messages",
    request_body = MessageRequest,
    responses(
        (status = 202, body = MessageResponse),
        (status = 401, body = ProblemDetails),
        (status = 409, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn post_message(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(session_id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    state
        .hub
        .collaborators
        .messages
        .append_message(
            &session_id,
            "user",
            request.message.clone(),
            serde_json::json!({}),
        )
        .await?;

    let ws_ready = state.hub.is_connected(&caller.user_id).await;
    let ensure = state
        .hub
        .scheduler
        .ensure(&caller.user_id, &caller.org_id, ws_ready)
        .await?;
    if !ensure.ready {
        // Message is persisted; the client retries dispatch once the
        // instance connects.
        return Err(GatewayError::InstanceUnavailable {
            user_id: caller.user_id,
            retry_after_ms: ensure.retry_after_ms,
        }
        .into());
    }

    state
        .hub
        .dispatch_execute(&caller.user_id, &session_id, request.message)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            accepted: true,
            session_id,
            instance_status: ensure.status,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct SseQuery {
    last_event_id: Option<u64>,
}

enum RelayFrame {
    Event {
        event_id: u64,
        event_name: String,
        payload: Value,
    },
    Closed,
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/events/sse",
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("last_event_id" = Option<u64>, Query, description = "Last seen event id (exclusive)")
    ),
    responses(
        (status = 200, description = "SSE event stream"),
        (status = 401, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_events_sse(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<SseQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Standard SSE reconnects carry Last-Event-ID; the query parameter
    // serves first connections and manual clients.
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .or(query.last_event_id)
        .unwrap_or(0);

    let connection_id = format!(
        "sse-{}",
        SSE_CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    let (tx, rx) = mpsc::channel::<RelayFrame>(SSE_QUEUE_DEPTH);

    let send_tx = tx.clone();
    let send = Box::new(move |event_id: u64, event_name: &str, payload: &Value| {
        send_tx
            .try_send(RelayFrame::Event {
                event_id,
                event_name: event_name.to_string(),
                payload: payload.clone(),
            })
            .is_ok()
    });
    let close = Box::new(move || {
        let _ = tx.try_send(RelayFrame::Closed);
    });
    state
        .hub
        .relay
        .register(&connection_id, &session_id, send, close)
        .await;

    // Replay after registering, then drop live frames that overlap the
    // snapshot. Ids are monotonic per session, so a simple watermark
    // dedupes the seam.
    let replay = state.hub.events.get_since(&session_id, last_event_id).await;
    let watermark = replay
        .last()
        .map(|event| event.event_id)
        .unwrap_or(last_event_id);

    let initial_stream = stream::iter(replay.into_iter().map(|event| {
        Ok::<Event, Infallible>(
            Event::default()
                .id(event.event_id.to_string())
                .event(event.event_name)
                .data(event.payload.to_string()),
        )
    }));

    let live_stream = ReceiverStream::new(rx)
        .take_while(|frame| {
            let open = !matches!(frame, RelayFrame::Closed);
            async move { open }
        })
        .filter_map(move |frame| async move {
            match frame {
                RelayFrame::Event {
                    event_id,
                    event_name,
                    payload,
                } if event_id > watermark => Some(Ok::<Event, Infallible>(
                    Event::default()
                        .id(event_id.to_string())
                        .event(event_name)
                        .data(payload.to_string()),
                )),
                _ => None,
            }
        });

    Ok(Sse::new(initial_stream.chain(live_stream)))
}

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    user_id: Option<String>,
}

/// Websocket upgrade for the execution-instance control channel.
/// Authentication happens inside the socket; a missing user id is
/// rejected with a policy-violation close after the upgrade completes.
async fn get_channel(
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match query.user_id {
            Some(user_id) => serve_socket(state.hub.clone(), socket, user_id).await,
            None => reject_socket(socket, "user_id query parameter required").await,
        }
    })
}
