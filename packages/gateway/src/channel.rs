//! Control-channel server.
//!
//! Each execution instance holds exactly one websocket to the gateway.
//! The socket authenticates with a single-use connect ticket (or a
//! signed bearer token on reconnect), receives its encrypted provider
//! credentials in an `init` payload, then exchanges RPC requests,
//! fire-and-forget notices, and streamed execution events.
//!
//! Message handling lives on [`ChannelHub`] and is independent of the
//! socket plumbing so the protocol can be exercised in tests without
//! opening a connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};

use exec_gateway_error::GatewayError;
use exec_gateway_wire::{
    classify_event, EventClass, GatewayMessage, InstanceMessage, Notice, RequestState,
    RequestStatus, RpcCall, RpcError,
};

use crate::collaborators::{read_skill_package, Collaborators};
use crate::config::GatewayConfig;
use crate::crypto::{CredentialCipher, TokenSigner};
use crate::event_buffer::EventBuffer;
use crate::scheduler::{now_ms, Scheduler};
use crate::sse_relay::SseRelay;

const OUTBOUND_QUEUE_DEPTH: usize = 64;
/// Request outcomes kept per user for reconnect resume. Oldest are
/// dropped once the cap is hit.
const MAX_CACHED_OUTCOMES: usize = 256;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity established by a successful handshake.
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    pub user_id: String,
    pub org_id: String,
    pub instance_id: Option<String>,
}

struct LiveConnection {
    connection_id: u64,
    outbound: mpsc::Sender<GatewayMessage>,
    last_heartbeat_ms: i64,
}

#[derive(Default)]
struct HubState {
    /// One live connection per user; a newer connection replaces the
    /// older entry.
    connections: HashMap<String, LiveConnection>,
    /// RPC outcomes kept across reconnects, keyed by user then
    /// request id. Insertion-ordered ids for cap eviction.
    outcomes: HashMap<String, (Vec<String>, HashMap<String, RequestStatus>)>,
    /// Accumulated process events per session, flushed on terminal.
    traces: HashMap<String, Vec<Value>>,
}

/// Shared control-channel state: connection registry, per-session
/// scratch traces, and handles to everything message handling needs.
pub struct ChannelHub {
    pub scheduler: Arc<Scheduler>,
    pub signer: TokenSigner,
    pub cipher: CredentialCipher,
    pub collaborators: Collaborators,
    pub events: Arc<EventBuffer>,
    pub relay: Arc<SseRelay>,
    pub config: GatewayConfig,
    state: RwLock<HubState>,
}

impl std::fmt::Debug for ChannelHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHub").finish_non_exhaustive()
    }
}

impl ChannelHub {
    pub fn new(
        scheduler: Arc<Scheduler>,
        signer: TokenSigner,
        cipher: CredentialCipher,
        collaborators: Collaborators,
        events: Arc<EventBuffer>,
        relay: Arc<SseRelay>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            scheduler,
            signer,
            cipher,
            collaborators,
            events,
            relay,
            config,
            state: RwLock::new(HubState::default()),
        }
    }

    /// Liveness signal consumed by the scheduler's `ensure`: a user is
    /// connected iff their instance holds an open, authenticated
    /// socket right now.
    pub async fn is_connected(&self, user_id: &str) -> bool {
        self.state.read().await.connections.contains_key(user_id)
    }

    /// Hand a run request to the user's live instance.
    pub async fn dispatch_execute(
        &self,
        user_id: &str,
        session_id: &str,
        message: Value,
    ) -> Result<(), GatewayError> {
        let sender = {
            let state = self.state.read().await;
            state
                .connections
                .get(user_id)
                .map(|conn| conn.outbound.clone())
        };
        let Some(sender) = sender else {
            return Err(GatewayError::InstanceUnavailable {
                user_id: user_id.to_string(),
                retry_after_ms: None,
            });
        };
        sender
            .send(GatewayMessage::Execute {
                session_id: session_id.to_string(),
                message,
            })
            .await
            .map_err(|_| GatewayError::InstanceUnavailable {
                user_id: user_id.to_string(),
                retry_after_ms: None,
            })
    }

    /// Validate the handshake credential. Tickets are single-use and
    /// resolved through the scheduler; tokens carry signed claims and
    /// must match the user the socket claims to be.
    pub async fn authenticate(
        &self,
        user_id: &str,
        message: &InstanceMessage,
    ) -> Result<ConnectionIdentity, GatewayError> {
        let InstanceMessage::Auth { ticket, token } = message else {
            return Err(GatewayError::TokenInvalid {
                message: Some("expected auth message".to_string()),
            });
        };

        if let Some(ticket) = ticket {
            let record = self.scheduler.consume_ticket(user_id, ticket).await?;
            return Ok(ConnectionIdentity {
                user_id: record.user_id,
                org_id: record.org_id,
                instance_id: Some(record.instance_id),
            });
        }

        if let Some(token) = token {
            let claims = self.signer.verify(token)?;
            if claims.user_id != user_id {
                return Err(GatewayError::TokenInvalid {
                    message: Some("token subject mismatch".to_string()),
                });
            }
            return Ok(ConnectionIdentity {
                user_id: claims.user_id,
                org_id: claims.org_id,
                instance_id: None,
            });
        }

        Err(GatewayError::TokenInvalid {
            message: Some("auth carried neither ticket nor token".to_string()),
        })
    }

    /// Build the one-time post-auth payload. Every provider secret is
    /// encrypted individually so a partial leak never exposes the rest.
    pub fn build_init(&self, identity: &ConnectionIdentity) -> Result<GatewayMessage, GatewayError> {
        let mut credentials = BTreeMap::new();
        for (provider, secret) in &self.config.provider_secrets {
            credentials.insert(provider.clone(), self.cipher.encrypt(secret)?);
        }
        Ok(GatewayMessage::Init {
            user_id: identity.user_id.clone(),
            org_id: identity.org_id.clone(),
            credentials,
            routing: self.config.routing.clone(),
        })
    }

    /// Attach a live connection for a user, replacing any previous one.
    /// The instance record follows the connection to ready; a token
    /// reconnect has no ticket left to consume, so this is where a
    /// disconnected record recovers.
    pub async fn register(
        &self,
        identity: &ConnectionIdentity,
        outbound: mpsc::Sender<GatewayMessage>,
    ) -> u64 {
        let connection_id = CONNECTION_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.write().await;
            state.connections.insert(
                identity.user_id.clone(),
                LiveConnection {
                    connection_id,
                    outbound,
                    last_heartbeat_ms: now_ms(),
                },
            );
        }
        self.scheduler
            .mark_connected(&identity.user_id, &identity.org_id)
            .await;
        connection_id
    }

    /// Last heartbeat for the user's live connection, if any.
    pub async fn last_heartbeat_ms(&self, user_id: &str) -> Option<i64> {
        self.state
            .read()
            .await
            .connections
            .get(user_id)
            .map(|conn| conn.last_heartbeat_ms)
    }

    /// Remove the connection only if it is still the registered one;
    /// a reconnect that replaced it must not be torn down by the old
    /// socket's cleanup.
    async fn unregister(&self, user_id: &str, connection_id: u64) -> bool {
        let mut state = self.state.write().await;
        match state.connections.get(user_id) {
            Some(conn) if conn.connection_id == connection_id => {
                state.connections.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Handle one authenticated inbound message. Returns the reply to
    /// send, if the message warrants one. Never errors: protocol
    /// failures become structured RPC errors or are logged and
    /// dropped, and the connection stays up.
    pub async fn handle_message(
        &self,
        identity: &ConnectionIdentity,
        message: InstanceMessage,
    ) -> Option<GatewayMessage> {
        match message {
            InstanceMessage::Request { id, call } => {
                let response = self.handle_rpc(identity, &id, call).await;
                self.cache_outcome(&identity.user_id, &response).await;
                Some(response)
            }
            InstanceMessage::FireAndForget { notice } => {
                self.handle_notice(identity, notice).await;
                None
            }
            InstanceMessage::Resume { ids } => {
                let statuses = self.resume_statuses(&identity.user_id, &ids).await;
                Some(GatewayMessage::ResumeResponse { statuses })
            }
            InstanceMessage::SseEvent {
                session_id,
                event_name,
                payload,
            } => {
                self.ingest_event(identity, &session_id, &event_name, payload)
                    .await;
                None
            }
            InstanceMessage::Heartbeat => {
                let mut state = self.state.write().await;
                if let Some(conn) = state.connections.get_mut(&identity.user_id) {
                    conn.last_heartbeat_ms = now_ms();
                }
                None
            }
            InstanceMessage::Auth { .. } => {
                tracing::debug!(user_id = %identity.user_id, "duplicate auth ignored");
                None
            }
            InstanceMessage::Ignored => None,
        }
    }

    async fn handle_rpc(
        &self,
        identity: &ConnectionIdentity,
        id: &str,
        call: RpcCall,
    ) -> GatewayMessage {
        let result = match call {
            RpcCall::MemorySearch { query, limit } => self
                .collaborators
                .memory
                .search(&identity.user_id, &query, limit.unwrap_or(8))
                .await
                .and_then(|hits| {
                    serde_json::to_value(hits).map_err(|err| GatewayError::StreamError {
                        message: format!("result serialization failed: {err}"),
                    })
                }),
            RpcCall::SkillLoad { skill_id } => self.load_skill(&skill_id).await,
            RpcCall::Unsupported => Err(GatewayError::InvalidRequest {
                message: "unsupported rpc method".to_string(),
            }),
        };

        match result {
            Ok(result) => GatewayMessage::Response {
                id: id.to_string(),
                result: Some(result),
                error: None,
            },
            Err(err) => {
                tracing::warn!(user_id = %identity.user_id, request_id = id, error = %err, "rpc failed");
                GatewayMessage::Response {
                    id: id.to_string(),
                    result: None,
                    error: Some(rpc_error(&err)),
                }
            }
        }
    }

    async fn load_skill(&self, skill_id: &str) -> Result<Value, GatewayError> {
        let dir = self
            .collaborators
            .skills
            .package_dir(skill_id)
            .await?
            .ok_or_else(|| GatewayError::InvalidRequest {
                message: format!("unknown skill: {skill_id}"),
            })?;
        let package = read_skill_package(skill_id, &dir).await?;
        serde_json::to_value(package).map_err(|err| GatewayError::StreamError {
            message: format!("result serialization failed: {err}"),
        })
    }

    async fn handle_notice(&self, identity: &ConnectionIdentity, notice: Notice) {
        let outcome = match notice {
            Notice::UsageReport {
                session_id,
                input_tokens,
                output_tokens,
                cost_usd,
                model,
            } => {
                self.collaborators
                    .usage
                    .record_usage(
                        &identity.user_id,
                        &identity.org_id,
                        &session_id,
                        input_tokens,
                        output_tokens,
                        cost_usd,
                        model.as_deref(),
                    )
                    .await
            }
            Notice::AuditLog { action, detail } => {
                self.collaborators
                    .audit
                    .record(&identity.user_id, &action, detail)
                    .await
            }
            Notice::SkillEvolved {
                session_id,
                name,
                instructions,
                metadata,
            } => {
                self.collaborators
                    .skills
                    .save_evolved(&identity.user_id, &session_id, &name, &instructions, metadata)
                    .await
            }
            Notice::Ignored => Ok(()),
        };
        // One-way by contract: the instance never learns of failures.
        if let Err(err) = outcome {
            tracing::warn!(user_id = %identity.user_id, error = %err, "notice handling failed");
        }
    }

    /// Buffer, fan out, and selectively persist one streamed event.
    async fn ingest_event(
        &self,
        identity: &ConnectionIdentity,
        session_id: &str,
        event_name: &str,
        payload: Value,
    ) {
        let event_id = self.events.push(session_id, event_name, payload.clone()).await;
        self.relay
            .forward(session_id, event_id, event_name, &payload)
            .await;

        match classify_event(event_name) {
            EventClass::Durable => {
                if let Err(err) = self
                    .collaborators
                    .messages
                    .append_message(session_id, event_name, payload, json!({}))
                    .await
                {
                    tracing::warn!(session_id, event_name, error = %err, "durable event persist failed");
                }
            }
            EventClass::Process => {
                let mut state = self.state.write().await;
                state
                    .traces
                    .entry(session_id.to_string())
                    .or_default()
                    .push(json!({ "event": event_name, "payload": payload }));
            }
            EventClass::Terminal => {
                self.finish_session(identity, session_id, event_name, payload)
                    .await;
            }
        }
    }

    /// Terminal event: flush the scratch trace and the final payload
    /// as a single stored message, drop the replay buffer, and close
    /// every live subscriber.
    async fn finish_session(
        &self,
        identity: &ConnectionIdentity,
        session_id: &str,
        event_name: &str,
        payload: Value,
    ) {
        let trace = {
            let mut state = self.state.write().await;
            state.traces.remove(session_id).unwrap_or_default()
        };
        if let Err(err) = self
            .collaborators
            .messages
            .append_message(
                session_id,
                event_name,
                payload,
                json!({ "trace": trace }),
            )
            .await
        {
            tracing::warn!(session_id, error = %err, "terminal flush failed");
        }
        self.relay.close_all(session_id).await;
        self.events.clear(session_id).await;
        tracing::info!(
            user_id = %identity.user_id,
            session_id,
            event_name,
            "execution stream finished"
        );
    }

    async fn cache_outcome(&self, user_id: &str, response: &GatewayMessage) {
        let GatewayMessage::Response { id, result, error } = response else {
            return;
        };
        let status = RequestStatus {
            id: id.clone(),
            state: if error.is_some() {
                RequestState::Failed
            } else {
                RequestState::Completed
            },
            result: result.clone(),
            error: error.clone(),
        };
        let mut state = self.state.write().await;
        let (order, outcomes) = state.outcomes.entry(user_id.to_string()).or_default();
        if outcomes.insert(id.clone(), status).is_none() {
            order.push(id.clone());
        }
        while order.len() > MAX_CACHED_OUTCOMES {
            let oldest = order.remove(0);
            outcomes.remove(&oldest);
        }
    }

    /// Fate of previously issued request ids. Ids the gateway no
    /// longer knows about are reported lost so the instance can retry.
    async fn resume_statuses(&self, user_id: &str, ids: &[String]) -> Vec<RequestStatus> {
        let state = self.state.read().await;
        let outcomes = state.outcomes.get(user_id);
        ids.iter()
            .map(|id| {
                outcomes
                    .and_then(|(_, map)| map.get(id).cloned())
                    .unwrap_or_else(|| RequestStatus {
                        id: id.clone(),
                        state: RequestState::Lost,
                        result: None,
                        error: None,
                    })
            })
            .collect()
    }
}

fn rpc_error(err: &GatewayError) -> RpcError {
    RpcError {
        code: err
            .error_type()
            .as_urn()
            .rsplit(':')
            .next()
            .unwrap_or("internal")
            .to_string(),
        message: err.to_string(),
    }
}

/// Drive one accepted websocket: handshake, init, then the message
/// loop until either side closes.
pub async fn serve_socket(hub: Arc<ChannelHub>, socket: WebSocket, user_id: String) {
    let (mut sink, mut stream) = socket.split();

    // Handshake: first frame must be auth, within the timeout.
    let auth = tokio::time::timeout(hub.config.handshake_timeout, stream.next()).await;
    let identity = match auth {
        Ok(Some(Ok(Message::Text(raw)))) => {
            let parsed = serde_json::from_str::<InstanceMessage>(&raw);
            match parsed {
                Ok(message) => match hub.authenticate(&user_id, &message).await {
                    Ok(identity) => identity,
                    Err(err) => {
                        tracing::info!(user_id, error = %err, "handshake rejected");
                        close_with_policy_violation(&mut sink, "authentication failed").await;
                        return;
                    }
                },
                Err(err) => {
                    tracing::info!(user_id, error = %err, "malformed handshake");
                    close_with_policy_violation(&mut sink, "malformed auth frame").await;
                    return;
                }
            }
        }
        Ok(_) => {
            close_with_policy_violation(&mut sink, "expected auth frame").await;
            return;
        }
        Err(_) => {
            tracing::info!(user_id, "handshake timed out");
            close_with_policy_violation(&mut sink, "handshake timeout").await;
            return;
        }
    };

    let init = match hub.build_init(&identity) {
        Ok(init) => init,
        Err(err) => {
            tracing::error!(user_id, error = %err, "init payload construction failed");
            close_with_policy_violation(&mut sink, "init unavailable").await;
            return;
        }
    };
    if send_message(&mut sink, &init).await.is_err() {
        return;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let connection_id = hub.register(&identity, outbound_tx).await;
    tracing::info!(
        user_id = %identity.user_id,
        org_id = %identity.org_id,
        instance_id = ?identity.instance_id,
        connection_id,
        "control channel established"
    );

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else { break };
                if send_message(&mut sink, &message).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(raw))) => {
                        // Malformed frames are logged and skipped; the
                        // connection survives.
                        let message = match serde_json::from_str::<InstanceMessage>(&raw) {
                            Ok(message) => message,
                            Err(err) => {
                                tracing::warn!(
                                    user_id = %identity.user_id,
                                    error = %err,
                                    "discarding malformed frame"
                                );
                                continue;
                            }
                        };
                        if let Some(reply) = hub.handle_message(&identity, message).await {
                            if send_message(&mut sink, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::info!(user_id = %identity.user_id, error = %err, "socket error");
                        break;
                    }
                }
            }
        }
    }

    if hub.unregister(&identity.user_id, connection_id).await {
        hub.scheduler
            .mark_disconnected(&identity.user_id, &identity.org_id)
            .await;
    }
    tracing::info!(user_id = %identity.user_id, connection_id, "control channel closed");
}

async fn send_message(
    sink: &mut (impl SinkExt<Message> + Unpin),
    message: &GatewayMessage,
) -> Result<(), ()> {
    let raw = serde_json::to_string(message).map_err(|_| ())?;
    sink.send(Message::Text(raw)).await.map_err(|_| ())
}

/// Reject a socket that never reached the handshake, e.g. one opened
/// without identifying itself.
pub async fn reject_socket(socket: WebSocket, reason: &str) {
    let (mut sink, _stream) = socket.split();
    close_with_policy_violation(&mut sink, reason).await;
}

async fn close_with_policy_violation(sink: &mut (impl SinkExt<Message> + Unpin), reason: &str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.to_string().into(),
        })))
        .await;
}
