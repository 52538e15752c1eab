//! VM lifecycle scheduler.
//!
//! Owns the durable record describing each user's execution instance,
//! issues single-use connect tickets, and fire-and-forgets the
//! bootstrap process. Spawn failures are not synchronously observable;
//! the next `ensure` call (driven by client polling) notices that the
//! instance never connected and retries until attempts are exhausted.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use utoipa::ToSchema;

use exec_gateway_error::GatewayError;

use crate::config::{InstanceMode, SchedulerConfig};
use crate::crypto::{mint_ticket, TokenSigner};

static INSTANCE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Provisioning,
    Ready,
    Disconnected,
    /// Terminal. Excluded from active lookups; recovery requires a
    /// forced rebootstrap, which supersedes the record.
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }
}

/// Durable record for one (user, org) execution instance. At most one
/// non-terminal record exists per pair; failed records are retained
/// and superseded, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub user_id: String,
    pub org_id: String,
    pub mode: InstanceMode,
    pub status: InstanceStatus,
    pub connect_ticket: Option<String>,
    pub ticket_used_at: Option<i64>,
    pub last_bootstrap_at: Option<i64>,
    pub bootstrap_attempts: u32,
    pub bootstrap_last_error: Option<String>,
    pub created_at: i64,
}

/// Store for instance records. Last-write-wins updates are acceptable:
/// a duplicate spawn caused by two racing `ensure` calls is a tolerated
/// inefficiency, not a correctness violation.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// The single non-terminal record for the pair, if any.
    async fn active_record(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<Option<InstanceRecord>, GatewayError>;

    /// Active record looked up by user alone. The control-channel
    /// handshake only learns the org after the record is found.
    async fn active_record_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<InstanceRecord>, GatewayError>;

    /// The most recent record for the pair, terminal or not. A failed
    /// record must stay visible to `ensure` and the status endpoint
    /// until a forced rebootstrap supersedes it.
    async fn latest_record(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<Option<InstanceRecord>, GatewayError>;

    async fn upsert(&self, record: InstanceRecord) -> Result<(), GatewayError>;
}

#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    records: RwLock<Vec<InstanceRecord>>,
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn active_record(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<Option<InstanceRecord>, GatewayError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .find(|record| {
                record.user_id == user_id
                    && record.org_id == org_id
                    && !record.status.is_terminal()
            })
            .cloned())
    }

    async fn active_record_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<InstanceRecord>, GatewayError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .find(|record| record.user_id == user_id && !record.status.is_terminal())
            .cloned())
    }

    async fn latest_record(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<Option<InstanceRecord>, GatewayError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .find(|record| record.user_id == user_id && record.org_id == org_id)
            .cloned())
    }

    async fn upsert(&self, record: InstanceRecord) -> Result<(), GatewayError> {
        let mut records = self.records.write().await;
        match records
            .iter_mut()
            .find(|existing| existing.instance_id == record.instance_id)
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }
}

/// Fire-and-forget process spawning, abstracted so tests can record
/// spawns instead of touching the process table.
pub trait Launcher: Send + Sync {
    fn spawn(&self, command: &[String], env: &[(String, String)]) -> Result<(), GatewayError>;
}

/// Spawns the bootstrap command detached: no parent wait, stdio
/// nulled, survives gateway exit.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn spawn(&self, command: &[String], env: &[(String, String)]) -> Result<(), GatewayError> {
        let (program, args) = command.split_first().ok_or(GatewayError::InvalidRequest {
            message: "empty bootstrap command".to_string(),
        })?;
        let mut cmd = std::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in env {
            cmd.env(key, value);
        }
        let child = cmd.spawn().map_err(|err| GatewayError::StreamError {
            message: format!("bootstrap spawn failed: {err}"),
        })?;
        drop(child);
        Ok(())
    }
}

/// Records spawn requests for assertions. Test-side stand-in for
/// [`ProcessLauncher`].
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    pub spawns: std::sync::Mutex<Vec<(Vec<String>, Vec<(String, String)>)>>,
}

impl RecordingLauncher {
    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().map(|spawns| spawns.len()).unwrap_or(0)
    }
}

impl Launcher for RecordingLauncher {
    fn spawn(&self, command: &[String], env: &[(String, String)]) -> Result<(), GatewayError> {
        if let Ok(mut spawns) = self.spawns.lock() {
            spawns.push((command.to_vec(), env.to_vec()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnsureResult {
    pub ready: bool,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatusView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub status: Option<InstanceStatus>,
    pub bootstrap_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn InstanceStore>,
    launcher: Arc<dyn Launcher>,
    signer: TokenSigner,
    mode_overrides: RwLock<HashMap<String, InstanceMode>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn InstanceStore>,
        launcher: Arc<dyn Launcher>,
        signer: TokenSigner,
    ) -> Self {
        Self {
            config,
            store,
            launcher,
            signer,
            mode_overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Per-user deployment backend override; org default otherwise.
    pub async fn set_mode_override(&self, user_id: &str, mode: InstanceMode) {
        self.mode_overrides
            .write()
            .await
            .insert(user_id.to_string(), mode);
    }

    /// Make sure an execution instance exists (and is moving toward
    /// readiness) for the pair. `ws_ready` is the caller's liveness
    /// signal, derived from the control-channel connection registry.
    pub async fn ensure(
        &self,
        user_id: &str,
        org_id: &str,
        ws_ready: bool,
    ) -> Result<EnsureResult, GatewayError> {
        let record = self.store.latest_record(user_id, org_id).await?;

        let mut record = match record {
            // Exhaustion is terminal: no spawn until an operator
            // forces a rebootstrap.
            Some(record) if record.status == InstanceStatus::Failed => {
                return Ok(EnsureResult {
                    ready: false,
                    status: InstanceStatus::Failed,
                    instance_id: Some(record.instance_id),
                    retry_after_ms: None,
                });
            }
            Some(record) => record,
            None => {
                let record = self.create_record(user_id, org_id).await?;
                if !ws_ready && self.config.bootstrap_command.is_some() {
                    return self.bootstrap(record, false).await;
                }
                record
            }
        };

        // Fast path: instance already connected.
        if ws_ready
            && matches!(
                record.status,
                InstanceStatus::Ready | InstanceStatus::Starting
            )
        {
            if record.status != InstanceStatus::Ready {
                record.status = InstanceStatus::Ready;
                self.store.upsert(record.clone()).await?;
            }
            return Ok(EnsureResult {
                ready: true,
                status: InstanceStatus::Ready,
                instance_id: Some(record.instance_id),
                retry_after_ms: None,
            });
        }

        // A "ready" record with no matching live connection is stale
        // and treated like a disconnect.
        let needs_bootstrap = !ws_ready
            && matches!(
                record.status,
                InstanceStatus::Starting
                    | InstanceStatus::Provisioning
                    | InstanceStatus::Disconnected
                    | InstanceStatus::Ready
            );

        if needs_bootstrap && self.config.bootstrap_command.is_some() {
            if let Some(remaining) = self.cooldown_remaining_ms(&record) {
                return Ok(EnsureResult {
                    ready: false,
                    status: record.status,
                    instance_id: Some(record.instance_id),
                    retry_after_ms: Some(remaining),
                });
            }
            return self.bootstrap(record, false).await;
        }

        // No bootstrap command configured: purely reactive.
        Ok(EnsureResult {
            ready: record.status == InstanceStatus::Ready && ws_ready,
            status: record.status,
            instance_id: Some(record.instance_id),
            retry_after_ms: None,
        })
    }

    /// Operator-triggered recovery: bypasses cooldowns and attempt
    /// limits. A failed record is superseded by a fresh one.
    pub async fn force_rebootstrap(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<EnsureResult, GatewayError> {
        let record = match self.store.latest_record(user_id, org_id).await? {
            Some(record) if record.status != InstanceStatus::Failed => record,
            _ => self.create_record(user_id, org_id).await?,
        };
        self.bootstrap(record, true).await
    }

    /// Read-only projection for the status-polling endpoint.
    pub async fn get_status(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<InstanceStatusView, GatewayError> {
        let Some(record) = self.store.latest_record(user_id, org_id).await? else {
            return Ok(InstanceStatusView {
                instance_id: None,
                status: None,
                bootstrap_attempts: 0,
                last_error: None,
                retry_after_ms: None,
            });
        };
        let retry_after_ms = self.cooldown_remaining_ms(&record);
        Ok(InstanceStatusView {
            instance_id: Some(record.instance_id),
            status: Some(record.status),
            bootstrap_attempts: record.bootstrap_attempts,
            last_error: record.bootstrap_last_error,
            retry_after_ms,
        })
    }

    /// Authenticate a connect ticket: must match the active record and
    /// be unused. Marks it used and transitions the record to ready.
    pub async fn consume_ticket(
        &self,
        user_id: &str,
        ticket: &str,
    ) -> Result<InstanceRecord, GatewayError> {
        let mut record = self
            .store
            .active_record_for_user(user_id)
            .await?
            .ok_or(GatewayError::TicketInvalid {
                message: Some("no active instance".to_string()),
            })?;

        if record.ticket_used_at.is_some() || record.connect_ticket.as_deref() != Some(ticket) {
            return Err(GatewayError::TicketInvalid {
                message: Some("ticket unknown or already used".to_string()),
            });
        }

        record.ticket_used_at = Some(now_ms());
        record.status = InstanceStatus::Ready;
        self.store.upsert(record.clone()).await?;
        tracing::info!(
            user_id,
            instance_id = %record.instance_id,
            "connect ticket consumed, instance ready"
        );
        Ok(record)
    }

    /// The control channel reports an authenticated connection. Moves
    /// a disconnected or provisioning record back to ready; token
    /// reconnects never pass through `consume_ticket`, so this is the
    /// only path that revives the record for them.
    pub async fn mark_connected(&self, user_id: &str, org_id: &str) {
        let Ok(Some(mut record)) = self.store.active_record(user_id, org_id).await else {
            return;
        };
        if record.status != InstanceStatus::Ready {
            record.status = InstanceStatus::Ready;
            let instance_id = record.instance_id.clone();
            if let Err(err) = self.store.upsert(record).await {
                tracing::warn!(user_id, error = %err, "failed to persist reconnect");
            } else {
                tracing::info!(user_id, instance_id = %instance_id, "instance reconnected");
            }
        }
    }

    /// The control channel reports an instance connection dropped.
    pub async fn mark_disconnected(&self, user_id: &str, org_id: &str) {
        let Ok(Some(mut record)) = self.store.active_record(user_id, org_id).await else {
            return;
        };
        if record.status == InstanceStatus::Ready {
            record.status = InstanceStatus::Disconnected;
            if let Err(err) = self.store.upsert(record).await {
                tracing::warn!(user_id, error = %err, "failed to persist disconnect");
            }
        }
    }

    async fn create_record(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<InstanceRecord, GatewayError> {
        let mode = {
            let overrides = self.mode_overrides.read().await;
            overrides
                .get(user_id)
                .copied()
                .unwrap_or(self.config.default_mode)
        };
        let record = InstanceRecord {
            instance_id: format!("vm-{}", INSTANCE_ID_COUNTER.fetch_add(1, Ordering::SeqCst)),
            user_id: user_id.to_string(),
            org_id: org_id.to_string(),
            mode,
            status: InstanceStatus::Starting,
            connect_ticket: None,
            ticket_used_at: None,
            last_bootstrap_at: None,
            bootstrap_attempts: 0,
            bootstrap_last_error: None,
            created_at: now_ms(),
        };
        self.store.upsert(record.clone()).await?;
        tracing::info!(
            user_id,
            org_id,
            instance_id = %record.instance_id,
            mode = record.mode.as_str(),
            "created instance record"
        );
        Ok(record)
    }

    fn cooldown_remaining_ms(&self, record: &InstanceRecord) -> Option<u64> {
        let last = record.last_bootstrap_at?;
        let cooldown = match record.status {
            InstanceStatus::Provisioning => self.config.provision_retry_cooldown,
            InstanceStatus::Disconnected | InstanceStatus::Ready => self.config.bootstrap_cooldown,
            _ => return None,
        };
        let elapsed = now_ms().saturating_sub(last);
        let cooldown_ms = cooldown.as_millis() as i64;
        if elapsed < cooldown_ms {
            Some((cooldown_ms - elapsed) as u64)
        } else {
            None
        }
    }

    async fn bootstrap(
        &self,
        mut record: InstanceRecord,
        forced: bool,
    ) -> Result<EnsureResult, GatewayError> {
        let Some(command) = self.config.bootstrap_command.clone() else {
            return Ok(EnsureResult {
                ready: false,
                status: record.status,
                instance_id: Some(record.instance_id),
                retry_after_ms: None,
            });
        };

        if !forced && record.bootstrap_attempts >= self.config.max_bootstrap_attempts {
            record.status = InstanceStatus::Failed;
            record.bootstrap_last_error = Some(format!(
                "bootstrap attempts exhausted ({})",
                record.bootstrap_attempts
            ));
            self.store.upsert(record.clone()).await?;
            tracing::warn!(
                user_id = %record.user_id,
                instance_id = %record.instance_id,
                attempts = record.bootstrap_attempts,
                "instance marked failed"
            );
            return Ok(EnsureResult {
                ready: false,
                status: InstanceStatus::Failed,
                instance_id: Some(record.instance_id),
                retry_after_ms: None,
            });
        }

        // Reuse an unused ticket; mint otherwise.
        let ticket = match (&record.connect_ticket, record.ticket_used_at) {
            (Some(ticket), None) => ticket.clone(),
            _ => {
                let ticket = mint_ticket();
                record.connect_ticket = Some(ticket.clone());
                record.ticket_used_at = None;
                ticket
            }
        };

        let token = self.signer.issue(
            &record.user_id,
            &record.org_id,
            self.config.bootstrap_token_ttl,
        )?;

        record.bootstrap_attempts += 1;
        record.last_bootstrap_at = Some(now_ms());
        record.status = InstanceStatus::Provisioning;
        self.store.upsert(record.clone()).await?;

        let env = vec![
            ("VM_USER_ID".to_string(), record.user_id.clone()),
            ("VM_ORG_ID".to_string(), record.org_id.clone()),
            ("VM_INSTANCE_ID".to_string(), record.instance_id.clone()),
            ("VM_MODE".to_string(), record.mode.as_str().to_string()),
            ("VM_CONNECT_TICKET".to_string(), ticket),
            ("VM_GATEWAY_TOKEN".to_string(), token),
        ];

        if let Err(err) = self.launcher.spawn(&command, &env) {
            // Not fatal: the polling cycle retries and eventually
            // exhausts attempts.
            tracing::warn!(
                user_id = %record.user_id,
                instance_id = %record.instance_id,
                error = %err,
                "bootstrap spawn failed"
            );
            let mut failed = record.clone();
            failed.bootstrap_last_error = Some(err.to_string());
            self.store.upsert(failed).await?;
        } else {
            tracing::info!(
                user_id = %record.user_id,
                instance_id = %record.instance_id,
                attempt = record.bootstrap_attempts,
                "bootstrap spawned"
            );
        }

        Ok(EnsureResult {
            ready: false,
            status: InstanceStatus::Provisioning,
            instance_id: Some(record.instance_id),
            retry_after_ms: None,
        })
    }
}

pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_scheduler(
        config: SchedulerConfig,
    ) -> (Scheduler, Arc<InMemoryInstanceStore>, Arc<RecordingLauncher>) {
        let store = Arc::new(InMemoryInstanceStore::default());
        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = Scheduler::new(
            config,
            store.clone(),
            launcher.clone(),
            TokenSigner::new(b"test-secret".to_vec()),
        );
        (scheduler, store, launcher)
    }

    fn bootstrap_config() -> SchedulerConfig {
        SchedulerConfig {
            bootstrap_command: Some(vec!["true".to_string()]),
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn ensure_spawns_once_within_cooldown() {
        let (scheduler, _store, launcher) = test_scheduler(bootstrap_config());

        let first = scheduler.ensure("u1", "o1", false).await.unwrap();
        assert!(!first.ready);
        assert_eq!(first.status, InstanceStatus::Provisioning);
        assert_eq!(launcher.spawn_count(), 1);

        let second = scheduler.ensure("u1", "o1", false).await.unwrap();
        assert_eq!(second.status, InstanceStatus::Provisioning);
        assert!(second.retry_after_ms.unwrap() > 0);
        assert_eq!(launcher.spawn_count(), 1);
    }

    #[tokio::test]
    async fn bootstrap_env_carries_identity_and_credentials() {
        let (scheduler, store, launcher) = test_scheduler(bootstrap_config());
        scheduler.ensure("u1", "o1", false).await.unwrap();

        let spawns = launcher.spawns.lock().unwrap();
        let (command, env) = &spawns[0];
        assert_eq!(command, &vec!["true".to_string()]);

        let lookup = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(lookup("VM_USER_ID"), "u1");
        assert_eq!(lookup("VM_ORG_ID"), "o1");
        assert_eq!(lookup("VM_MODE"), "container");
        assert!(lookup("VM_INSTANCE_ID").starts_with("vm-"));
        assert!(!lookup("VM_CONNECT_TICKET").is_empty());

        // Token must verify against the scheduler's signer.
        let signer = TokenSigner::new(b"test-secret".to_vec());
        let claims = signer.verify(&lookup("VM_GATEWAY_TOKEN")).unwrap();
        assert_eq!(claims.user_id, "u1");
        assert_eq!(claims.org_id, "o1");

        let record = store.active_record("u1", "o1").await.unwrap().unwrap();
        assert_eq!(record.connect_ticket.as_deref(), Some(lookup("VM_CONNECT_TICKET").as_str()));
    }

    #[tokio::test]
    async fn ensure_with_live_connection_is_ready() {
        let (scheduler, _store, launcher) = test_scheduler(bootstrap_config());
        let result = scheduler.ensure("u1", "o1", true).await.unwrap();
        assert!(result.ready);
        assert_eq!(result.status, InstanceStatus::Ready);
        assert_eq!(launcher.spawn_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_until_forced() {
        let config = SchedulerConfig {
            bootstrap_command: Some(vec!["true".to_string()]),
            provision_retry_cooldown: std::time::Duration::ZERO,
            max_bootstrap_attempts: 2,
            ..SchedulerConfig::default()
        };
        let (scheduler, _store, launcher) = test_scheduler(config);

        scheduler.ensure("u1", "o1", false).await.unwrap();
        scheduler.ensure("u1", "o1", false).await.unwrap();
        let third = scheduler.ensure("u1", "o1", false).await.unwrap();
        assert_eq!(third.status, InstanceStatus::Failed);
        assert_eq!(launcher.spawn_count(), 2);

        // Failed is terminal: further ensures return it unchanged and
        // never spawn.
        let fourth = scheduler.ensure("u1", "o1", false).await.unwrap();
        assert!(!fourth.ready);
        assert_eq!(fourth.status, InstanceStatus::Failed);
        assert_eq!(fourth.instance_id, third.instance_id);
        assert_eq!(launcher.spawn_count(), 2);

        // The status endpoint keeps reporting the failure.
        let status = scheduler.get_status("u1", "o1").await.unwrap();
        assert_eq!(status.status, Some(InstanceStatus::Failed));
        assert!(status.last_error.unwrap().contains("exhausted"));

        // Forced rebootstrap supersedes with a fresh record.
        let forced = scheduler.force_rebootstrap("u1", "o1").await.unwrap();
        assert_eq!(forced.status, InstanceStatus::Provisioning);
        assert_eq!(launcher.spawn_count(), 3);
        assert_ne!(forced.instance_id, third.instance_id);
    }

    #[tokio::test]
    async fn connect_ticket_is_single_use() {
        let (scheduler, store, _launcher) = test_scheduler(bootstrap_config());
        scheduler.ensure("u1", "o1", false).await.unwrap();

        let record = store.active_record("u1", "o1").await.unwrap().unwrap();
        let ticket = record.connect_ticket.clone().unwrap();

        let consumed = scheduler.consume_ticket("u1", &ticket).await.unwrap();
        assert_eq!(consumed.status, InstanceStatus::Ready);
        assert!(scheduler.consume_ticket("u1", &ticket).await.is_err());
        assert!(scheduler.consume_ticket("u1", "bogus").await.is_err());
    }

    #[tokio::test]
    async fn disconnect_marks_record_for_rebootstrap() {
        let (scheduler, store, _launcher) = test_scheduler(bootstrap_config());
        scheduler.ensure("u1", "o1", false).await.unwrap();
        let record = store.active_record("u1", "o1").await.unwrap().unwrap();
        let ticket = record.connect_ticket.clone().unwrap();
        scheduler.consume_ticket("u1", &ticket).await.unwrap();

        scheduler.mark_disconnected("u1", "o1").await;
        let record = store.active_record("u1", "o1").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Disconnected);
    }
}
