use std::collections::BTreeMap;
use std::time::Duration;

use exec_gateway_wire::RoutingConfig;

/// Scheduler knobs. Cooldowns gate how aggressively `ensure` retries
/// a bootstrap for the same instance record.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Command spawned to bootstrap an execution instance, split into
    /// program + args. `None` makes the scheduler purely reactive.
    pub bootstrap_command: Option<Vec<String>>,
    /// Minimum wait after a bootstrap before retrying a
    /// disconnected or stale-ready instance.
    pub bootstrap_cooldown: Duration,
    /// Shorter retry window while a bootstrap is still provisioning.
    pub provision_retry_cooldown: Duration,
    pub max_bootstrap_attempts: u32,
    /// Lifetime of the signed bearer token handed to the spawned
    /// bootstrap process.
    pub bootstrap_token_ttl: Duration,
    /// Deployment backend used when a user has no override.
    pub default_mode: InstanceMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bootstrap_command: None,
            bootstrap_cooldown: Duration::from_secs(60),
            provision_retry_cooldown: Duration::from_secs(15),
            max_bootstrap_attempts: 3,
            bootstrap_token_ttl: Duration::from_secs(600),
            default_mode: InstanceMode::Container,
        }
    }
}

/// Deployment backend for an execution instance. Resolved once at
/// record creation and immutable for the record's lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum InstanceMode {
    Container,
    Vm,
}

impl InstanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Vm => "vm",
        }
    }
}

impl std::str::FromStr for InstanceMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "container" => Ok(Self::Container),
            "vm" => Ok(Self::Vm),
            other => Err(format!("unknown instance mode: {other}")),
        }
    }
}

/// Top-level gateway configuration assembled by the CLI.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub scheduler: SchedulerConfig,
    /// How long an accepted socket may sit unauthenticated before it
    /// is forcibly closed.
    pub handshake_timeout: Duration,
    pub event_buffer_capacity: usize,
    pub idempotency_ttl: Duration,
    /// Plaintext provider secrets held by the control plane; each is
    /// individually encrypted before crossing the control channel.
    pub provider_secrets: BTreeMap<String, String>,
    pub routing: RoutingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            event_buffer_capacity: 100,
            idempotency_ttl: Duration::from_secs(300),
            provider_secrets: BTreeMap::new(),
            routing: RoutingConfig::default(),
        }
    }
}
