use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::channel::ChannelHub;
use crate::collaborators::Collaborators;
use crate::config::{GatewayConfig, InstanceMode, SchedulerConfig};
use crate::crypto::{CredentialCipher, TokenSigner};
use crate::event_buffer::EventBuffer;
use crate::idempotency::{
    IdempotencyGate, IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore,
};
use crate::router::{build_router, AppState};
use crate::scheduler::{InMemoryInstanceStore, ProcessLauncher, Scheduler};
use crate::sse_relay::SseRelay;
use exec_gateway_wire::RoutingConfig;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8630;

#[derive(Parser, Debug)]
#[command(name = "exec-gateway", bin_name = "exec-gateway")]
#[command(about = "Control-plane gateway for per-user execution instances")]
#[command(version, arg_required_else_help = true)]
pub struct GatewayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Secret used to sign and verify bearer tokens.
    #[arg(long, env = "EXEC_GATEWAY_SIGNING_SECRET")]
    signing_secret: String,

    /// Secret from which the credential-encryption key is derived.
    #[arg(long, env = "EXEC_GATEWAY_CIPHER_SECRET")]
    cipher_secret: String,

    /// Provider secret as `provider=key`; repeatable.
    #[arg(long = "provider-secret", short = 'S')]
    provider_secrets: Vec<String>,

    /// Bootstrap command for new execution instances, e.g.
    /// "scripts/launch-vm.sh". Omitting it makes the scheduler purely
    /// reactive.
    #[arg(long, env = "EXEC_GATEWAY_BOOTSTRAP_COMMAND")]
    bootstrap_command: Option<String>,

    #[arg(long, default_value_t = 60)]
    bootstrap_cooldown_secs: u64,

    #[arg(long, default_value_t = 15)]
    provision_retry_cooldown_secs: u64,

    #[arg(long, default_value_t = 3)]
    max_bootstrap_attempts: u32,

    /// Default deployment backend: "container" or "vm".
    #[arg(long, default_value = "container")]
    default_mode: InstanceMode,

    /// Redis URL for the cross-replica idempotency store. Falls back
    /// to an in-process store when unset.
    #[arg(long, env = "EXEC_GATEWAY_REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, default_value_t = 100)]
    event_buffer_capacity: usize,

    #[arg(long, default_value_t = 300)]
    idempotency_ttl_secs: u64,

    #[arg(long)]
    default_model: Option<String>,

    #[arg(long)]
    fallback_model: Option<String>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid provider secret (expected provider=key): {0}")]
    InvalidProviderSecret(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_gateway() -> Result<(), CliError> {
    let cli = GatewayCli::parse();
    init_logging();
    match cli.command {
        Command::Server(args) => run_server(&args),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let config = gateway_config(args)?;
    let signer = TokenSigner::new(args.signing_secret.as_bytes().to_vec());
    let cipher = CredentialCipher::from_secret(&args.cipher_secret);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            Arc::new(InMemoryInstanceStore::default()),
            Arc::new(ProcessLauncher),
            signer.clone(),
        ));
        let hub = Arc::new(ChannelHub::new(
            scheduler,
            signer,
            cipher,
            Collaborators::in_memory(),
            Arc::new(EventBuffer::new(config.event_buffer_capacity)),
            Arc::new(SseRelay::new()),
            config.clone(),
        ));

        let store: Arc<dyn IdempotencyStore> = match &args.redis_url {
            Some(url) => {
                let store = RedisIdempotencyStore::connect(url)
                    .await
                    .map_err(|err| CliError::Server(err.to_string()))?;
                tracing::info!("idempotency store backed by redis");
                Arc::new(store)
            }
            None => {
                tracing::info!("idempotency store is in-process; duplicates across replicas are not caught");
                Arc::new(InMemoryIdempotencyStore::default())
            }
        };
        let gate = IdempotencyGate {
            store,
            ttl: config.idempotency_ttl,
        };

        let mut router = build_router(AppState { hub, gate });
        router = router.layer(build_cors_layer(args)?);

        let addr = format!("{}:{}", args.host, args.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "gateway listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn gateway_config(args: &ServerArgs) -> Result<GatewayConfig, CliError> {
    let mut provider_secrets = BTreeMap::new();
    for entry in &args.provider_secrets {
        let (provider, secret) = entry
            .split_once('=')
            .ok_or_else(|| CliError::InvalidProviderSecret(entry.clone()))?;
        provider_secrets.insert(provider.to_string(), secret.to_string());
    }

    let bootstrap_command = args.bootstrap_command.as_ref().map(|raw| {
        raw.split_whitespace()
            .map(str::to_string)
            .collect::<Vec<_>>()
    });

    Ok(GatewayConfig {
        scheduler: SchedulerConfig {
            bootstrap_command,
            bootstrap_cooldown: Duration::from_secs(args.bootstrap_cooldown_secs),
            provision_retry_cooldown: Duration::from_secs(args.provision_retry_cooldown_secs),
            max_bootstrap_attempts: args.max_bootstrap_attempts,
            bootstrap_token_ttl: Duration::from_secs(600),
            default_mode: args.default_mode,
        },
        handshake_timeout: Duration::from_secs(10),
        event_buffer_capacity: args.event_buffer_capacity,
        idempotency_ttl: Duration::from_secs(args.idempotency_ttl_secs),
        provider_secrets,
        routing: RoutingConfig {
            default_model: args.default_model.clone(),
            fallback_model: args.fallback_model.clone(),
            provider_base_urls: BTreeMap::new(),
        },
    })
}

fn build_cors_layer(args: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();
    let mut origins: Vec<axum::http::HeaderValue> = Vec::new();
    for origin in &args.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }
    cors = cors.allow_methods(Any).allow_headers(Any);
    Ok(cors)
}
