//! Application entry point.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::SecretString;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ledger_anchor::app::{ServiceRegistry, ServiceSettings, WorkerConfig, spawn_worker};
use ledger_anchor::infra::{PostgresConfig, PostgresLedgerStore, RpcClientConfig};

/// Application configuration
struct AppConfig {
    database_url: String,
    /// Key for signing anchored payloads (optional)
    hmac_secret: Option<SecretString>,
    worker_config: WorkerConfig,
    max_in_flight: usize,
    rpc_timeout: Duration,
    json_logs: bool,
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", name, raw)),
        _ => Ok(default),
    }
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let hmac_secret = env::var("HMAC_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);

        let defaults = WorkerConfig::default();
        let worker_config = WorkerConfig {
            enabled: env_flag("WORKER_ENABLED", true),
            poll_interval: Duration::from_secs(env_parse(
                "WORKER_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            batch_limit: env_parse("WORKER_BATCH_LIMIT", defaults.batch_limit)?,
            stale_claim_after: Duration::from_secs(env_parse(
                "WORKER_STALE_CLAIM_SECS",
                defaults.stale_claim_after.as_secs(),
            )?),
        };

        let settings = ServiceSettings::default();
        let max_in_flight = env_parse("MAX_IN_FLIGHT", settings.max_in_flight)?;
        let rpc_timeout = Duration::from_secs(env_parse(
            "RPC_TIMEOUT_SECS",
            settings.call_timeout.as_secs(),
        )?);

        let json_logs = env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

        Ok(Self {
            database_url,
            hmac_secret,
            worker_config,
            max_in_flight,
            rpc_timeout,
            json_logs,
        })
    }
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = ?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = AppConfig::from_env()?;
    init_tracing(config.json_logs);

    info!("Ledger anchor v{}", env!("CARGO_PKG_VERSION"));

    let store = PostgresLedgerStore::new(&config.database_url, PostgresConfig::default())
        .await
        .context("Failed to connect to database")?;
    store
        .run_migrations()
        .await
        .context("Failed to apply migrations")?;
    info!("Database connected and migrations applied");

    if config.hmac_secret.is_some() {
        info!("Payload signing enabled");
    } else {
        info!("Payload signing disabled (HMAC_SECRET not set)");
    }

    let settings = ServiceSettings {
        max_in_flight: config.max_in_flight,
        call_timeout: config.rpc_timeout,
        signing_secret: config.hmac_secret.map(Arc::new),
    };
    let rpc_config = RpcClientConfig {
        timeout: config.rpc_timeout,
        ..RpcClientConfig::default()
    };
    let registry = ServiceRegistry::new(Arc::new(store), settings, rpc_config);

    let services = registry
        .active_services()
        .await
        .context("Failed to load ledger configurations")?;
    info!(organizations = services.len(), "Ledger services ready");

    let mut workers = Vec::new();
    if config.worker_config.enabled {
        for service in services {
            workers.push(spawn_worker(service, config.worker_config.clone()));
        }
        info!(count = workers.len(), "Anchor workers started");
    } else {
        info!("Anchor workers disabled");
    }

    shutdown_signal().await;

    for (_, shutdown_tx) in &workers {
        let _ = shutdown_tx.send(true);
    }
    for (handle, _) in workers {
        if let Err(e) = handle.await {
            warn!(error = ?e, "Anchor worker ended abnormally");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
