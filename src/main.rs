use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rlaas::clock::{Clock, SystemClock};
use rlaas::config::{RlaasConfig, RuleBackend, StoreBackend};
use rlaas::grpc::GrpcServer;
use rlaas::ratelimit::DecisionEngine;
use rlaas::rules::{MemoryRuleTable, RuleResolver, RuleTable, SeedFile, SqliteRuleTable};
use rlaas::store::{CounterStore, MemoryCounterStore, RedisCounterStore};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Rate limiting as a service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML configuration file; RLAAS_* environment variables override it
    #[arg(short, long)]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting rlaas");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = RlaasConfig::load(args.config.as_deref()).context("loading configuration")?;
    info!(
        grpc_addr = %config.server.grpc_addr,
        store = ?config.store.backend,
        rules = ?config.rules.backend,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(
            RedisCounterStore::connect_with_retry(&config.store)
                .await
                .context("connecting to the counter store")?,
        ),
        StoreBackend::Memory => Arc::new(MemoryCounterStore::with_clock(clock.clone())),
    };

    let table: Arc<dyn RuleTable> = match config.rules.backend {
        RuleBackend::Sqlite => Arc::new(
            SqliteRuleTable::open(&config.rules.database_path)
                .context("opening the rule table")?,
        ),
        RuleBackend::Memory => Arc::new(MemoryRuleTable::new()),
    };

    let resolver = Arc::new(RuleResolver::from_config(table, clock.clone(), &config.rules));
    if config.rules.seed_defaults {
        resolver
            .seed_default_rules()
            .await
            .context("seeding default rules")?;
    }
    if let Some(path) = &config.rules.seed_file {
        let seed = SeedFile::from_file(path).context("reading seed file")?;
        resolver
            .seed_rules(seed.rules)
            .await
            .context("seeding rules from file")?;
    }

    let engine = Arc::new(
        DecisionEngine::new(resolver, store, clock)
            .with_bucket_ttl(Duration::from_secs(config.store.bucket_ttl_secs)),
    );

    // Run the server with graceful shutdown on Ctrl+C
    GrpcServer::new(&config.server, engine)
        .run(shutdown_signal())
        .await?;

    info!("rlaas stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
