//! Experiment engine server.
//!
//! Loads configuration, wires the storage and audit collaborators into the
//! engine and serves the operation allow-list over HTTP.

mod routes;

use clap::Parser;
use experiment_analytics::AuditLogger;
use experiment_core::config::{AppConfig, StoreBackend};
use experiment_core::event_bus::{noop_sink, AuditSink};
use experiment_core::ExperimentStore;
use experiment_engine::ExperimentEngine;
use experiment_store::{MemoryStore, RedisStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "experiment-server")]
#[command(about = "Adaptive experimentation engine: bandit assignment and Bayesian reporting")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "EXPERIMENT_ENGINE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "EXPERIMENT_ENGINE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "EXPERIMENT_ENGINE__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Use the in-memory store regardless of configuration
    #[arg(long, default_value_t = false)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "experiment_server=info,experiment_engine=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Experiment server starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }
    if cli.memory_store {
        config.store.backend = StoreBackend::Memory;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        store = ?config.store.backend,
        audit = config.clickhouse.enabled,
        "Configuration loaded"
    );

    let store: Arc<dyn ExperimentStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => Arc::new(RedisStore::new(&config.store.redis).await?),
    };

    let audit: Arc<dyn AuditSink> = if config.clickhouse.enabled {
        match AuditLogger::new(&config.clickhouse, config.node_id.clone()).await {
            Ok(logger) => Arc::new(logger),
            Err(e) => {
                error!(error = %e, "Failed to connect to ClickHouse, audit events disabled");
                noop_sink()
            }
        }
    } else {
        noop_sink()
    };

    let engine = Arc::new(ExperimentEngine::new(store, audit, config.engine.clone()));

    if let Err(e) = start_metrics(&config) {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let state = routes::AppState {
        engine,
        node_id: config.node_id.clone(),
        start_time: Instant::now(),
    };
    let app = routes::router(state);

    let addr = SocketAddr::new(config.api.host.parse()?, config.api.http_port);
    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Serve Prometheus metrics on a dedicated port.
fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::new(config.api.host.parse()?, config.metrics.port))
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}
