//! Scriptcast - Real-time script session gateway

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use scriptcast::assignment::AssignmentService;
use scriptcast::authz::HttpAuthorizer;
use scriptcast::broker::Broker;
use scriptcast::config::Config;
use scriptcast::gateway::Gateway;
use scriptcast::multiplexer::Multiplexer;
use scriptcast::presence::PresenceStore;
use scriptcast::server::{self, AppState};
use scriptcast::store::SessionStore;

#[cfg(feature = "postgres")]
use scriptcast::{PostgresBroker, PostgresStore};

#[cfg(feature = "memory")]
use scriptcast::{MemoryBroker, MemoryStore};

#[derive(Parser, Debug)]
#[command(name = "scriptcast")]
#[command(about = "Real-time script session gateway")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[cfg(feature = "memory")]
async fn init_backends(config: &Config) -> anyhow::Result<(Arc<dyn SessionStore>, Arc<dyn Broker>)> {
    if config.worker_nodes.is_empty() {
        anyhow::bail!("WORKER_NODES must register at least one node for the memory backend");
    }
    info!(nodes = config.worker_nodes.len(), "Memory backends initialized (single-node only)");
    Ok((
        Arc::new(MemoryStore::from_pairs(&config.worker_nodes)),
        Arc::new(MemoryBroker::new()),
    ))
}

#[cfg(all(not(feature = "memory"), feature = "postgres"))]
async fn init_backends(config: &Config) -> anyhow::Result<(Arc<dyn SessionStore>, Arc<dyn Broker>)> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for the postgres backend"))?;

    let store = PostgresStore::new(database_url).await?;
    info!("PostgreSQL session store connected");
    Ok((Arc::new(store), Arc::new(PostgresBroker::new())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .init();

    info!("Scriptcast v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            error!("Required env vars: INTERNAL_SERVICE (plus WORKER_NODES or DATABASE_URL)");
            std::process::exit(1);
        }
    };

    let (store, broker) = init_backends(&config).await?;

    let authorizer = Arc::new(HttpAuthorizer::new(&config.authz_url, config.upstream_timeout)?);
    info!(authz = %config.authz_url, "Authorization client ready");

    let gateway = Arc::new(Gateway {
        assignment: Arc::new(AssignmentService::new(store)),
        multiplexer: Arc::new(Multiplexer::new(
            broker,
            config.subscription_threshold,
            config.receive_buffer,
        )),
        authorizer,
        presence: Arc::new(PresenceStore::new()),
        config: config.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening");

    tokio::select! {
        result = server::serve(listener, AppState { gateway }) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
