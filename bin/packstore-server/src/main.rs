//! packstore server
//!
//! HTTP object server with per-directory archives and background compaction.

use anyhow::{Context, Result};
use clap::Parser;
use packstore_archive::{
    ArchiveStore, CompactionScheduler, LockPolicy, OpenPolicy, PathLocks, RedbCoordinator,
};
use packstore_common::Config;
use packstore_server::metrics::server_metrics;
use packstore_server::state::AppState;
use packstore_server::vhost::Vhosts;
use packstore_server::{build_router, metrics_router};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "packstore-server")]
#[command(about = "packstore HTTP object server")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "PACKSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides `server.listen`
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log level, overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,
}

/// Load the config file (if any) layered with `PACKSTORE__SECTION__KEY`
/// environment variables
fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path.as_path()));
    }
    let config = builder
        .add_source(config::Environment::with_prefix("PACKSTORE").separator("__"))
        .build()
        .context("failed to read configuration")?
        .try_deserialize()
        .context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_ref())?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;

    let host_id = config
        .node
        .host_id
        .clone()
        .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
    info!("Starting packstore server (host_id={})", host_id);
    for vhost in &config.vhosts {
        info!(
            "Serving vhost {} from {} (hosts: {})",
            vhost.name,
            vhost.root.display(),
            vhost.hosts.join(", ")
        );
    }

    let coordinator = RedbCoordinator::open(&config.compaction.coordinator_path).with_context(|| {
        format!(
            "failed to open compaction store {}",
            config.compaction.coordinator_path.display()
        )
    })?;
    let store = Arc::new(ArchiveStore::new(
        PathLocks::new(LockPolicy::from(&config.locks)),
        Arc::new(coordinator),
        host_id,
        OpenPolicy {
            attempts: config.store.open_attempts,
            sleep: config.store.open_sleep(),
        },
    )
    .with_cached_handles(config.store.cached_handles));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = if config.compaction.enabled {
        let scheduler = CompactionScheduler::new(Arc::clone(&store), &config.compaction)
            .with_observer(|report| server_metrics().record_compaction_pass(report));
        Some(tokio::spawn(scheduler.run(shutdown_rx.clone())))
    } else {
        warn!("Background compaction disabled");
        None
    };

    if let Some(addr) = config.server.metrics_listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics listener {addr}"))?;
        info!("Metrics listening on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_router()).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let state = Arc::new(AppState::new(
        Vhosts::new(&config.vhosts),
        store,
        config.server.max_body_size,
    ));
    let app = build_router(state);

    let listener = TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    info!("Listening on {}", config.server.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            error!("Compaction scheduler task failed: {}", e);
        }
    }
    info!("Server stopped");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM and tell background tasks to stop
async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutdown signal received");
    let _ = shutdown.send(true);
}
