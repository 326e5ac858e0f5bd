//! vecbase binary — thin CLI shell over the [`vecbase_server`] library
//! crate.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use vecbase_server::api::{router, AppContext};
use vecbase_server::config::Config;
use vecbase_server::db::Database;
use vecbase_server::model::IndexKind;
use vecbase_server::snapshot;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// In-memory vector database with a REST API. Flags override the
/// corresponding VECBASE_* environment variables.
#[derive(Parser)]
#[command(name = "vecbase", version, about, long_about = None)]
struct Cli {
    /// Bind host (default: 127.0.0.1)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (default: 8000)
    #[arg(long)]
    port: Option<u16>,

    /// Snapshot file path; omit for in-memory only
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Default index kind for new libraries: linear, kdtree, or lsh
    #[arg(long)]
    index_kind: Option<IndexKind>,
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vecbase_server=info".parse().unwrap())
                .add_directive("vecbase_core=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env().unwrap_or_else(|e| {
        error!(error = e.as_str(), "invalid configuration");
        std::process::exit(1);
    });
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(snapshot) = cli.snapshot {
        config.snapshot_path = Some(snapshot);
    }
    if let Some(kind) = cli.index_kind {
        config.index.kind = kind;
    }

    // Load the snapshot if one is configured and present. A corrupt or
    // partial file aborts startup; it never half-loads.
    let db = match &config.snapshot_path {
        Some(path) if path.exists() => match snapshot::load(path, config.index.clone()) {
            Ok(db) => {
                info!(path = %path.display(), "restored store from snapshot");
                db
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "snapshot load failed, refusing to start");
                std::process::exit(1);
            }
        },
        Some(path) => {
            info!(path = %path.display(), "no snapshot yet, starting empty");
            Database::new(config.index.clone())
        }
        None => {
            warn!("no snapshot path configured — store is in-memory only");
            Database::new(config.index.clone())
        }
    };
    let db = Arc::new(db);

    let ctx = AppContext { db: Arc::clone(&db), start_time: Instant::now() };
    let app = router(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Background persistence: write the snapshot whenever the store moved
    // since the last pass.
    if let Some(path) = config.snapshot_path.clone() {
        let db = Arc::clone(&db);
        let interval_secs = config.persist_interval_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            let mut persisted_at = db.generation();
            loop {
                interval.tick().await;
                let generation = db.generation();
                if generation == persisted_at {
                    continue;
                }
                let db = Arc::clone(&db);
                let path = path.clone();
                let result =
                    tokio::task::spawn_blocking(move || snapshot::save(&db, &path)).await;
                match result {
                    Ok(Ok(())) => persisted_at = generation,
                    Ok(Err(e)) => error!(error = %e, "periodic snapshot failed"),
                    Err(e) => error!(error = %e, "snapshot task panicked"),
                }
            }
        });
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        error!(addr = addr.as_str(), error = %e, "could not bind");
        std::process::exit(1);
    });
    info!(addr = addr.as_str(), "vecbase listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    // Final persist so a clean shutdown never loses acknowledged writes.
    if let Some(path) = &config.snapshot_path {
        if let Err(e) = snapshot::save(&db, path) {
            error!(path = %path.display(), error = %e, "final snapshot failed");
        }
    }
}
