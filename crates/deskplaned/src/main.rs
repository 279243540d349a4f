//! deskplaned — the DeskPlane daemon.
//!
//! Single binary that assembles all DeskPlane subsystems:
//! - State store (redb)
//! - Host scheduler
//! - IP allocator
//! - Instance lifecycle manager
//! - Aggregate reconciliation loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! deskplaned standalone --port 8443 --data-dir /var/lib/deskplane
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use deskplane_orchestrator::{
    ImageMinimums, InstanceLifecycleManager, NoopDiskAttacher, StaticCatalog,
};
use deskplane_state::ResourceSpec;

#[derive(Parser)]
#[command(name = "deskplaned", about = "DeskPlane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single-node, all subsystems in one process).
    Standalone {
        /// Port to listen on.
        #[arg(long, default_value = "8443")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/deskplane")]
        data_dir: PathBuf,

        /// Aggregate reconciliation interval in seconds.
        #[arg(long, default_value = "60")]
        reconcile_interval: u64,

        /// Optional JSON file with image minimums and template defaults.
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

/// On-disk catalog format: image minimums and template defaults.
#[derive(serde::Deserialize, Default)]
struct CatalogFile {
    #[serde(default)]
    images: HashMap<String, ImageMinimums>,
    #[serde(default)]
    templates: HashMap<String, ResourceSpec>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,deskplaned=debug,deskplane=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            port,
            data_dir,
            reconcile_interval,
            catalog,
        } => run_standalone(port, data_dir, reconcile_interval, catalog).await,
    }
}

async fn run_standalone(
    port: u16,
    data_dir: PathBuf,
    reconcile_interval: u64,
    catalog_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("DeskPlane daemon starting in standalone mode");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("deskplane.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // State store.
    let store = deskplane_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Catalogs.
    let catalog_file = match catalog_path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(&path)?)?,
        None => CatalogFile::default(),
    };
    let mut catalog = StaticCatalog::new();
    for (image_id, minimums) in &catalog_file.images {
        catalog = catalog.with_image(image_id, *minimums);
    }
    for (template_id, defaults) in &catalog_file.templates {
        catalog = catalog.with_template(template_id, defaults.clone());
    }
    let catalog = Arc::new(catalog);
    info!(
        images = catalog_file.images.len(),
        templates = catalog_file.templates.len(),
        "catalog loaded"
    );

    // Scheduler and IP allocator.
    let scheduler = Arc::new(deskplane_scheduler::HostScheduler::new(store.clone()));
    let ipam = Arc::new(deskplane_ipam::IpAllocator::new(store.clone()));
    info!("scheduler and ip allocator initialized");

    // Lifecycle manager.
    let manager = Arc::new(InstanceLifecycleManager::new(
        store.clone(),
        scheduler,
        ipam.clone(),
        catalog.clone(),
        catalog,
        Arc::new(NoopDiskAttacher),
    ));
    info!("lifecycle manager initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // ── Reconciliation loop ────────────────────────────────────

    let reconcile_store = store.clone();
    let reconcile_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(reconcile_interval));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pools = match reconcile_store.list_pools() {
                        Ok(pools) => pools,
                        Err(e) => {
                            warn!(error = %e, "reconciliation pass could not list pools");
                            continue;
                        }
                    };
                    for pool in pools {
                        if let Err(e) =
                            deskplane_scheduler::reconcile_pool(&reconcile_store, &pool.id)
                        {
                            warn!(pool = %pool.id, error = %e, "pool reconciliation failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    });
    info!(interval = reconcile_interval, "reconciliation loop started");

    // ── Start API server ───────────────────────────────────────

    let router = deskplane_api::build_router(store, manager, ipam);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = reconcile_handle.await;

    info!("DeskPlane daemon stopped");
    Ok(())
}
