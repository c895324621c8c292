//! Entry point for the `loom-gateway` HTTP server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use loom_core::{RouteStore, SystemClock};
use loom_executor::{DirectoryPackageSource, HttpPackageSource, PackageSource};
use loom_gateway::config::{LoomConfig, StorageBackend};
use loom_gateway::identity::{resolver_from_config, StaticPlanDirectory};
use loom_gateway::{create_router, Engine, EngineParts};
use loom_store::{MemoryStore, SqliteStore};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "loom-gateway", version, about = "Loom dynamic route execution engine")]
struct Cli {
    /// Path to the TOML configuration file. Missing files are ignored.
    #[arg(short, long, default_value = "loom.toml")]
    config: PathBuf,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    if let Err(e) = run(cli).await {
        tracing::error!(error = format!("{e:#}"), "loom-gateway failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = LoomConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let config = Arc::new(config);

    let store: Arc<dyn RouteStore> = match config.storage.backend {
        StorageBackend::Memory => {
            info!("using in-memory storage; routes are lost on restart");
            Arc::new(MemoryStore::new())
        }
        StorageBackend::Sqlite => {
            let path = &config.storage.sqlite_path;
            info!(path = %path.display(), "using sqlite storage");
            Arc::new(
                SqliteStore::open(path)
                    .with_context(|| format!("failed to open {}", path.display()))?,
            )
        }
    };

    let packages: Arc<dyn PackageSource> =
        match (&config.packages.registry_dir, &config.packages.registry_url) {
            (Some(dir), _) => Arc::new(DirectoryPackageSource::new(dir)),
            (None, Some(url)) => Arc::new(HttpPackageSource::new(url)?),
            (None, None) => {
                info!("no package registry configured; using ./packages");
                Arc::new(DirectoryPackageSource::new("packages"))
            }
        };

    let parts = EngineParts {
        store,
        clock: Arc::new(SystemClock),
        identities: resolver_from_config(&config.auth),
        plans: Arc::new(StaticPlanDirectory::from_config(&config.plans)),
        packages,
    };
    let engine = Engine::new(Arc::clone(&config), parts).shared();
    let _pruner = engine
        .limiter
        .spawn_pruner(Duration::from_secs(config.rate_limit.prune_interval_secs));

    let app = create_router(engine);
    let addr = &config.server.listen_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(addr = %addr, "loom-gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server error")
}
