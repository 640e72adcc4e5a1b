use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskpoints_core::config::resolve_config_with_source;
use taskpoints_core::digest::DigestOptions;
use taskpoints_core::lifecycle::Engine;
use taskpoints_core::notify::notifier_for;
use taskpoints_core::schedule::Schedule;
use taskpoints_core::store::SqliteStore;
use taskpoints_service::scheduler::DigestJob;
use taskpoints_service::{router, AppState};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "taskpoints-service",
    version,
    about = "Taskpoints HTTP API and daily digest"
)]
struct Args {
    /// Config file; defaults to ./taskpoints.toml, then $TASKPOINTS_HOME/config.toml.
    #[arg(long, env = "TASKPOINTS_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path.
    #[arg(long, env = "TASKPOINTS_DB")]
    db: Option<PathBuf>,

    #[arg(long, env = "TASKPOINTS_BIND")]
    bind: Option<String>,

    /// Directory of static client files served at `/`.
    #[arg(long, env = "TASKPOINTS_PUBLIC_DIR")]
    public_dir: Option<PathBuf>,

    /// Serve the API without the scheduled digest.
    #[arg(long)]
    no_digest: bool,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let cwd = std::env::current_dir().context("resolve working directory")?;
    let (config, source) = resolve_config_with_source(args.config.as_deref(), &cwd)
        .context("load configuration")?;
    info!(source = source.as_str(), "configuration loaded");

    let db_path = args.db.unwrap_or_else(|| config.database_path());
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("open database {}", db_path.display()))?;
    let offset = config.utc_offset()?;
    let engine = Engine::new(Arc::new(store)).with_utc_offset(offset);
    let notifier = notifier_for(config.outbox_path());
    let digest = DigestOptions::from_config(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = if config.digest_enabled() && !args.no_digest {
        let job = DigestJob {
            engine: engine.clone(),
            notifier: Arc::clone(&notifier),
            options: Arc::new(digest.clone()),
            schedule: Schedule::daily_at(config.digest_time()?),
        };
        Some(job.spawn(shutdown_rx))
    } else {
        info!("scheduled digest disabled");
        None
    };

    let public_dir = args.public_dir.or_else(|| config.public_dir());
    let app = router(AppState::new(engine, notifier, digest), public_dir.as_deref());

    let bind = args.bind.unwrap_or_else(|| config.bind());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {}", bind))?;
    info!(
        address = %bind,
        database = %db_path.display(),
        "taskpoints service listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("serve")?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        let _ = handle.await;
    }
    Ok(())
}
