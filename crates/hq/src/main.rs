//! HQ control plane entry point.
//!
//! `hq serve` (the default) runs the API/relay server; `hq sync` runs the
//! object-store mirror in the foreground.
//!
//! Exit codes: `0` normal, `1` fatal configuration error, `2` unrecoverable
//! dependency error.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use hq_core::logging::init_tracing;
use hq_fleet::{ComputeBackend, HttpFleetBackend, MockComputeBackend};
use hq_server::http::build_router;
use hq_server::{AppState, Services};
use hq_settings::HqSettings;
use hq_store::{ConnectionConfig, Store};
use hq_sync::{DeletedFilePolicy, S3ObjectStore, SyncConfig, SyncPoller};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "hq", about = "Cloud control plane for ephemeral AI-coding worker sessions")]
struct Cli {
    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API and relay server (default).
    Serve,
    /// Run the object-store mirror in the foreground.
    Sync {
        /// Run a single poll cycle and exit.
        #[arg(long)]
        once: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let settings = match hq_settings::load_settings() {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!(error = %e, "fatal: failed to load configuration");
            return ExitCode::from(1);
        }
    };
    hq_settings::init_settings((*settings).clone());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "fatal: failed to start runtime");
            return ExitCode::from(2);
        }
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => runtime.block_on(serve(settings)),
        Command::Sync { once } => runtime.block_on(run_sync(settings, once)),
    }
}

fn data_dir() -> PathBuf {
    std::env::var("HQ_DATA_DIR").map_or_else(
        |_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".hq")
        },
        PathBuf::from,
    )
}

async fn serve(settings: Arc<HqSettings>) -> ExitCode {
    let dir = data_dir();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        error!(error = %e, path = %dir.display(), "fatal: cannot create data directory");
        return ExitCode::from(1);
    }
    let store = match hq_store::new_file(&dir.join("hq.db"), &ConnectionConfig::default())
        .and_then(Store::open)
    {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "fatal: cannot open session store");
            return ExitCode::from(2);
        }
    };

    let fleet: Arc<dyn ComputeBackend> = if settings.fleet.endpoint.is_empty() {
        info!("no fleet endpoint configured; sessions expect externally launched workers");
        Arc::new(MockComputeBackend::new())
    } else {
        Arc::new(HttpFleetBackend::new(
            settings.fleet.endpoint.clone(),
            settings.fleet.project.clone(),
        ))
    };

    let sync = match build_poller(&settings).await {
        Ok(sync) => sync,
        Err(e) => {
            error!(error = %e, "fatal: cannot initialize file sync");
            return ExitCode::from(2);
        }
    };
    if let Some(poller) = &sync {
        poller.start_polling();
    }

    let services = Services::new(Arc::clone(&settings), store, fleet, sync);
    let router = build_router(AppState::new(Arc::clone(&services)));

    let addr = format!("0.0.0.0:{}", settings.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr, "fatal: cannot bind listen address");
            return ExitCode::from(1);
        }
    };
    info!(addr, "hq server listening");

    let shutdown_services = Arc::clone(&services);
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown_services.begin_shutdown();
        })
        .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::from(2)
        }
    }
}

async fn build_poller(settings: &HqSettings) -> anyhow::Result<Option<Arc<SyncPoller>>> {
    let storage = &settings.storage;
    if storage.bucket.is_empty() || storage.prefix.is_empty() || storage.local_dir.is_empty() {
        return Ok(None);
    }
    let store = Arc::new(S3ObjectStore::from_env(storage.bucket.clone()).await);
    let mut config = SyncConfig::new("default", storage.prefix.clone(), &storage.local_dir);
    config.poll_interval = Duration::from_millis(storage.poll_interval_ms);
    config.concurrency = storage.concurrency;
    config.max_list_pages = storage.max_list_pages;
    config.preserve_timestamps = storage.preserve_timestamps;
    config.deleted_file_policy = storage
        .deleted_file_policy
        .parse::<DeletedFilePolicy>()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid deletedFilePolicy")?;
    let poller = SyncPoller::new(store, config).context("failed to load sync state")?;
    Ok(Some(Arc::new(poller)))
}

async fn run_sync(settings: Arc<HqSettings>, once: bool) -> ExitCode {
    let poller = match build_poller(&settings).await {
        Ok(Some(poller)) => poller,
        Ok(None) => {
            error!("fatal: storage is not configured (bucket, prefix, localDir)");
            return ExitCode::from(1);
        }
        Err(e) => {
            error!(error = %e, "fatal: cannot initialize file sync");
            return ExitCode::from(2);
        }
    };

    if once {
        return match poller.poll_once().await {
            Ok(summary) => {
                info!(
                    changes = summary.changes_detected,
                    downloaded = summary.files_downloaded,
                    deleted = summary.files_deleted,
                    errors = summary.errors,
                    "poll complete"
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "poll failed");
                ExitCode::from(2)
            }
        };
    }

    poller.start_polling();
    info!("sync poller running; press Ctrl-C to stop");
    wait_for_signal().await;
    poller.stop_polling();
    ExitCode::SUCCESS
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
