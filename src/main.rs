use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use tiledd::config::DaemonConfig;
use tiledd::store::session::RemoteSession;
use tiledd::store::StoreAdapter;
use tiledd::worker::dylib::DylibArtifactLoader;
use tiledd::worker::BuildWorker;
use tiledd::AppContext;

#[derive(Parser)]
#[command(
    name = "tiledd",
    about = "Web-Tiled Host — background build worker and remote-storage bridge",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Bridge WebSocket server port
    #[arg(long, env = "TILEDD_PORT")]
    port: Option<u16>,

    /// Data directory for the session cache and config.toml
    #[arg(long, env = "TILEDD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Directory holding installed build artifacts (one per subdirectory)
    #[arg(long, env = "TILEDD_ARTIFACTS_DIR")]
    artifacts_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TILEDD_LOG")]
    log: Option<String>,

    /// Bind address for the WebSocket server (default: 127.0.0.1)
    #[arg(long, env = "TILEDD_BIND")]
    bind_address: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "TILEDD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the bridge daemon (default when no subcommand given).
    ///
    /// Runs tiledd in the foreground. The editor connects on
    /// ws://127.0.0.1:{port}; `GET /health` answers on the same port.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── Logging setup ────────────────────────────────────────────────────────
    // Init once — must happen before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        None | Some(Command::Serve) => {
            run_server(
                args.port,
                args.data_dir,
                args.artifacts_dir,
                args.log,
                args.bind_address,
            )
            .await?;
        }
    }

    Ok(())
}

async fn run_server(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    artifacts_dir: Option<std::path::PathBuf>,
    log: Option<String>,
    bind_address: Option<String>,
) -> Result<()> {
    let config = Arc::new(DaemonConfig::new(
        port,
        data_dir,
        artifacts_dir,
        log,
        bind_address,
    ));
    info!(
        data_dir = %config.data_dir.display(),
        artifacts_dir = %config.artifacts_dir.display(),
        "starting tiledd v{}",
        env!("CARGO_PKG_VERSION")
    );

    let session = RemoteSession::open(&config.data_dir, config.storage.sync_interval_ms)
        .await
        .context("failed to open remote session")?;
    let store = StoreAdapter::new(Arc::clone(&session));
    let worker = BuildWorker::spawn(Arc::new(DylibArtifactLoader::new(&config.artifacts_dir)));

    let ctx = Arc::new(AppContext {
        config,
        session,
        store,
        worker,
        started_at: std::time::Instant::now(),
    });

    tiledd::ipc::run(ctx).await
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only
/// logging with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("tiledd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(EnvFilter::new(log_level))
            .with(fmt::layer().compact())
            .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
