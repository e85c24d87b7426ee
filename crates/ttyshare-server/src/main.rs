//! ttyshare server binary

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ttyshare_server::{serve, shutdown_signal, ServerConfig, SessionRegistry};

#[derive(Parser)]
#[command(name = "ttyshare-server")]
#[command(author, version, about = "Share a terminal program with many viewers", long_about = None)]
struct Cli {
    /// Config file (TOML, YAML or JSON)
    #[arg(short, long, env = "TTYSHARE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory viewer uploads are written to
    #[arg(long)]
    upload_dir: Option<PathBuf>,

    /// Program selector used when a viewer does not name one
    #[arg(long)]
    default_program: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        eprintln!("[PANIC] at {:?}: {}", location, payload);
        tracing::error!("PANIC at {:?}: {}", location, payload);
    }));

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = match init_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("[FATAL] Failed to initialize logging: {:#}", e);
            std::process::exit(1);
        }
    };

    info!("Starting ttyshare server v{}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    if let Err(e) = run(cli).await {
        error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_filter = if cli.verbose {
        "ttyshare_server=debug,tower_http=debug"
    } else {
        "ttyshare_server=info,tower_http=info"
    };
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    };

    match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(std::path::Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_name = path
                .file_name()
                .context("Log file path has no file name")?;

            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(true)
                .with_line_number(true)
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))?;
            Ok(None)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config =
        ServerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }
    if let Some(dir) = cli.upload_dir {
        config.upload_dir = dir;
    }
    if let Some(program) = cli.default_program {
        config.default_program = program;
    }
    config.validate().context("Invalid configuration")?;

    let mut selectors: Vec<&String> = config.programs.keys().collect();
    selectors.sort();
    info!(
        "Config loaded: bind={}, default program={}, programs={:?}",
        config.bind_address, config.default_program, selectors
    );
    info!("Uploads go to {}", config.upload_dir.display());

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    info!("Listening on {}", listener.local_addr()?);

    let registry = SessionRegistry::new(Arc::new(config));
    serve(listener, registry, shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}
