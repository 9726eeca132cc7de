//! bhid daemon CLI
//!
//! Loads the INI configuration, brings up the Connections Registry,
//! Tracker Client(s), Peer Engine, Front Plane, and control socket, then
//! runs until Ctrl+C or SIGTERM, draining every component before exit.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::oneshot;
use tracing_subscriber::{fmt, EnvFilter};

use bhid::config::BhidConfig;
use bhid::coordinator::{Coordinator, Paths};
use bhid::BhidError;

/// bhid — peer-to-peer TCP tunneling daemon
#[derive(Parser, Debug)]
#[command(name = "bhid")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the INI configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Named instance, selecting `bhid.<instance>.conf` and
    /// `daemon.<instance>.sock` (§6)
    #[arg(short, long)]
    instance: Option<String>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Run attached to the terminal instead of detaching (no-op placeholder:
    /// this daemon never daemonizes itself; the flag is accepted so process
    /// supervisors can pass it uniformly)
    #[arg(short, long)]
    foreground: bool,
}

#[cfg(target_os = "linux")]
const DEFAULT_CONFIG_DIR: &str = "/etc/bhid";
#[cfg(not(target_os = "linux"))]
const DEFAULT_CONFIG_DIR: &str = "/usr/local/etc/bhid";

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    fmt().with_env_filter(filter).with_target(false).init();

    let _ = args.foreground;

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.user_message());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), BhidError> {
    let config_path = args.config.clone().unwrap_or_else(|| default_config_path(args.instance.as_deref()));
    tracing::info!("loading configuration from {}", config_path.display());
    let config = BhidConfig::from_file(&config_path)?;

    let config_dir = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR));

    let paths = Paths::new(&config_dir, config_path.clone(), args.instance.as_deref(), None);

    let mut coordinator = Coordinator::bootstrap(&config, paths).await?;
    tracing::info!("bhid daemon started");

    run_with_cleanup(&mut coordinator, config_path).await?;
    coordinator.shutdown().await;
    Ok(())
}

/// Runs until Ctrl+C or SIGTERM, reloading the registry from disk on
/// SIGHUP (SPEC_FULL §3 "Config reload on SIGHUP") in the meantime.
async fn run_with_cleanup(coordinator: &mut Coordinator, config_path: PathBuf) -> Result<(), BhidError> {
    let (cancel_tx, cancel_rx) = oneshot::channel();

    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    #[cfg(unix)]
    let registry = coordinator.registry_handle();
    #[cfg(unix)]
    let hup = async move {
        let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("failed to install SIGHUP handler");
        loop {
            stream.recv().await;
            tracing::info!("received SIGHUP, reloading {}", config_path.display());
            if let Err(e) = registry.lock().unwrap().load() {
                tracing::warn!("config reload failed: {e}");
            }
        }
    };
    #[cfg(not(unix))]
    let hup = std::future::pending::<()>();

    tokio::select! {
        _ = coordinator.run(cancel_rx) => {}
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
            let _ = cancel_tx.send(());
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
            let _ = cancel_tx.send(());
        }
        _ = hup => {}
    }

    Ok(())
}

fn default_config_path(instance: Option<&str>) -> PathBuf {
    let file_name = match instance {
        Some(instance) => format!("bhid.{instance}.conf"),
        None => "bhid.conf".to_string(),
    };
    PathBuf::from(DEFAULT_CONFIG_DIR).join(file_name)
}
