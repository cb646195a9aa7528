use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingSettings, Settings};
use tollgate::{BackingStore, MemoryStore, RemoteStore, StoreServer, TokenBucketLimiter};

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Distributed token bucket rate limiter")]
struct Cli {
    /// Settings file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a backing store server for other processes to share
    Serve {
        /// Address to listen on, overriding the settings file
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Fire concurrent reductions at one bucket and report the outcome
    Simulate {
        /// Number of concurrent `reduce(1)` calls
        #[arg(short = 'n', long, default_value_t = 1000)]
        requests: u64,

        /// Remote store server, overriding the settings file
        #[arg(long)]
        remote: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };

    init_tracing(&settings.logging);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Serve { listen } => {
            let addr = listen.unwrap_or(settings.store.listen_addr);
            let server = StoreServer::bind(addr, MemoryStore::new()).await?;
            info!(addr = %server.local_addr()?, "Store server ready");

            server.serve_with_shutdown(shutdown_signal()).await?;
            info!("Store server stopped");
        }
        Command::Simulate { requests, remote } => {
            let remote = remote.or(settings.store.remote_addr.clone());
            simulate(&settings, remote, requests).await?;
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn simulate(settings: &Settings, remote: Option<String>, requests: u64) -> anyhow::Result<()> {
    let store: Arc<dyn BackingStore> = match &remote {
        Some(addr) => {
            info!(addr = %addr, "Using remote store");
            Arc::new(RemoteStore::connect(addr.as_str()).await?)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let mut limiter = TokenBucketLimiter::new(settings.bucket.to_config()?, store);
    limiter.init().await?;
    let limiter = Arc::new(limiter);

    let started = Instant::now();
    let calls = (0..requests).map(|_| {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.reduce(1).await })
    });

    let mut admitted = 0u64;
    let mut rejected = 0u64;
    let mut failed = 0u64;
    for outcome in futures::future::join_all(calls).await {
        match outcome? {
            Ok(true) => admitted += 1,
            Ok(false) => rejected += 1,
            Err(e) => {
                warn!(error = %e, "Reduction failed");
                failed += 1;
            }
        }
    }

    info!(
        key = ?limiter.key(),
        requests,
        admitted,
        rejected,
        failed,
        remaining = limiter.get().await?,
        elapsed = ?started.elapsed(),
        "Simulation finished"
    );
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
