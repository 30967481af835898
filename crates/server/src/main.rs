//! loqad — the Loqa runtime daemon

use clap::Parser;

use loqa_config::load_settings;
use loqa_server::{init_tracing, Supervisor};

#[derive(Parser)]
#[command(name = "loqad", version, about = "Loqa runtime daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "loqa.yaml")]
    config: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match load_settings(Some(&cli.config)) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("failed to load config: {error}");
            std::process::exit(1);
        }
    };

    init_tracing(&settings);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config,
        "starting loqad"
    );

    let supervisor = Supervisor::new(settings);
    if let Err(error) = supervisor.run(shutdown_signal()).await {
        tracing::error!(%error, "runtime exited with error");
        std::process::exit(1);
    }
    tracing::info!("shutdown complete");
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
