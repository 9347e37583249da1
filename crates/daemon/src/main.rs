#![forbid(unsafe_code)]

//! microci daemon binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use microci_daemon::config::Config;
use microci_daemon::gitea::GiteaClient;
use microci_daemon::http::{self, AppState};
use microci_daemon::manager::Manager;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "microci", version, about = "Minimal Gitea CI runner")]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, env = "MICROCI_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (env-filter syntax).
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::load(&args.config).context("load config")?;
    let api = GiteaClient::new(&cfg.gitea).context("create gitea client")?;

    let manager = Manager::start(&cfg, Arc::new(api));
    manager.load_jobs().await.context("load jobs")?;

    let app = http::router(AppState::new(Arc::clone(&manager), &cfg.gitea.secret_key));
    let listen = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("bind {listen}"))?;

    tracing::info!(listen = %listen, address = %cfg.server.address, "microci starting");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("http server stopped, shutting down jobs");
    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
