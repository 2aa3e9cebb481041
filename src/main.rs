use anyhow::Context;
use clap::Parser;
use ghwebhook::{AppState, EventStore, router};
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, env = "PORT", default_value = "5000")]
    port: u16,

    /// SQLite database path, or `:memory:`.
    #[arg(short, long, env = "DATABASE_URL", default_value = "github_webhooks.db")]
    database_url: String,

    /// Directory containing the landing page `index.html`.
    #[arg(long, env = "STATIC_DIR", default_value = "static")]
    static_dir: PathBuf,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let args = Args::parse();

    let store = EventStore::open(&args.database_url)
        .with_context(|| format!("failed to open event store at {}", args.database_url))?;
    info!("Event store opened at {}", args.database_url);

    let app = router(
        AppState {
            store: store.clone(),
        },
        &args.static_dir,
    );

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("GitHub webhook receiver starting on {}", addr);
    warn!("Webhook signatures are not verified");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    store.close().context("failed to close event store")?;
    info!("Event store closed");

    Ok(())
}
