//! `mailpoll` binary: scans one account folder for unread mail, hands it to
//! a listener and files it away, guarded by a cross-process folder lock.
use anyhow::Result;
use clap::Parser;
use mailpoll::app;
use mailpoll::cli::Cli;
use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "mailpoll=info,sqlx=warn";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    app::run(cli).await
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
