//! particle-tracks: Main entry point

use clap::Parser;
use particle_tracks::cli::{run, Cli};
use particle_tracks::error::Result;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next chunk boundary");
            on_signal.cancel();
        }
    });

    tokio::task::spawn_blocking(move || run(cli, cancel))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}
