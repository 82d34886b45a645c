//! Foreground daemon: start, wait for SIGINT or SIGTERM, stop.

use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use vpnpack_config::Config;

use crate::commands::open_pack;
use crate::error::CliError;

pub async fn handle(cfg: &Config) -> Result<(), CliError> {
    let pack = open_pack(cfg)?;
    pack.start().await?;

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("SIGINT received, shutting down");
        }
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }

    pack.shutdown().await;
    Ok(())
}
