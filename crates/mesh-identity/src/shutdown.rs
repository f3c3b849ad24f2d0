//! Signal driven cancellation.
//!
//! SIGTERM or SIGINT cancels the shared token. The controller stops accepting
//! new Certify calls and drains in-flight ones; the agent leaves its renewal
//! loop at the next sleep.

use std::io;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Waits for SIGTERM or SIGINT, then cancels `token`.
///
/// Returns early without cancelling if `token` is cancelled by someone else.
pub async fn shutdown_signal(token: CancellationToken) -> io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "failed to register a SIGTERM signal handler");
    })?;
    let mut sigint = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "failed to register a SIGINT signal handler");
    })?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, beginning shutdown");
            token.cancel();
        }
        _ = sigint.recv() => {
            tracing::info!("SIGINT received, beginning shutdown");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
    Ok(())
}
