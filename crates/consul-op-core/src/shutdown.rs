//! Signal handling for long-running commands.
//!
//! Holding a lock or keeping a service registered lasts until SIGINT or
//! SIGTERM. Signals are fanned out over broadcast channels and can also be
//! tied to a [`CancellationToken`] so an in-flight lock acquisition stops.

use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Create signal channels for SIGINT and SIGTERM
///
/// Returns receivers that will receive a value when the signal is detected
///
/// # Errors
///
/// Returns `IoError` if a signal handler cannot be installed
pub fn signal_channels() -> Result<(broadcast::Receiver<()>, broadcast::Receiver<()>)> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| Error::IoError(format!("Failed to setup SIGINT: {e}")))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| Error::IoError(format!("Failed to setup SIGTERM: {e}")))?;

        let (sigint_tx, sigint_rx) = broadcast::channel(1);
        let (sigterm_tx, sigterm_rx) = broadcast::channel(1);

        tokio::spawn(async move {
            let _ = sigint.recv().await;
            tracing::info!("Received SIGINT");
            let _ = sigint_tx.send(());
        });

        tokio::spawn(async move {
            let _ = sigterm.recv().await;
            tracing::info!("Received SIGTERM");
            let _ = sigterm_tx.send(());
        });

        Ok((sigint_rx, sigterm_rx))
    }

    #[cfg(not(unix))]
    {
        let (sigint_tx, sigint_rx) = broadcast::channel(1);
        let (sigterm_tx, sigterm_rx) = broadcast::channel(1);

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::info!("Received Ctrl-C");
            let _ = sigint_tx.send(());
            // On non-Unix, treat both the same
            let _ = sigterm_tx.send(());
        });

        Ok((sigint_rx, sigterm_rx))
    }
}

/// Wait until either receiver fires (or its sender goes away).
pub async fn wait_for_signal(
    sigint: &mut broadcast::Receiver<()>,
    sigterm: &mut broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns `IoError` if a signal handler cannot be installed
pub fn cancel_on_signal(token: CancellationToken) -> Result<JoinHandle<()>> {
    let (mut sigint, mut sigterm) = signal_channels()?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => {}
            () = wait_for_signal(&mut sigint, &mut sigterm) => {
                tracing::debug!("Signal received, cancelling pending operations");
                token.cancel();
            }
        }
    }))
}
