use tokio_util::sync::CancellationToken;

/// Cancels `shutdown` on the first SIGINT or SIGTERM.
#[cfg(unix)]
pub(crate) fn spawn_shutdown_handler(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(error = %err, "failed to register SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(error = %err, "failed to register SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => tracing::info!(signal = "SIGINT", "shutting down"),
            _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "shutting down"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
}

#[cfg(not(unix))]
pub(crate) fn spawn_shutdown_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "failed to listen for ctrl-c");
                    return;
                }
                tracing::info!(signal = "ctrl-c", "shutting down");
            }
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
}
