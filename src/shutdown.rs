use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Resolves with the signal name once SIGTERM or SIGINT arrives.
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(received)
}

/// Cancel `token` on the first SIGTERM or SIGINT.
///
/// Cancelling stops new submissions and pending retry timers; in-flight
/// attempts finish and record their outcome.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(received) => {
                tracing::info!(signal = received, "Shutdown signal received, draining job runner");
                token.cancel();
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
            }
        }
    });
}
