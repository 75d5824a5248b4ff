//! Process signal handling for graceful shutdown.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Listen for SIGTERM/SIGINT and trip the returned token on the first one.
///
/// The binary awaits this token and then drains the host through
/// [`SchedulerHost::shutdown`], so in-flight occurrences get the configured
/// drain timeout before the process exits.
///
/// [`SchedulerHost::shutdown`]: crate::scheduler::SchedulerHost::shutdown
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trip = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGINT handler");
                return;
            }
        };

        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "Shutdown signal received; draining host");
        trip.cancel();
    });

    token
}
