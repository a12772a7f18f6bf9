/// Resolves when the process is asked to stop. Consumers stop pulling,
/// in-flight work finishes, then the process exits.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv()  => tracing::warn!(signal = "SIGINT", "shutting down"),
            _ = sigterm.recv() => tracing::warn!(signal = "SIGTERM", "shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
        tracing::warn!(signal = "ctrl-c", "shutting down");
    }
}
