use owo_colors::OwoColorize;

/// Resolves when the process receives SIGINT (Ctrl+C) or SIGTERM (the pod
/// is being stopped). Used as the graceful-shutdown future of every server
/// and supervisor loop in this workspace.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv()  => eprintln!("{}", "🛑 SIGINT, shutting down".red()),
            _ = sigterm.recv() => eprintln!("{}", "🛑 SIGTERM, shutting down".red()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    }
}
