use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// The API server and the maintenance service both watch the token, so a
/// signal stops handing out work and lets the current cycle finish.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down queue");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down queue");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}
