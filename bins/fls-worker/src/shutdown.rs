use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// The returned token is cancelled on the first signal. The worker loop
/// checks it between passes, so a job in flight still runs to completion.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let trigger = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, finishing current pass");
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, finishing current pass");
            }
        }

        trigger.cancel();
    });

    Ok(token)
}
