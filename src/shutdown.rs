use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or Ctrl-C.
///
/// This is the master's exit predicate: every loop of the master watches the
/// token and winds down once it is cancelled.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = terminate => tracing::info!("Received SIGTERM, stopping master"),
            _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C, stopping master"),
        }
        trigger.cancel();
    });

    token
}
