use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGINT or, on unix, SIGTERM.
///
/// Every long-running loop selects on the token and winds down on its own.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();

    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down"),
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl-C, shutting down");
            }
        }

        trigger.cancel();
    });

    Ok(token)
}
