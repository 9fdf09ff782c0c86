use tokio::net::TcpListener;
use tokio::sync::oneshot;

use powerwatch_core::telemetry::init_tracing;
use powerwatch_core::{PowerRelay, RelayConfig};
use powerwatch_server::{serve, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    let config = RelayConfig::load()?;
    init_tracing(&config.log_filter);

    // Broker unreachable at boot is fatal
    let relay = PowerRelay::start(&config).await?;

    let listener = TcpListener::bind(config.http.addr()).await?;
    let state = AppState::new(relay.handle(), config.http.keep_alive_interval);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(listener, state, async move {
        let _ = stop_rx.await;
    }));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl+C received, shutting down...");
    let _ = stop_tx.send(());

    // Closing the relay ends every open SSE stream, which lets the HTTP server finish
    if let Err(e) = relay.shutdown().await {
        tracing::warn!(error = %e, "Relay shutdown incomplete");
    }

    match tokio::time::timeout(config.shutdown_grace, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "HTTP server error"),
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server task failed"),
        Err(_) => tracing::warn!("HTTP server did not stop within the grace period"),
    }

    tracing::info!("Powerwatch stopped.");
    Ok(())
}
