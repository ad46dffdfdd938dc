//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::ServerConfig;
use crate::service::BanxService;

use super::routes::routes;

/// Serve until a shutdown signal, then stop the worker.
pub async fn serve(config: &ServerConfig, service: Arc<BanxService>) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(service.clone());

    let listener = bind(config).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting banx server on {}", actual_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(config.await_explicit_shutdown, shutdown_rx))
    .await?;

    info!("Server shutdown complete");

    service.shutdown().await;

    Ok(())
}

/// Bind the configured host, which may be a hostname or an IPv6 literal.
async fn bind(config: &ServerConfig) -> anyhow::Result<TcpListener> {
    let host = config.host.trim_start_matches('[').trim_end_matches(']');
    TcpListener::bind((host, config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))
}

/// Resolve on SIGINT, SIGTERM (unless explicit shutdown is awaited) or `/shutdown`.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens outside a
/// properly configured Tokio runtime.
async fn shutdown_signal(await_explicit_shutdown: bool, mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        if await_explicit_shutdown {
            tracing::info!("Ignoring SIGTERM until /shutdown or SIGINT");
            std::future::pending::<()>().await
        } else {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect(
                    "failed to install SIGTERM handler - is tokio runtime configured correctly?",
                )
                .recv()
                .await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested via /shutdown endpoint...");
        }
    }
}
