use crate::pipeline::types::RunProgress;
use crate::web::api::{get_progress, health};
use anyhow::Result;
use axum::{routing::get, Router};
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(progress: Arc<RunProgress>) -> Router {
    Router::new()
        .route("/api/progress", get(get_progress))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(progress)
}

/// Binds `addr`, moving up one port at a time while the port is taken.
fn bind_with_fallback(addr: SocketAddr) -> Result<TcpListener> {
    let mut current_port = addr.port();
    loop {
        let candidate = SocketAddr::new(addr.ip(), current_port);
        match TcpListener::bind(candidate) {
            Ok(listener) => {
                // Tokio requires a non-blocking socket
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", candidate);
                return Ok(listener);
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", candidate, e);
                current_port = current_port.wrapping_add(1);
                if current_port == 0 {
                    return Err(anyhow::anyhow!("No available ports found"));
                }
            }
        }
    }
}

pub async fn run_server(
    addr: SocketAddr,
    progress: Arc<RunProgress>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = bind_with_fallback(addr)?;
    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Status server started on http://{}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, router(progress))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Status server stopped");
    Ok(())
}
