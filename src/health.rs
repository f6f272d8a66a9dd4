// =============================================================================
// Health endpoint — minimal liveness probe, spawned alongside the engine loop
// =============================================================================

use axum::{routing::get, Router};
use tracing::info;

async fn ping() -> &'static str {
    "pong"
}

/// Bind and serve `GET /ping -> "pong"` on `port`. Runs until the process
/// exits; spawned as its own task by `main`.
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let app = Router::new().route("/ping", get(ping));
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "health endpoint listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_returns_pong() {
        assert_eq!(ping().await, "pong");
    }
}
