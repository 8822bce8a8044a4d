//! Composition root and operational HTTP surface
//!
//! The gateway core has no proxying routes of its own; this crate wires the
//! components into a [`Gateway`] and exposes `/health` and
//! `/internal/refresh` for operators.

#![allow(clippy::must_use_candidate)]

mod error;
mod gateway;
mod health;
mod refresh;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use switchyard_config::ServerConfig;
use tower_http::trace::TraceLayer;

pub use error::ErrorResponse;
pub use gateway::Gateway;

/// Assembled operational server
pub struct Server {
    router: Router,
    listen_address: SocketAddr,
}

impl Server {
    pub fn new(gateway: Arc<Gateway>, config: &ServerConfig) -> Self {
        let listen_address = config
            .listen_address
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

        if config.gateway_secret.is_none() {
            tracing::warn!("no gateway secret configured, internal endpoints are disabled");
        }

        let refresh_state = refresh::RefreshState {
            gateway: Arc::clone(&gateway),
            gateway_secret: config.gateway_secret.clone(),
        };

        let router = Router::new()
            .route("/health", axum::routing::get(health::health_handler))
            .with_state(gateway)
            .route(
                "/internal/refresh",
                axum::routing::post(refresh::refresh_handler).with_state(refresh_state),
            )
            .layer(TraceLayer::new_for_http());

        Self { router, listen_address }
    }

    /// Get the configured listen address
    #[must_use]
    pub const fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    /// Consume the server and return the inner router
    ///
    /// Useful for testing when the caller manages the listener
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Start serving requests
    ///
    /// Blocks until the cancellation token is triggered.
    ///
    /// # Errors
    ///
    /// Returns an error if binding the TCP listener or serving fails
    pub async fn serve(self, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_address).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "server listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("graceful shutdown initiated");
            })
            .await?;

        Ok(())
    }
}
