//! Test server wrapper that serves a world's gateway on a random port

use std::net::SocketAddr;
use std::sync::Arc;

use secrecy::SecretString;
use switchyard_config::ServerConfig;
use switchyard_server::{Gateway, Server};
use tokio_util::sync::CancellationToken;

pub const GATEWAY_SECRET: &str = "internal-secret";

/// A running test server instance
pub struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    client: reqwest::Client,
}

impl TestServer {
    /// Binds to port 0 for automatic port assignment
    pub async fn start(gateway: Arc<Gateway>) -> anyhow::Result<Self> {
        let config = ServerConfig {
            listen_address: None,
            gateway_secret: Some(SecretString::from(GATEWAY_SECRET)),
        };
        let server = Server::new(gateway, &config);
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        tokio::spawn(async move {
            axum::serve(listener, server.into_router())
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            shutdown,
            client: reqwest::Client::new(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
