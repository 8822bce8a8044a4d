use std::net::SocketAddr;

use secrecy::SecretString;
use serde::Deserialize;

/// Operational HTTP listener configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address for `/health` and `/internal/*`, defaults to `0.0.0.0:3000`
    pub listen_address: Option<SocketAddr>,
    /// Shared secret expected in `x-gateway-secret` on internal endpoints
    #[serde(default)]
    pub gateway_secret: Option<SecretString>,
}
