use std::path::PathBuf;

use clap::Parser;

/// Switchyard LLM gateway core
#[derive(Debug, Parser)]
#[command(name = "switchyard", about = "Multi-tenant LLM gateway: credentials, quotas and backend selection")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "switchyard.toml", env = "SWITCHYARD_CONFIG")]
    pub config: PathBuf,

    /// Override the listen address
    #[arg(long, env = "SWITCHYARD_LISTEN")]
    pub listen: Option<std::net::SocketAddr>,
}
