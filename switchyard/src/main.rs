#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;

use std::sync::Arc;

use args::Args;
use clap::Parser;
use switchyard_config::Config;
use switchyard_server::{Gateway, Server};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen_address = Some(listen);
    }

    switchyard_telemetry::init(&config.telemetry)?;

    tracing::info!(
        config_path = %args.config.display(),
        "starting switchyard"
    );

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();

    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_clone.cancel();
    });

    let gateway = Arc::new(Gateway::connect(&config).await?);
    let workers = gateway.start(&shutdown).await?;

    let server = Server::new(Arc::clone(&gateway), &config.server);
    server.serve(shutdown.clone()).await?;

    // The server only returns once shutdown began; let the sync tasks wind down
    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }

    tracing::info!("switchyard stopped");
    Ok(())
}

/// Wait for a shutdown signal (`SIGINT` or `SIGTERM`)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
