//! Keeps every instance's caches in step with the source of truth
//!
//! Two paths feed the [`Registry`]: a periodic full refresh that rebuilds
//! every cache from the store, and a subscription to the change bus that
//! applies single-entity notifications as they are published. The
//! subscription is supervised and re-established after a backoff whenever
//! the bus connection drops; each reconnect is followed by a full refresh
//! to pick up anything published while disconnected.

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

mod apply;
mod refresh;

use std::sync::Arc;

use futures_util::StreamExt;
use switchyard_cache::Registry;
use switchyard_config::SyncConfig;
use switchyard_core::Channel;
use switchyard_quota::QuotaLedger;
use switchyard_routing::Breaker;
use switchyard_store::Bus;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub use apply::Change;

pub struct SyncFabric {
    registry: Arc<Registry>,
    bus: Arc<dyn Bus>,
    ledger: QuotaLedger,
    breaker: Arc<Breaker>,
    config: SyncConfig,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SyncFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncFabric").field("config", &self.config).finish_non_exhaustive()
    }
}

impl SyncFabric {
    pub fn new(
        registry: Arc<Registry>,
        bus: Arc<dyn Bus>,
        ledger: QuotaLedger,
        breaker: Arc<Breaker>,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            ledger,
            breaker,
            config,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Spawn the periodic refresher and the supervised subscriber
    ///
    /// Both tasks exit when `shutdown` is cancelled.
    pub fn start(self: &Arc<Self>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).refresh_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(self).subscribe_loop(shutdown.clone())),
        ]
    }

    async fn refresh_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already refreshed
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::debug!("cache refresher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.full_refresh().await {
                        tracing::error!(error = %e, "periodic cache refresh failed, keeping current caches");
                    }
                }
            }
        }
    }

    async fn subscribe_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let channels = Channel::all();
        let mut reconnecting = false;

        loop {
            match self.bus.subscribe(&channels).await {
                Ok(mut stream) => {
                    tracing::info!(channels = channels.len(), "subscribed to change notifications");

                    if reconnecting && let Err(e) = self.full_refresh().await {
                        tracing::error!(error = %e, "cache refresh after resubscribe failed");
                    }

                    loop {
                        tokio::select! {
                            () = shutdown.cancelled() => {
                                tracing::debug!("change subscriber stopped");
                                return;
                            }
                            next = stream.next() => match next {
                                Some(Ok((channel, message))) => {
                                    if let Err(e) = self.apply(channel, &message).await {
                                        tracing::warn!(%channel, action = ?message.action, error = %e, "failed to apply change");
                                    }
                                }
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "dropping undecodable change message");
                                }
                                None => {
                                    tracing::warn!("change subscription lost");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to subscribe to change notifications");
                }
            }

            reconnecting = true;
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        }
    }
}
