use std::sync::Arc;

use switchyard_auth::Authenticator;
use switchyard_cache::Registry;
use switchyard_config::Config;
use switchyard_quota::QuotaLedger;
use switchyard_routing::{Breaker, Dispatcher, Selector};
use switchyard_store::Backends;
use switchyard_sync::SyncFabric;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Every gateway component, wired once at startup
///
/// The registry is shared by reference counting; nothing here is global,
/// so tests can build as many independent gateways as they need.
pub struct Gateway {
    pub backends: Backends,
    pub registry: Arc<Registry>,
    pub selector: Arc<Selector>,
    pub breaker: Arc<Breaker>,
    pub dispatcher: Dispatcher,
    pub ledger: QuotaLedger,
    pub fabric: Arc<SyncFabric>,
    pub auth: Authenticator,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

impl Gateway {
    /// Wire the components on top of already connected backends
    pub fn new(backends: Backends, config: &Config) -> Self {
        let registry = Arc::new(Registry::new(Arc::clone(&backends.store)));
        let ledger = QuotaLedger::new(Arc::clone(&registry), Arc::clone(&backends.counters));
        let selector = Arc::new(Selector::new(Arc::clone(&registry), ledger.clone()));
        let breaker = Arc::new(Breaker::new(
            Arc::clone(&registry),
            Arc::clone(&backends.counters),
            Arc::clone(&backends.bus),
            config.breaker.clone(),
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&selector), Arc::clone(&breaker), config.retry.clone());
        let fabric = Arc::new(SyncFabric::new(
            Arc::clone(&registry),
            Arc::clone(&backends.bus),
            ledger.clone(),
            Arc::clone(&breaker),
            config.sync.clone(),
        ));
        let auth = Authenticator::new(
            Arc::clone(&registry),
            Arc::clone(&backends.bus),
            ledger.clone(),
            &config.auth,
        );

        Self {
            backends,
            registry,
            selector,
            breaker,
            dispatcher,
            ledger,
            fabric,
            auth,
        }
    }

    /// Connect the configured storage and wire the components
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend cannot be reached
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let backends = Backends::connect(&config.storage).await?;
        Ok(Self::new(backends, config))
    }

    /// Load every cache, then start background synchronization
    ///
    /// A failed initial load is fatal: the gateway never serves from empty
    /// caches.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial full refresh fails
    pub async fn start(&self, shutdown: &CancellationToken) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let loaded = self
            .fabric
            .full_refresh()
            .await
            .map_err(|e| anyhow::anyhow!("initial cache load failed: {e}"))?;
        tracing::info!(entities = loaded, "caches loaded");

        Ok(self.fabric.start(shutdown))
    }
}
