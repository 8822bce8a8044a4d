//! A fully wired gateway over in-memory backends with sync running

use std::sync::Arc;
use std::time::Duration;

use switchyard_config::Config;
use switchyard_server::Gateway;
use switchyard_store::Backends;
use switchyard_store::backend::memory::{MemoryBus, MemoryCounters, MemoryStore};
use tokio_util::sync::CancellationToken;

use super::eventually;
use super::seed::Seed;

pub struct World {
    pub gateway: Arc<Gateway>,
    /// Concrete bus handle, for dropping subscriptions
    pub bus: Arc<MemoryBus>,
    shutdown: CancellationToken,
}

impl World {
    pub async fn start(seed: &Seed) -> Self {
        Self::start_with(seed, test_config()).await
    }

    /// Seed the store, load the caches and wait for the subscriber
    pub async fn start_with(seed: &Seed, config: Config) -> Self {
        let bus = Arc::new(MemoryBus::new());
        let backends = Backends {
            store: Arc::new(MemoryStore::new()),
            counters: Arc::new(MemoryCounters::new()),
            bus: Arc::clone(&bus) as Arc<dyn switchyard_store::Bus>,
        };
        seed.save(&backends.store).await;

        let gateway = Arc::new(Gateway::new(backends, &config));
        let shutdown = CancellationToken::new();
        gateway.start(&shutdown).await.unwrap();

        let watched = Arc::clone(&bus);
        eventually("change subscriber", || watched.subscriber_count() > 0).await;

        Self { gateway, bus, shutdown }
    }
}

impl World {
    /// A second gateway over the same backends, with caches of its own
    pub async fn peer(&self) -> Arc<Gateway> {
        self.peer_with(test_config()).await
    }

    pub async fn peer_with(&self, config: Config) -> Arc<Gateway> {
        let subscribed = self.bus.subscriber_count();
        let gateway = Arc::new(Gateway::new(self.gateway.backends.clone(), &config));
        gateway.start(&self.shutdown).await.unwrap();

        let bus = Arc::clone(&self.bus);
        eventually("peer change subscriber", || bus.subscriber_count() > subscribed).await;

        gateway
    }
}

impl Drop for World {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Defaults with a short resubscribe backoff
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.sync.reconnect_backoff = Duration::from_millis(20);
    config
}
