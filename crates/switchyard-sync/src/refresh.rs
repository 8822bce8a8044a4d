use switchyard_cache::Snapshot;
use switchyard_core::{
    App, AppKey, Corp, EntityKind, GatewayError, Group, Key, Model, ModelAgent, Provider, QuotaHolder, Reseller, User,
};

use crate::SyncFabric;

impl SyncFabric {
    /// Reload every collection from the store and swap it into the caches
    ///
    /// Refreshes are serialized; a caller arriving during a refresh waits
    /// for it and then runs its own. Returns the number of entities loaded.
    pub async fn full_refresh(&self) -> Result<usize, GatewayError> {
        let _guard = self.refresh_lock.lock().await;
        let started = std::time::Instant::now();

        let store = self.registry.store();
        let (users, resellers, apps, app_keys, models) = tokio::try_join!(
            store.load_all::<User>(),
            store.load_all::<Reseller>(),
            store.load_all::<App>(),
            store.load_all::<AppKey>(),
            store.load_all::<Model>(),
        )?;
        let (agents, keys, groups, providers, corps) = tokio::try_join!(
            store.load_all::<ModelAgent>(),
            store.load_all::<Key>(),
            store.load_all::<Group>(),
            store.load_all::<Provider>(),
            store.load_all::<Corp>(),
        )?;

        let snapshot = Snapshot {
            users,
            resellers,
            apps,
            app_keys,
            models,
            agents,
            keys,
            groups,
            providers,
            corps,
        };

        let mut balances = Vec::new();
        collect_balances(&mut balances, &snapshot.users);
        collect_balances(&mut balances, &snapshot.resellers);
        collect_balances(&mut balances, &snapshot.apps);
        collect_balances(&mut balances, &snapshot.app_keys);
        collect_balances(&mut balances, &snapshot.groups);

        let total = snapshot.users.len()
            + snapshot.resellers.len()
            + snapshot.apps.len()
            + snapshot.app_keys.len()
            + snapshot.models.len()
            + snapshot.agents.len()
            + snapshot.keys.len()
            + snapshot.groups.len()
            + snapshot.providers.len()
            + snapshot.corps.len();

        self.registry.install(snapshot);

        for (kind, id, quota) in balances {
            if let Err(e) = self.ledger.mirror(kind, &id, quota).await {
                tracing::warn!(%kind, id, error = %e, "failed to seed quota mirror");
            }
        }

        tracing::info!(
            entities = total,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "full cache refresh complete"
        );
        Ok(total)
    }
}

fn collect_balances<T: QuotaHolder>(balances: &mut Vec<(EntityKind, String, i64)>, entities: &[T]) {
    balances.extend(
        entities
            .iter()
            .filter(|e| e.is_quota_limited())
            .map(|e| (T::KIND, e.id().to_owned(), e.quota())),
    );
}
