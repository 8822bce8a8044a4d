//! Quota ledger
//!
//! Balances live in the store and change only through atomic increments.
//! Every spend writes the post-spend balance back into the fast-counter
//! mirror and the cached entity, and adds to the day's usage snapshot.

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

use std::sync::Arc;

use switchyard_cache::Registry;
use switchyard_core::{App, AppKey, EntityKind, GatewayError, Group, QuotaHolder, Reseller, Session, User, clock};
use switchyard_store::Counters;

/// Balance of one entity after a spend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    pub quota: i64,
    pub used_quota: i64,
}

/// Fast-counter key mirroring an entity's remaining quota
pub fn mirror_key(kind: EntityKind, id: &str) -> String {
    format!("quota:{kind}:{id}")
}

/// Hash key holding one local day's spend per entity
pub fn usage_key(day: &str) -> String {
    format!("usage:{day}")
}

const fn carries_quota(kind: EntityKind) -> bool {
    matches!(
        kind,
        EntityKind::User | EntityKind::Reseller | EntityKind::App | EntityKind::AppKey | EntityKind::Group
    )
}

fn rebalanced<T: QuotaHolder>(balance: Balance) -> impl FnOnce(&T) -> T {
    move |current| {
        let mut next = current.clone();
        next.apply_balance(balance.quota, balance.used_quota);
        next
    }
}

#[derive(Clone)]
pub struct QuotaLedger {
    registry: Arc<Registry>,
    counters: Arc<dyn Counters>,
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger").finish_non_exhaustive()
    }
}

impl QuotaLedger {
    pub fn new(registry: Arc<Registry>, counters: Arc<dyn Counters>) -> Self {
        Self { registry, counters }
    }

    /// Atomically move `delta` from `quota` to `used_quota`
    ///
    /// The store applies the increment; the returned balance is then
    /// written to the mirror and the cache, so concurrent spends on any
    /// instance never lose an update.
    pub async fn spend_quota(&self, kind: EntityKind, id: &str, delta: i64) -> Result<Balance, GatewayError> {
        if !carries_quota(kind) {
            return Err(GatewayError::Config(format!("{kind} does not carry a quota")));
        }

        let values = self
            .registry
            .store()
            .increment(kind, id, &[("quota", -delta), ("used_quota", delta)])
            .await?;
        let [quota, used_quota] = values[..] else {
            return Err(GatewayError::Storage(format!(
                "increment on {kind} `{id}` returned {} values",
                values.len()
            )));
        };
        let balance = Balance { quota, used_quota };

        self.counters.set(&mirror_key(kind, id), quota).await?;
        self.apply(kind, id, balance);

        if let Err(e) = self
            .counters
            .hincr(&usage_key(&clock::day_stamp()), &format!("{kind}:{id}"), delta)
            .await
        {
            tracing::warn!(%kind, id, error = %e, "failed to record daily usage");
        }

        tracing::debug!(%kind, id, delta, quota, used_quota, "quota spent");
        Ok(balance)
    }

    fn apply(&self, kind: EntityKind, id: &str, balance: Balance) {
        match kind {
            EntityKind::User => {
                self.registry.users.update(id, rebalanced::<User>(balance));
            }
            EntityKind::Reseller => {
                self.registry.resellers.update(id, rebalanced::<Reseller>(balance));
            }
            EntityKind::App => {
                self.registry.apps.update(id, rebalanced::<App>(balance));
            }
            EntityKind::AppKey => {
                self.registry.update_app_key(id, rebalanced::<AppKey>(balance));
            }
            EntityKind::Group => {
                self.registry.groups.update(id, rebalanced::<Group>(balance));
            }
            _ => {}
        }
    }

    /// Remaining quota from the fast counters, else from the cached entity
    pub async fn cache_quota(&self, kind: EntityKind, id: &str) -> Result<Option<i64>, GatewayError> {
        if let Some(quota) = self.counters.get(&mirror_key(kind, id)).await? {
            return Ok(Some(quota));
        }

        Ok(match kind {
            EntityKind::User => self.registry.users.get(id).map(|u| u.quota),
            EntityKind::Reseller => self.registry.resellers.get(id).map(|r| r.quota),
            EntityKind::App => self.registry.apps.get(id).map(|a| a.quota),
            EntityKind::AppKey => self.registry.app_key(id).map(|k| k.quota),
            EntityKind::Group => self.registry.groups.get(id).map(|g| g.quota),
            _ => None,
        })
    }

    /// Remaining quota as every instance sees it
    ///
    /// Reads the shared mirror so spends made elsewhere count before this
    /// instance's cache catches up. An unreachable mirror falls back to
    /// the cached balance.
    pub async fn remaining<T: QuotaHolder>(&self, entity: &T) -> i64 {
        match self.counters.get(&mirror_key(T::KIND, entity.id())).await {
            Ok(Some(quota)) => quota,
            Ok(None) => entity.quota(),
            Err(e) => {
                tracing::warn!(kind = %T::KIND, id = entity.id(), error = %e, "quota mirror unavailable, using cached balance");
                entity.quota()
            }
        }
    }

    /// Whether the entity may still spend: unlimited, or a positive remaining quota
    pub async fn has_quota<T: QuotaHolder>(&self, entity: &T) -> bool {
        !entity.is_quota_limited() || self.remaining(entity).await > 0
    }

    /// Seed the fast-counter mirror for an entity
    pub async fn mirror(&self, kind: EntityKind, id: &str, quota: i64) -> Result<(), GatewayError> {
        self.counters.set(&mirror_key(kind, id), quota).await?;
        Ok(())
    }

    /// Spend across the resolved credential chain
    ///
    /// The user is always charged; the app key, app and group only when
    /// their quota is limited; the reseller when the user has one. Every
    /// charge is attempted and the first failure is returned.
    pub async fn spend_session(&self, session: &Session, group: Option<&Group>, delta: i64) -> Result<(), GatewayError> {
        if delta == 0 {
            return Ok(());
        }

        let mut charges: Vec<(EntityKind, &str)> = Vec::with_capacity(5);
        if session.app_key.is_quota_limited() {
            charges.push((EntityKind::AppKey, session.app_key.id.as_str()));
        }
        if session.app.is_quota_limited() {
            charges.push((EntityKind::App, session.app.id.as_str()));
        }
        charges.push((EntityKind::User, session.user.id.as_str()));
        if let Some(reseller) = &session.reseller {
            charges.push((EntityKind::Reseller, reseller.id.as_str()));
        }
        if let Some(group) = group
            && group.is_quota_limited()
        {
            charges.push((EntityKind::Group, group.id.as_str()));
        }

        let mut first_error = None;
        for (kind, id) in charges {
            if let Err(e) = self.spend_quota(kind, id, delta).await {
                tracing::error!(%kind, id, delta, error = %e, "quota spend failed");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}
