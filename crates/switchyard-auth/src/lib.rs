//! Credential chain resolution
//!
//! A presented secret resolves to an app key, which is checked and then
//! followed to its user, the user's reseller and the owning app. The first
//! failing check aborts the chain with its own error kind.

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

pub mod ip;

use std::net::IpAddr;
use std::sync::Arc;

use mini_moka::sync::Cache;
use serde_json::{Map, Value};
use switchyard_cache::{Registry, secret_digest};
use switchyard_config::AuthConfig;
use switchyard_core::{
    App, AppKey, ChangeAction, EntityKind, GatewayError, QuotaHolder, RequestScope, Session, Status, User, clock,
};
use switchyard_quota::QuotaLedger;
use switchyard_store::Bus;

/// Resolves secrets into authenticated sessions
pub struct Authenticator {
    registry: Arc<Registry>,
    bus: Arc<dyn Bus>,
    ledger: QuotaLedger,
    /// Digests of secrets recently found to match no app key
    rejected: Cache<String, ()>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("rejected", &self.rejected.entry_count())
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(registry: Arc<Registry>, bus: Arc<dyn Bus>, ledger: QuotaLedger, config: &AuthConfig) -> Self {
        let rejected = Cache::builder()
            .time_to_live(config.negative_cache_ttl)
            .max_capacity(config.negative_cache_capacity)
            .build();

        Self {
            registry,
            bus,
            ledger,
            rejected,
        }
    }

    /// Resolve and check the full credential chain for `secret`
    pub async fn authenticate(&self, secret: &str, client_ip: Option<IpAddr>) -> Result<Session, GatewayError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(GatewayError::InvalidCredential);
        }

        let digest = secret_digest(secret);
        if self.rejected.contains_key(&digest) {
            return Err(GatewayError::InvalidCredential);
        }

        let Some(app_key) = self.registry.app_key_by_secret(secret).await? else {
            tracing::debug!("unknown secret presented");
            self.rejected.insert(digest, ());
            return Err(GatewayError::InvalidCredential);
        };

        let now = clock::now_secs();

        check_status(EntityKind::AppKey, app_key.status)?;
        ip::check(client_ip, &app_key.ip_whitelist, &app_key.ip_blacklist)?;
        self.check_balance(app_key.as_ref(), now).await?;

        let Some(user) = self.registry.get_or_load::<User>(&app_key.user_id).await? else {
            tracing::warn!(app_key = %app_key.id, user = %app_key.user_id, "app key references a missing user");
            return Err(GatewayError::InvalidCredential);
        };
        check_status(EntityKind::User, user.status)?;
        self.check_balance(user.as_ref(), now).await?;

        let reseller = self.registry.reseller_for(&user).await?;
        if let Some(rid) = user.rid.as_deref().filter(|rid| !rid.is_empty()) {
            let Some(reseller) = &reseller else {
                tracing::warn!(user = %user.id, rid, "user references a missing reseller");
                return Err(GatewayError::InvalidCredential);
            };
            check_status(EntityKind::Reseller, reseller.status)?;
            self.check_balance(reseller.as_ref(), now).await?;
        }

        let Some(app) = self.registry.get_or_load::<App>(&app_key.app_id).await? else {
            tracing::warn!(app_key = %app_key.id, app = %app_key.app_id, "app key references a missing app");
            return Err(GatewayError::InvalidCredential);
        };
        check_status(EntityKind::App, app.status)?;
        ip::check(client_ip, &app.ip_whitelist, &app.ip_blacklist)?;
        self.check_balance(app.as_ref(), now).await?;

        let app_key = if app_key.awaits_first_use() {
            self.start_rolling_expiry(&digest, app_key, now).await?
        } else {
            app_key
        };

        tracing::debug!(app_key = %app_key.id, user = %user.id, app = %app.id, "credential chain resolved");

        Ok(Session {
            user,
            app,
            app_key,
            reseller,
            client_ip,
            scope: RequestScope::default(),
        })
    }

    /// Forget that a secret was rejected, e.g. right after the key is created
    pub fn forget_rejection(&self, secret: &str) {
        self.rejected.invalidate(&secret_digest(secret.trim()));
    }

    /// Turn a "minutes after first use" expiry into a fixed timestamp
    ///
    /// Only the caller that wins the cache swap persists and publishes the
    /// new expiry; concurrent first uses on this instance see its result.
    async fn start_rolling_expiry(
        &self,
        digest: &str,
        app_key: Arc<AppKey>,
        now: i64,
    ) -> Result<Arc<AppKey>, GatewayError> {
        let expires_at = now.saturating_add(app_key.quota_expires_minutes.saturating_mul(60));

        let swapped = self.registry.app_keys.try_update(digest, |current| {
            current.awaits_first_use().then(|| AppKey {
                quota_expires_at: expires_at,
                ..current.clone()
            })
        });

        let Some((previous, started)) = swapped else {
            return Ok(self.registry.app_keys.get(digest).unwrap_or(app_key));
        };

        let mut fields = Map::new();
        fields.insert("quota_expires_at".to_owned(), Value::from(expires_at));
        self.registry.store().patch(EntityKind::AppKey, &started.id, fields).await?;

        tracing::info!(app_key = %started.id, expires_at, "rolling quota expiry started");

        if let Err(e) = self
            .bus
            .announce::<AppKey>(ChangeAction::Update, Some(&*previous), Some(&*started))
            .await
        {
            tracing::warn!(app_key = %started.id, error = %e, "failed to publish app key expiry");
        }

        Ok(started)
    }

    /// Balance and expiry checks shared by every link of the chain
    ///
    /// The balance comes from the shared quota mirror, so a spend on any
    /// instance is seen here before the cached entity catches up. A passed
    /// `quota_expires_at` is a quota expiry for quota-limited entities and
    /// a credential expiry for the rest.
    async fn check_balance<T: QuotaHolder>(&self, entity: &T, now: i64) -> Result<(), GatewayError> {
        if !self.ledger.has_quota(entity).await {
            return Err(GatewayError::QuotaExhausted { entity: T::KIND });
        }

        let expires_at = entity.quota_expires_at();
        if expires_at > 0 && expires_at <= now {
            return Err(if entity.is_quota_limited() {
                GatewayError::QuotaExpired { entity: T::KIND }
            } else {
                GatewayError::CredentialExpired { entity: T::KIND }
            });
        }

        Ok(())
    }
}

const fn check_status(entity: EntityKind, status: Status) -> Result<(), GatewayError> {
    if status.is_enabled() {
        Ok(())
    } else {
        Err(GatewayError::CredentialDisabled { entity })
    }
}
