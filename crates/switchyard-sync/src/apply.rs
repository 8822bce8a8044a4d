use std::sync::Arc;

use switchyard_cache::Cached;
use switchyard_core::{
    App, AppKey, ChangeAction, ChangeMessage, Channel, Corp, Entity, EntityKind, GatewayError, Group, Key, Model,
    ModelAgent, Provider, QuotaHolder, Reseller, User,
};
use switchyard_routing::Breakable;

use crate::SyncFabric;

/// Cached state of one entity before and after a notification was applied
#[derive(Debug)]
pub struct Change<T> {
    pub previous: Option<Arc<T>>,
    pub current: Option<Arc<T>>,
}

impl SyncFabric {
    /// Apply one change notification to the local caches
    ///
    /// A message on the `config` channel triggers a full refresh. Unknown
    /// actions are ignored so that newer publishers do not break older
    /// subscribers.
    pub async fn apply(&self, channel: Channel, message: &ChangeMessage) -> Result<(), GatewayError> {
        let kind = match channel {
            Channel::Config => {
                tracing::info!(action = ?message.action, "configuration changed, refreshing caches");
                self.full_refresh().await?;
                return Ok(());
            }
            Channel::Entity(kind) => kind,
        };

        if message.action == ChangeAction::Unknown {
            tracing::debug!(%kind, "ignoring change with unknown action");
            return Ok(());
        }

        match kind {
            EntityKind::User => {
                let change = self.apply_cached::<User>(message).await?;
                self.remirror(change.as_ref()).await;
            }
            EntityKind::Reseller => {
                let change = self.apply_cached::<Reseller>(message).await?;
                self.remirror(change.as_ref()).await;
            }
            EntityKind::App => {
                let change = self.apply_cached::<App>(message).await?;
                self.remirror(change.as_ref()).await;
            }
            EntityKind::Group => {
                let change = self.apply_cached::<Group>(message).await?;
                self.remirror(change.as_ref()).await;
            }
            EntityKind::AppKey => {
                let change = self.apply_app_key(message).await?;
                self.remirror(change.as_ref()).await;
            }
            EntityKind::Agent => {
                let change = self.apply_cached::<ModelAgent>(message).await?;
                self.clear_if_reenabled(message, change.as_ref()).await;
            }
            EntityKind::Key => {
                let change = self.apply_cached::<Key>(message).await?;
                self.clear_if_reenabled(message, change.as_ref()).await;
            }
            EntityKind::Model => {
                self.apply_cached::<Model>(message).await?;
            }
            EntityKind::Provider => {
                self.apply_cached::<Provider>(message).await?;
            }
            EntityKind::Corp => {
                self.apply_cached::<Corp>(message).await?;
            }
        }

        Ok(())
    }

    async fn apply_cached<T: Cached>(&self, message: &ChangeMessage) -> Result<Option<Change<T>>, GatewayError> {
        let Some(id) = message.entity_id().map(str::to_owned) else {
            tracing::warn!(kind = %T::KIND, action = ?message.action, "change message carries no entity id");
            return Ok(None);
        };

        let previous = self.registry.cached::<T>(&id);
        let current = match message.action {
            ChangeAction::Create | ChangeAction::Update | ChangeAction::Status | ChangeAction::Models => {
                match message.new_entity::<T>() {
                    Ok(Some(entity)) => Some(self.registry.put(entity)),
                    Ok(None) => self.reload::<T>(&id).await?,
                    Err(e) => {
                        tracing::warn!(kind = %T::KIND, id, error = %e, "undecodable payload, reloading from store");
                        self.reload::<T>(&id).await?
                    }
                }
            }
            ChangeAction::Delete => {
                self.registry.remove::<T>(&id);
                None
            }
            ChangeAction::Cache => self.reload::<T>(&id).await?,
            ChangeAction::Unknown => return Ok(None),
        };

        tracing::debug!(kind = %T::KIND, id, action = ?message.action, present = current.is_some(), "change applied");
        Ok(Some(Change { previous, current }))
    }

    async fn reload<T: Cached>(&self, id: &str) -> Result<Option<Arc<T>>, GatewayError> {
        match self.registry.store().load::<T>(id).await? {
            Some(entity) => Ok(Some(self.registry.put(entity))),
            None => {
                self.registry.remove::<T>(id);
                Ok(None)
            }
        }
    }

    /// App keys are cached by secret digest, so they take their own path
    async fn apply_app_key(&self, message: &ChangeMessage) -> Result<Option<Change<AppKey>>, GatewayError> {
        let Some(id) = message.entity_id().map(str::to_owned) else {
            tracing::warn!(action = ?message.action, "app key change carries no id");
            return Ok(None);
        };

        let previous = self.registry.app_key(&id);
        let current = match message.action {
            ChangeAction::Create | ChangeAction::Update | ChangeAction::Status | ChangeAction::Models => {
                match message.new_entity::<AppKey>() {
                    Ok(Some(app_key)) => Some(self.registry.put_app_key(app_key)),
                    Ok(None) => self.reload_app_key(&id).await?,
                    Err(e) => {
                        tracing::warn!(id, error = %e, "undecodable app key payload, reloading from store");
                        self.reload_app_key(&id).await?
                    }
                }
            }
            ChangeAction::Delete => {
                self.registry.remove_app_key(&id);
                None
            }
            ChangeAction::Cache => self.reload_app_key(&id).await?,
            ChangeAction::Unknown => return Ok(None),
        };

        Ok(Some(Change { previous, current }))
    }

    async fn reload_app_key(&self, id: &str) -> Result<Option<Arc<AppKey>>, GatewayError> {
        match self.registry.store().load::<AppKey>(id).await? {
            Some(app_key) => Ok(Some(self.registry.put_app_key(app_key))),
            None => {
                self.registry.remove_app_key(id);
                Ok(None)
            }
        }
    }

    async fn remirror<T: QuotaHolder>(&self, change: Option<&Change<T>>) {
        let Some(current) = change.and_then(|c| c.current.as_ref()) else {
            return;
        };
        if !current.is_quota_limited() {
            return;
        }

        if let Err(e) = self.ledger.mirror(T::KIND, current.id(), current.quota()).await {
            tracing::warn!(kind = %T::KIND, id = current.id(), error = %e, "failed to refresh quota mirror");
        }
    }

    /// Forget today's error count when an operator brings a backend back
    async fn clear_if_reenabled<T: Breakable>(&self, message: &ChangeMessage, change: Option<&Change<T>>) {
        let Some(current) = change.and_then(|c| c.current.as_ref()) else {
            return;
        };
        if !current.is_enabled() {
            return;
        }

        let was_enabled = match change.and_then(|c| c.previous.as_ref()) {
            Some(previous) => previous.is_enabled(),
            None => message
                .old_data
                .clone()
                .and_then(|old| serde_json::from_value::<T>(old).ok())
                .is_none_or(|old| old.is_enabled()),
        };
        if was_enabled {
            return;
        }

        tracing::info!(kind = %T::KIND, id = current.id(), "backend re-enabled, clearing error count");
        if let Err(e) = self.breaker.clear::<T>(current.id()).await {
            tracing::warn!(kind = %T::KIND, id = current.id(), error = %e, "failed to clear error count");
        }
    }
}
