//! Day-aligned error counting and automatic disabling of failing backends

use std::sync::Arc;

use serde_json::{Map, Value};
use switchyard_cache::{Cached, Registry};
use switchyard_config::BreakerConfig;
use switchyard_core::{ChangeAction, Entity, GatewayError, Key, ModelAgent, Status, clock};
use switchyard_store::{Bus, Counters};

/// A backend the breaker can quarantine
pub trait Breakable: Cached {
    fn is_never_disable(&self) -> bool;

    fn is_enabled(&self) -> bool;

    /// Copy of this entity, auto-disabled for `reason`
    fn auto_disabled(&self, reason: &str) -> Self;
}

macro_rules! breakable {
    ($($ty:ty),+) => {
        $(
            impl Breakable for $ty {
                fn is_never_disable(&self) -> bool {
                    self.is_never_disable
                }

                fn is_enabled(&self) -> bool {
                    self.status.is_enabled()
                }

                fn auto_disabled(&self, reason: &str) -> Self {
                    Self {
                        status: Status::Disabled,
                        is_auto_disabled: true,
                        auto_disabled_reason: Some(reason.to_owned()),
                        ..self.clone()
                    }
                }
            }
        )+
    };
}

breakable!(ModelAgent, Key);

/// Counter key holding today's error count for an entity
pub fn error_counter_key<T: Entity>(id: &str) -> String {
    format!("errors:{}:{id}", T::KIND)
}

/// Circuit breaker over agents and keys
///
/// Errors are counted per entity per local calendar day in the shared
/// counters, so every instance contributes to the same threshold.
pub struct Breaker {
    registry: Arc<Registry>,
    counters: Arc<dyn Counters>,
    bus: Arc<dyn Bus>,
    config: BreakerConfig,
}

impl std::fmt::Debug for Breaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Breaker").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Breaker {
    pub fn new(registry: Arc<Registry>, counters: Arc<dyn Counters>, bus: Arc<dyn Bus>, config: BreakerConfig) -> Self {
        Self {
            registry,
            counters,
            bus,
            config,
        }
    }

    /// Count an agent failure; returns whether this call disabled the agent
    pub async fn record_error(&self, agent_id: &str, reason: &str) -> Result<bool, GatewayError> {
        self.record::<ModelAgent>(agent_id, reason, self.config.agent_error_threshold)
            .await
    }

    /// Count a key failure; returns whether this call disabled the key
    pub async fn record_error_key(&self, key_id: &str, reason: &str) -> Result<bool, GatewayError> {
        self.record::<Key>(key_id, reason, self.config.key_error_threshold).await
    }

    /// Forget today's errors for an entity, e.g. after an admin re-enables it
    pub async fn clear<T: Entity>(&self, id: &str) -> Result<(), GatewayError> {
        self.counters.delete(&error_counter_key::<T>(id)).await?;
        Ok(())
    }

    async fn record<T: Breakable>(&self, id: &str, reason: &str, threshold: u64) -> Result<bool, GatewayError> {
        let count = self
            .counters
            .incr_expire_at(&error_counter_key::<T>(id), 1, clock::next_midnight())
            .await?;

        // The shared counter crosses the threshold exactly once per day, so
        // only the increment landing on it may flip, whichever instance made it
        let reached = threshold > 0 && u64::try_from(count).is_ok_and(|count| count == threshold);
        if !reached {
            tracing::debug!(kind = %T::KIND, id, count, "backend error recorded");
            return Ok(false);
        }

        if self.registry.get_or_load::<T>(id).await?.is_none() {
            return Ok(false);
        }

        let flipped = T::cache(&self.registry).try_update(id, |current| {
            (current.is_enabled() && !current.is_never_disable()).then(|| current.auto_disabled(reason))
        });

        let Some((previous, disabled)) = flipped else {
            tracing::debug!(kind = %T::KIND, id, count, "threshold reached, entity already disabled or immune");
            return Ok(false);
        };

        tracing::warn!(kind = %T::KIND, id, count, threshold, reason, "auto-disabling backend");

        let mut fields = Map::new();
        fields.insert("status".to_owned(), Value::from(i32::from(Status::Disabled)));
        fields.insert("is_auto_disabled".to_owned(), Value::Bool(true));
        fields.insert("auto_disabled_reason".to_owned(), Value::from(reason));
        self.registry.store().patch(T::KIND, id, fields).await?;

        self.bus
            .announce::<T>(ChangeAction::Status, Some(&*previous), Some(&*disabled))
            .await?;

        Ok(true)
    }
}
