//! External collaborators of the gateway core
//!
//! - [`Store`]: the source of truth, a document store queried by collection
//! - [`Counters`]: fast counters for quota mirrors, daily error counts and
//!   usage snapshots
//! - [`Bus`]: the change-notification channel between instances
//!
//! Each has an in-memory backend (single instance, tests) and a Redis
//! backend shared by every gateway instance.

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

pub mod backend;
mod error;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};
use switchyard_config::StorageConfig;
use switchyard_core::{ChangeAction, ChangeMessage, Channel, Entity, EntityKind};

pub use error::StoreError;

/// Fields maintained by atomic increments rather than document writes
pub const COUNTER_FIELDS: [&str; 2] = ["quota", "used_quota"];

/// Document store holding every entity collection
#[async_trait]
pub trait Store: Send + Sync {
    /// Point lookup by id
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Value>, StoreError>;

    /// Lookup by a secondary key listed in [`EntityKind::indexed_fields`]
    async fn find(&self, kind: EntityKind, field: &str, value: &str) -> Result<Option<Value>, StoreError>;

    /// Every document in a collection
    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, StoreError>;

    /// Documents for a set of ids; missing ids are skipped
    async fn list_by_ids(&self, kind: EntityKind, ids: &[String]) -> Result<Vec<Value>, StoreError>;

    /// Create or replace a document
    ///
    /// Replacing keeps the stored [`COUNTER_FIELDS`]: balances only change
    /// through [`Store::increment`] or an explicit [`Store::patch`].
    async fn put(&self, kind: EntityKind, id: &str, doc: Value) -> Result<(), StoreError>;

    /// Merge top-level fields into an existing document
    ///
    /// Balance fields are rewritten only when `fields` names them.
    async fn patch(&self, kind: EntityKind, id: &str, fields: Map<String, Value>) -> Result<(), StoreError>;

    /// Remove a document
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError>;

    /// Atomically add each delta to its numeric field, returning the post-update values in order
    async fn increment(&self, kind: EntityKind, id: &str, deltas: &[(&str, i64)]) -> Result<Vec<i64>, StoreError>;
}

/// Typed access on top of the raw document interface
impl dyn Store {
    pub async fn load<T: Entity>(&self, id: &str) -> Result<Option<T>, StoreError> {
        self.get(T::KIND, id).await?.map(decode::<T>).transpose()
    }

    pub async fn load_by<T: Entity>(&self, field: &str, value: &str) -> Result<Option<T>, StoreError> {
        self.find(T::KIND, field, value).await?.map(decode::<T>).transpose()
    }

    pub async fn load_all<T: Entity>(&self) -> Result<Vec<T>, StoreError> {
        self.list(T::KIND).await?.into_iter().map(decode::<T>).collect()
    }

    pub async fn load_many<T: Entity>(&self, ids: &[String]) -> Result<Vec<T>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.list_by_ids(T::KIND, ids).await?.into_iter().map(decode::<T>).collect()
    }

    pub async fn save<T: Entity>(&self, entity: &T) -> Result<(), StoreError> {
        let doc = serde_json::to_value(entity).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.put(T::KIND, entity.id(), doc).await
    }
}

/// Carry the balance fields of `stored` over into `doc`
fn keep_balances(doc: &mut Value, stored: &Value) {
    let Some(object) = doc.as_object_mut() else {
        return;
    };
    for field in COUNTER_FIELDS {
        if let Some(value) = stored.get(field) {
            object.insert(field.to_owned(), value.clone());
        }
    }
}

fn decode<T: Entity>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode {
        kind: T::KIND,
        message: e.to_string(),
    })
}

/// Fast key-value counters
#[async_trait]
pub trait Counters: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError>;

    /// Atomically add `by` and make the key expire at the given unix second
    async fn incr_expire_at(&self, key: &str, by: i64, expire_at: i64) -> Result<i64, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically add `by` to a hash field
    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<i64>, StoreError>;
}

/// Stream of `(channel, message)` pairs from a subscription
///
/// The stream ends when the underlying connection is lost.
pub type ChangeStream = BoxStream<'static, Result<(Channel, ChangeMessage), StoreError>>;

/// Publish/subscribe channel for change notifications
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: Channel, message: &ChangeMessage) -> Result<(), StoreError>;

    async fn subscribe(&self, channels: &[Channel]) -> Result<ChangeStream, StoreError>;
}

impl dyn Bus {
    /// Publish a typed before/after pair on the entity's own channel
    pub async fn announce<T: Entity>(&self, action: ChangeAction, old: Option<&T>, new: Option<&T>) -> Result<(), StoreError> {
        let message = ChangeMessage::of(action, old, new).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.publish(Channel::Entity(T::KIND), &message).await
    }
}

/// The three collaborators wired from one storage configuration
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn Store>,
    pub counters: Arc<dyn Counters>,
    pub bus: Arc<dyn Bus>,
}

impl Backends {
    /// Process-local backends
    pub fn memory() -> Self {
        Self {
            store: Arc::new(backend::memory::MemoryStore::new()),
            counters: Arc::new(backend::memory::MemoryCounters::new()),
            bus: Arc::new(backend::memory::MemoryBus::new()),
        }
    }

    /// Connect the backends named by configuration
    pub async fn connect(config: &StorageConfig) -> Result<Self, StoreError> {
        match config {
            StorageConfig::Memory => {
                tracing::warn!("using in-memory storage, caches will not be shared between instances");
                Ok(Self::memory())
            }
            StorageConfig::Redis(redis_config) => {
                let connection =
                    backend::redis::RedisConnection::connect(redis_config.url.as_str(), &redis_config.key_prefix)
                        .await?;
                tracing::info!(prefix = %redis_config.key_prefix, "connected to redis storage");

                Ok(Self {
                    store: Arc::new(backend::redis::RedisStore::new(connection.clone())),
                    counters: Arc::new(backend::redis::RedisCounters::new(connection.clone())),
                    bus: Arc::new(backend::redis::RedisBus::new(connection)),
                })
            }
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}
