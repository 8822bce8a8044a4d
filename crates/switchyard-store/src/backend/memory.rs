//! Process-local backends
//!
//! Used for single-instance deployments and as the injected fake in
//! tests. The bus can be disconnected on demand to exercise the
//! subscriber's reconnect path.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::{StreamExt, future, stream};
use serde_json::{Map, Value};
use switchyard_core::{ChangeMessage, Channel, EntityKind, clock};
use tokio::sync::broadcast;

use crate::{Bus, ChangeStream, Counters, Store, StoreError, keep_balances};

/// In-memory document store
///
/// Increments take the per-document entry lock, so concurrent spends
/// against the same document never lose updates.
#[derive(Default)]
pub struct MemoryStore {
    docs: DashMap<(EntityKind, String), Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(&self, kind: EntityKind) -> Vec<(String, Value)> {
        let mut docs: Vec<(String, Value)> = self
            .docs
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        docs
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.docs.get(&(kind, id.to_owned())).map(|doc| doc.value().clone()))
    }

    async fn find(&self, kind: EntityKind, field: &str, value: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .sorted(kind)
            .into_iter()
            .map(|(_, doc)| doc)
            .find(|doc| doc.get(field).and_then(Value::as_str) == Some(value)))
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, StoreError> {
        Ok(self.sorted(kind).into_iter().map(|(_, doc)| doc).collect())
    }

    async fn list_by_ids(&self, kind: EntityKind, ids: &[String]) -> Result<Vec<Value>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.docs.get(&(kind, id.clone())).map(|doc| doc.value().clone()))
            .collect())
    }

    async fn put(&self, kind: EntityKind, id: &str, mut doc: Value) -> Result<(), StoreError> {
        match self.docs.entry((kind, id.to_owned())) {
            Entry::Occupied(mut entry) => {
                keep_balances(&mut doc, entry.get());
                entry.insert(doc);
            }
            Entry::Vacant(entry) => {
                entry.insert(doc);
            }
        }
        Ok(())
    }

    async fn patch(&self, kind: EntityKind, id: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let mut doc = self.docs.get_mut(&(kind, id.to_owned())).ok_or_else(|| StoreError::NotFound {
            kind,
            id: id.to_owned(),
        })?;

        let Some(object) = doc.as_object_mut() else {
            return Err(StoreError::Decode {
                kind,
                message: format!("document `{id}` is not an object"),
            });
        };
        object.extend(fields);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        self.docs.remove(&(kind, id.to_owned()));
        Ok(())
    }

    async fn increment(&self, kind: EntityKind, id: &str, deltas: &[(&str, i64)]) -> Result<Vec<i64>, StoreError> {
        let mut doc = self.docs.get_mut(&(kind, id.to_owned())).ok_or_else(|| StoreError::NotFound {
            kind,
            id: id.to_owned(),
        })?;

        let Some(object) = doc.as_object_mut() else {
            return Err(StoreError::Decode {
                kind,
                message: format!("document `{id}` is not an object"),
            });
        };

        let mut results = Vec::with_capacity(deltas.len());
        for (field, delta) in deltas {
            let current = object.get(*field).and_then(Value::as_i64).unwrap_or(0);
            let next = current + delta;
            object.insert((*field).to_owned(), Value::from(next));
            results.push(next);
        }

        Ok(results)
    }
}

/// In-memory counters with expire-at semantics
#[derive(Default)]
pub struct MemoryCounters {
    values: DashMap<String, Counter>,
    hashes: DashMap<(String, String), i64>,
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: i64,
    /// Unix seconds, `None` for no expiry
    expire_at: Option<i64>,
}

impl Counter {
    fn is_live(self, now: i64) -> bool {
        self.expire_at.is_none_or(|at| at > now)
    }
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Counters for MemoryCounters {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = clock::now_secs();
        Ok(self
            .values
            .get(key)
            .map(|c| *c.value())
            .filter(|c| c.is_live(now))
            .map(|c| c.value))
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.values.insert(key.to_owned(), Counter { value, expire_at: None });
        Ok(())
    }

    async fn incr_expire_at(&self, key: &str, by: i64, expire_at: i64) -> Result<i64, StoreError> {
        let now = clock::now_secs();
        let mut counter = self.values.entry(key.to_owned()).or_insert(Counter {
            value: 0,
            expire_at: None,
        });

        if !counter.is_live(now) {
            counter.value = 0;
        }
        counter.value += by;
        counter.expire_at = Some(expire_at);

        Ok(counter.value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut value = self.hashes.entry((key.to_owned(), field.to_owned())).or_insert(0);
        *value += by;
        Ok(*value)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.hashes.get(&(key.to_owned(), field.to_owned())).map(|v| *v.value()))
    }
}

const BUS_CAPACITY: usize = 1024;

/// In-memory change bus backed by a broadcast channel
pub struct MemoryBus {
    sender: Mutex<broadcast::Sender<(Channel, ChangeMessage)>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            sender: Mutex::new(sender),
        }
    }

    /// Drop every live subscription, ending their streams
    pub fn disconnect_all(&self) {
        let (fresh, _) = broadcast::channel(BUS_CAPACITY);
        let mut sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        *sender = fresh;
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).receiver_count()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: Channel, message: &ChangeMessage) -> Result<(), StoreError> {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        // No subscribers is not an error for a broadcast
        let _ = sender.send((channel, message.clone()));
        Ok(())
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<ChangeStream, StoreError> {
        let receiver = self.sender.lock().unwrap_or_else(|e| e.into_inner()).subscribe();
        let wanted: HashSet<Channel> = channels.iter().copied().collect();

        let stream = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(item) => Some((Ok(item), receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Some((
                    Err(StoreError::Bus(format!("subscriber lagged, {skipped} messages skipped"))),
                    receiver,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .filter(move |item| {
            future::ready(match item {
                Ok((channel, _)) => wanted.contains(channel),
                Err(_) => true,
            })
        });

        Ok(stream.boxed())
    }
}
