//! Redis backends shared by every gateway instance
//!
//! Layout under the configured prefix:
//!
//! - `{prefix}:doc:{kind}` hash of id to JSON document
//! - `{prefix}:idx:{kind}:{field}` hash of secondary value to id
//! - `{prefix}:counter:{kind}:{id}` hash of the balance fields, overlaid on
//!   the document when read so increments never rewrite JSON
//! - `{prefix}:changes:{channel}` pub/sub channels
//! - `{prefix}:{key}` plain counters

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::{Map, Value};
use switchyard_core::{ChangeMessage, Channel, EntityKind};

use crate::{Bus, COUNTER_FIELDS, ChangeStream, Counters, Store, StoreError, keep_balances};

/// Adds deltas to the counter hash, seeding missing fields from the document
const INCREMENT_SCRIPT: &str = r"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then
  return false
end
local doc = nil
local out = {}
for i = 2, #ARGV, 2 do
  local field = ARGV[i]
  if redis.call('HEXISTS', KEYS[2], field) == 0 then
    doc = doc or cjson.decode(raw)
    redis.call('HSET', KEYS[2], field, tonumber(doc[field]) or 0)
  end
  out[#out + 1] = redis.call('HINCRBY', KEYS[2], field, ARGV[i + 1])
end
return out
";

fn backend(context: &str) -> impl Fn(redis::RedisError) -> StoreError + '_ {
    move |e| StoreError::Backend(format!("{context}: {e}"))
}

/// Shared client and multiplexed connection
#[derive(Clone)]
pub struct RedisConnection {
    client: redis::Client,
    manager: ConnectionManager,
    prefix: Arc<str>,
}

impl RedisConnection {
    /// Open the client and establish the managed connection
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend("failed to open redis client"))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(backend("failed to connect to redis"))?;

        Ok(Self {
            client,
            manager,
            prefix: Arc::from(prefix),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.prefix)
    }
}

/// Document store over Redis hashes
#[derive(Clone)]
pub struct RedisStore {
    connection: RedisConnection,
    increment: redis::Script,
}

impl RedisStore {
    pub fn new(connection: RedisConnection) -> Self {
        Self {
            connection,
            increment: redis::Script::new(INCREMENT_SCRIPT),
        }
    }

    fn doc_key(&self, kind: EntityKind) -> String {
        self.connection.key(&format!("doc:{kind}"))
    }

    fn index_key(&self, kind: EntityKind, field: &str) -> String {
        self.connection.key(&format!("idx:{kind}:{field}"))
    }

    fn counter_key(&self, kind: EntityKind, id: &str) -> String {
        self.connection.key(&format!("counter:{kind}:{id}"))
    }

    fn parse(kind: EntityKind, raw: &str) -> Result<Value, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Decode {
            kind,
            message: e.to_string(),
        })
    }

    fn overlay(doc: &mut Value, counters: &HashMap<String, i64>) {
        if let Some(object) = doc.as_object_mut() {
            for (field, value) in counters {
                object.insert(field.clone(), Value::from(*value));
            }
        }
    }

    async fn read(&self, kind: EntityKind, id: &str) -> Result<Option<Value>, StoreError> {
        let mut conn = self.connection.conn();
        let (raw, counters): (Option<String>, HashMap<String, i64>) = redis::pipe()
            .hget(self.doc_key(kind), id)
            .hgetall(self.counter_key(kind, id))
            .query_async(&mut conn)
            .await
            .map_err(backend("HGET failed"))?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let mut doc = Self::parse(kind, &raw)?;
        Self::overlay(&mut doc, &counters);
        Ok(Some(doc))
    }

    async fn read_many(&self, kind: EntityKind, docs: Vec<(String, String)>) -> Result<Vec<Value>, StoreError> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for (id, _) in &docs {
            pipe.hgetall(self.counter_key(kind, id));
        }

        let mut conn = self.connection.conn();
        let counters: Vec<HashMap<String, i64>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(backend("HGETALL failed"))?;

        docs.into_iter()
            .zip(counters)
            .map(|((_, raw), counters)| {
                let mut doc = Self::parse(kind, &raw)?;
                Self::overlay(&mut doc, &counters);
                Ok(doc)
            })
            .collect()
    }

    /// Write a document together with its index entries
    ///
    /// The counter hash is touched only for the `balances` given; the
    /// increment script owns it otherwise.
    async fn write(
        &self,
        kind: EntityKind,
        id: &str,
        doc: &Value,
        previous: Option<&Value>,
        balances: &[(&str, i64)],
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(doc).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut pipe = redis::pipe();
        pipe.atomic().hset(self.doc_key(kind), id, raw).ignore();

        for field in kind.indexed_fields() {
            let old = previous.and_then(|p| p.get(*field)).and_then(Value::as_str);
            let new = doc.get(*field).and_then(Value::as_str);
            if let Some(old) = old
                && Some(old) != new
            {
                pipe.hdel(self.index_key(kind, field), old).ignore();
            }
            if let Some(new) = new {
                pipe.hset(self.index_key(kind, field), new, id).ignore();
            }
        }

        if !balances.is_empty() {
            pipe.hset_multiple(self.counter_key(kind, id), balances).ignore();
        }

        let mut conn = self.connection.conn();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(backend("document write failed"))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Value>, StoreError> {
        self.read(kind, id).await
    }

    async fn find(&self, kind: EntityKind, field: &str, value: &str) -> Result<Option<Value>, StoreError> {
        if !kind.indexed_fields().contains(&field) {
            // Unindexed lookups fall back to a scan
            return Ok(self
                .list(kind)
                .await?
                .into_iter()
                .find(|doc| doc.get(field).and_then(Value::as_str) == Some(value)));
        }

        let mut conn = self.connection.conn();
        let id: Option<String> = conn
            .hget(self.index_key(kind, field), value)
            .await
            .map_err(backend("index lookup failed"))?;

        match id {
            Some(id) => self.read(kind, &id).await,
            None => Ok(None),
        }
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, StoreError> {
        let mut conn = self.connection.conn();
        let all: HashMap<String, String> = conn
            .hgetall(self.doc_key(kind))
            .await
            .map_err(backend("HGETALL failed"))?;

        let mut docs: Vec<(String, String)> = all.into_iter().collect();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        self.read_many(kind, docs).await
    }

    async fn list_by_ids(&self, kind: EntityKind, ids: &[String]) -> Result<Vec<Value>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.conn();
        let raws: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.doc_key(kind))
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(backend("HMGET failed"))?;

        let docs = ids
            .iter()
            .zip(raws)
            .filter_map(|(id, raw)| raw.map(|raw| (id.clone(), raw)))
            .collect();
        self.read_many(kind, docs).await
    }

    async fn put(&self, kind: EntityKind, id: &str, mut doc: Value) -> Result<(), StoreError> {
        let previous = self.read(kind, id).await?;
        if let Some(previous) = &previous {
            keep_balances(&mut doc, previous);
        }
        self.write(kind, id, &doc, previous.as_ref(), &[]).await
    }

    async fn patch(&self, kind: EntityKind, id: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let previous = self.read(kind, id).await?.ok_or_else(|| StoreError::NotFound {
            kind,
            id: id.to_owned(),
        })?;

        let mut doc = previous.clone();
        let Some(object) = doc.as_object_mut() else {
            return Err(StoreError::Decode {
                kind,
                message: format!("document `{id}` is not an object"),
            });
        };
        let balances: Vec<(&str, i64)> = COUNTER_FIELDS
            .iter()
            .filter_map(|field| fields.get(*field).and_then(Value::as_i64).map(|v| (*field, v)))
            .collect();
        object.extend(fields);

        self.write(kind, id, &doc, Some(&previous), &balances).await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        let previous = self.read(kind, id).await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hdel(self.doc_key(kind), id)
            .ignore()
            .del(self.counter_key(kind, id))
            .ignore();

        if let Some(previous) = previous {
            for field in kind.indexed_fields() {
                if let Some(value) = previous.get(*field).and_then(Value::as_str) {
                    pipe.hdel(self.index_key(kind, field), value).ignore();
                }
            }
        }

        let mut conn = self.connection.conn();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(backend("document delete failed"))
    }

    async fn increment(&self, kind: EntityKind, id: &str, deltas: &[(&str, i64)]) -> Result<Vec<i64>, StoreError> {
        let mut invocation = self.increment.prepare_invoke();
        invocation
            .key(self.doc_key(kind))
            .key(self.counter_key(kind, id))
            .arg(id);
        for (field, delta) in deltas {
            invocation.arg(*field).arg(*delta);
        }

        let mut conn = self.connection.conn();
        let values: Option<Vec<i64>> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend("increment script failed"))?;

        values.ok_or_else(|| StoreError::NotFound {
            kind,
            id: id.to_owned(),
        })
    }
}

/// Prefixed counters with absolute expiry
#[derive(Clone)]
pub struct RedisCounters {
    connection: RedisConnection,
}

impl RedisCounters {
    pub fn new(connection: RedisConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Counters for RedisCounters {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.connection.conn();
        conn.get(self.connection.key(key)).await.map_err(backend("GET failed"))
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError> {
        let mut conn = self.connection.conn();
        conn.set(self.connection.key(key), value)
            .await
            .map_err(backend("SET failed"))
    }

    async fn incr_expire_at(&self, key: &str, by: i64, expire_at: i64) -> Result<i64, StoreError> {
        let key = self.connection.key(key);
        let mut conn = self.connection.conn();

        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(&key, by)
            .expire_at(&key, expire_at)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend("INCR failed"))?;

        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.conn();
        conn.del(self.connection.key(key)).await.map_err(backend("DEL failed"))
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection.conn();
        conn.hincr(self.connection.key(key), field, by)
            .await
            .map_err(backend("HINCRBY failed"))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.connection.conn();
        conn.hget(self.connection.key(key), field)
            .await
            .map_err(backend("HGET failed"))
    }
}

/// Change bus over Redis pub/sub
#[derive(Clone)]
pub struct RedisBus {
    connection: RedisConnection,
}

impl RedisBus {
    pub fn new(connection: RedisConnection) -> Self {
        Self { connection }
    }

    fn channel_name(&self, channel: Channel) -> String {
        self.connection.key(&format!("changes:{channel}"))
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: Channel, message: &ChangeMessage) -> Result<(), StoreError> {
        let payload = serde_json::to_string(message).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut conn = self.connection.conn();
        let _receivers: i64 = conn
            .publish(self.channel_name(channel), payload)
            .await
            .map_err(|e| StoreError::Bus(format!("PUBLISH failed: {e}")))?;

        Ok(())
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<ChangeStream, StoreError> {
        let mut pubsub = self
            .connection
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Bus(format!("failed to open subscription: {e}")))?;

        for channel in channels {
            pubsub
                .subscribe(self.channel_name(*channel))
                .await
                .map_err(|e| StoreError::Bus(format!("SUBSCRIBE {channel} failed: {e}")))?;
        }

        let prefix = self.connection.key("changes:");
        let stream = pubsub
            .into_on_message()
            .map(move |msg| -> Result<(Channel, ChangeMessage), StoreError> {
                let name = msg.get_channel_name();
                let channel = name
                    .strip_prefix(prefix.as_str())
                    .ok_or_else(|| StoreError::Bus(format!("unexpected channel `{name}`")))
                    .and_then(|suffix| Channel::from_str(suffix).map_err(StoreError::Bus))?;

                let payload: String = msg
                    .get_payload()
                    .map_err(|e| StoreError::Bus(format!("unreadable payload on {channel}: {e}")))?;
                let message: ChangeMessage = serde_json::from_str(&payload)
                    .map_err(|e| StoreError::Bus(format!("malformed message on {channel}: {e}")))?;

                Ok((channel, message))
            });

        Ok(stream.boxed())
    }
}
