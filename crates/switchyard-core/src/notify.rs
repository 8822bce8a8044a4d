use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Entity, EntityKind};

/// What happened to the entity carried by a change message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Status,
    Delete,
    /// Model membership of an agent, key or group changed
    Models,
    /// Re-read the entity from the store
    Cache,
    /// Any action this instance does not know about
    #[serde(other)]
    Unknown,
}

/// Change-notification channel, one per entity type plus `config`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Entity(EntityKind),
    Config,
}

impl Channel {
    /// Every channel a gateway instance subscribes to
    pub fn all() -> Vec<Self> {
        EntityKind::ALL
            .into_iter()
            .map(Self::Entity)
            .chain(std::iter::once(Self::Config))
            .collect()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entity(kind) => kind.as_str(),
            Self::Config => "config",
        }
    }
}

impl From<EntityKind> for Channel {
    fn from(kind: EntityKind) -> Self {
        Self::Entity(kind)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "config" {
            return Ok(Self::Config);
        }

        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .map(Self::Entity)
            .ok_or_else(|| format!("unknown channel `{s}`"))
    }
}

/// Envelope published on the change bus for every mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub action: ChangeAction,
    #[serde(default)]
    pub old_data: Option<Value>,
    #[serde(default)]
    pub new_data: Option<Value>,
}

impl ChangeMessage {
    /// Build an envelope from typed before/after snapshots
    ///
    /// # Errors
    ///
    /// Returns an error if either entity fails to serialize
    pub fn of<T: Entity>(action: ChangeAction, old: Option<&T>, new: Option<&T>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            action,
            old_data: old.map(serde_json::to_value).transpose()?,
            new_data: new.map(serde_json::to_value).transpose()?,
        })
    }

    /// Id of the affected entity, preferring the post-change payload
    pub fn entity_id(&self) -> Option<&str> {
        self.new_data
            .as_ref()
            .and_then(|v| v.get("id"))
            .or_else(|| self.old_data.as_ref().and_then(|v| v.get("id")))
            .and_then(Value::as_str)
    }

    /// Decode the post-change payload
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the entity shape
    pub fn new_entity<T: Entity>(&self) -> Result<Option<T>, serde_json::Error> {
        self.new_data.clone().map(serde_json::from_value).transpose()
    }
}
