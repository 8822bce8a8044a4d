//! Cached entity model
//!
//! Every entity is identified by an opaque string id and serialized the
//! same way in the store, on the change bus, and in tests.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Lifecycle status shared by every configurable entity
///
/// Stored as an integer: `1` enabled, `2` disabled, `-1` deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Status {
    #[default]
    Enabled,
    Disabled,
    Deleted,
}

impl Status {
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl From<Status> for i32 {
    fn from(status: Status) -> Self {
        match status {
            Status::Enabled => 1,
            Status::Disabled => 2,
            Status::Deleted => -1,
        }
    }
}

impl TryFrom<i32> for Status {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Enabled),
            2 => Ok(Self::Disabled),
            -1 => Ok(Self::Deleted),
            other => Err(format!("unknown status {other}")),
        }
    }
}

/// Load-balancing strategy applied to a candidate list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbStrategy {
    #[default]
    RoundRobin,
    Weighted,
}

/// Entity collections known to the store, the caches and the change bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Reseller,
    App,
    AppKey,
    Model,
    Key,
    Agent,
    Group,
    Provider,
    Corp,
}

impl EntityKind {
    pub const ALL: [Self; 10] = [
        Self::User,
        Self::Reseller,
        Self::App,
        Self::AppKey,
        Self::Model,
        Self::Key,
        Self::Agent,
        Self::Group,
        Self::Provider,
        Self::Corp,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Reseller => "reseller",
            Self::App => "app",
            Self::AppKey => "app_key",
            Self::Model => "model",
            Self::Key => "key",
            Self::Agent => "agent",
            Self::Group => "group",
            Self::Provider => "provider",
            Self::Corp => "corp",
        }
    }

    /// Document fields that can be used for secondary-key lookups
    pub const fn indexed_fields(self) -> &'static [&'static str] {
        match self {
            Self::AppKey => &["key"],
            Self::Model => &["model"],
            Self::Reseller => &["user_id"],
            _ => &[],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entity persisted in the store and mirrored in the caches
pub trait Entity: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Collection this entity lives in
    const KIND: EntityKind;

    /// Opaque identifier
    fn id(&self) -> &str;
}

macro_rules! impl_entity {
    ($($ty:ty => $kind:expr),+ $(,)?) => {
        $(
            impl Entity for $ty {
                const KIND: EntityKind = $kind;

                fn id(&self) -> &str {
                    &self.id
                }
            }
        )+
    };
}

impl_entity! {
    User => EntityKind::User,
    Reseller => EntityKind::Reseller,
    App => EntityKind::App,
    AppKey => EntityKind::AppKey,
    Model => EntityKind::Model,
    Key => EntityKind::Key,
    ModelAgent => EntityKind::Agent,
    Group => EntityKind::Group,
    Provider => EntityKind::Provider,
    Corp => EntityKind::Corp,
}

/// An entity that carries a consumable balance
pub trait QuotaHolder: Entity {
    /// Remaining balance as last seen by this instance
    fn quota(&self) -> i64;

    /// Balance consumed so far
    fn used_quota(&self) -> i64;

    /// Unix seconds after which the balance can no longer be used, `0` for never
    fn quota_expires_at(&self) -> i64;

    /// Whether the balance is enforced at all
    fn is_quota_limited(&self) -> bool;

    /// Overwrite the cached balance with a post-spend value
    fn apply_balance(&mut self, quota: i64, used_quota: i64);
}

macro_rules! impl_quota_holder {
    ($ty:ty, limited = |$this:ident| $limited:expr) => {
        impl QuotaHolder for $ty {
            fn quota(&self) -> i64 {
                self.quota
            }

            fn used_quota(&self) -> i64 {
                self.used_quota
            }

            fn quota_expires_at(&self) -> i64 {
                self.quota_expires_at
            }

            fn is_quota_limited(&self) -> bool {
                let $this = self;
                $limited
            }

            fn apply_balance(&mut self, quota: i64, used_quota: i64) {
                self.quota = quota;
                self.used_quota = used_quota;
            }
        }
    };
}

impl_quota_holder!(User, limited = |_u| true);
impl_quota_holder!(Reseller, limited = |_r| true);
impl_quota_holder!(App, limited = |a| a.is_limit_quota);
impl_quota_holder!(AppKey, limited = |k| k.is_limit_quota);
impl_quota_holder!(Group, limited = |g| g.is_limit_quota);

/// An account holding a balance and group memberships
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub name: String,
    pub quota: i64,
    pub used_quota: i64,
    pub quota_expires_at: i64,
    pub groups: Vec<String>,
    /// Reseller this user was provisioned through
    pub rid: Option<String>,
    pub status: Status,
}

/// A reseller account, bound to a user and owning groups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reseller {
    pub id: String,
    pub user_id: String,
    pub quota: i64,
    pub used_quota: i64,
    pub quota_expires_at: i64,
    pub groups: Vec<String>,
    pub status: Status,
}

/// A caller application owned by a user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct App {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// Model names this app may call; empty allows every model
    pub models: Vec<String>,
    pub is_limit_quota: bool,
    pub quota: i64,
    pub used_quota: i64,
    pub quota_expires_at: i64,
    pub ip_whitelist: Vec<String>,
    pub ip_blacklist: Vec<String>,
    pub status: Status,
}

/// The bearer credential presented by callers
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppKey {
    pub id: String,
    pub app_id: String,
    pub user_id: String,
    /// Secret presented in the `Authorization` header
    pub key: String,
    pub is_limit_quota: bool,
    pub quota: i64,
    pub used_quota: i64,
    pub quota_expires_at: i64,
    /// Rolling expiry: minutes after first use, `0` when a fixed timestamp applies
    pub quota_expires_minutes: i64,
    pub group: Option<String>,
    pub ip_whitelist: Vec<String>,
    pub ip_blacklist: Vec<String>,
    pub status: Status,
}

impl AppKey {
    /// Rolling expiry configured but not yet started
    pub const fn awaits_first_use(&self) -> bool {
        self.quota_expires_minutes > 0 && self.quota_expires_at == 0
    }
}

impl fmt::Debug for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppKey")
            .field("id", &self.id)
            .field("app_id", &self.app_id)
            .field("user_id", &self.user_id)
            .field("is_limit_quota", &self.is_limit_quota)
            .field("quota", &self.quota)
            .field("quota_expires_at", &self.quota_expires_at)
            .field("group", &self.group)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Policy bundle of permitted models and agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    pub id: String,
    pub name: String,
    /// Model ids
    pub models: Vec<String>,
    /// Model agent ids
    pub model_agents: Vec<String>,
    pub lb_strategy: LbStrategy,
    pub weight: i64,
    pub is_default: bool,
    pub is_public: bool,
    pub is_limit_quota: bool,
    pub quota: i64,
    pub used_quota: i64,
    pub quota_expires_at: i64,
    pub expires_at: i64,
    pub status: Status,
}

impl Group {
    /// Enabled and not past its expiry
    pub fn is_usable(&self, now: i64) -> bool {
        self.status.is_enabled() && (self.expires_at == 0 || self.expires_at > now)
    }
}

/// Price multipliers applied by billing
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub input_ratio: f64,
    pub output_ratio: f64,
    pub once_ratio: f64,
}

/// Model to try once a model's own candidates are exhausted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fallback {
    /// Name of the fallback model
    pub model: Option<String>,
    /// Agent to pin the fallback to
    pub agent: Option<String>,
}

/// A logical, billable model exposed to callers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Model {
    pub id: String,
    pub corp: String,
    /// Name callers request, e.g. `gpt-4o`
    pub model: String,
    pub providers: Vec<String>,
    pub pricing: Pricing,
    /// Agents allowed to serve this model
    pub model_agents: Vec<String>,
    pub lb_strategy: LbStrategy,
    pub fallback: Option<Fallback>,
    pub status: Status,
}

/// An upstream relay pooling provider keys
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelAgent {
    pub id: String,
    pub corp: String,
    pub name: String,
    pub base_url: String,
    pub path: String,
    pub weight: i64,
    /// Model ids served by this agent
    pub models: Vec<String>,
    /// Strategy used across this agent's keys
    pub lb_strategy: LbStrategy,
    pub is_never_disable: bool,
    pub is_auto_disabled: bool,
    pub auto_disabled_reason: Option<String>,
    pub status: Status,
}

impl ModelAgent {
    /// Whether this agent may serve the given model
    pub fn serves(&self, model: &Model) -> bool {
        self.models.iter().any(|id| *id == model.id) || model.model_agents.iter().any(|id| *id == self.id)
    }
}

/// A backend provider credential
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Key {
    pub id: String,
    pub corp: String,
    pub key: String,
    /// Model ids this key is scoped to
    pub models: Vec<String>,
    /// Agent ids this key is pooled in
    pub model_agents: Vec<String>,
    pub weight: i64,
    pub is_never_disable: bool,
    pub is_auto_disabled: bool,
    pub auto_disabled_reason: Option<String>,
    pub status: Status,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("corp", &self.corp)
            .field("models", &self.models)
            .field("model_agents", &self.model_agents)
            .field("weight", &self.weight)
            .field("is_never_disable", &self.is_never_disable)
            .field("is_auto_disabled", &self.is_auto_disabled)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Provider reference data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub code: String,
    pub sort: i64,
    pub status: Status,
}

/// Corporation reference data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Corp {
    pub id: String,
    pub name: String,
    pub code: String,
    pub sort: i64,
    pub status: Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_as_integer() {
        let agent = ModelAgent {
            id: "a1".to_owned(),
            status: Status::Disabled,
            ..ModelAgent::default()
        };

        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json["status"], 2);

        let parsed: ModelAgent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.status, Status::Disabled);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let result = serde_json::from_value::<User>(serde_json::json!({"id": "u1", "status": 7}));
        assert!(result.is_err());
    }

    #[test]
    fn missing_fields_default() {
        let key: Key = serde_json::from_value(serde_json::json!({"id": "k1", "key": "sk-1"})).unwrap();
        assert_eq!(key.status, Status::Enabled);
        assert_eq!(key.weight, 0);
        assert!(key.models.is_empty());
    }

    #[test]
    fn debug_redacts_secrets() {
        let key = Key {
            id: "k1".to_owned(),
            key: "sk-secret".to_owned(),
            ..Key::default()
        };
        let app_key = AppKey {
            id: "ak1".to_owned(),
            key: "app-secret".to_owned(),
            ..AppKey::default()
        };

        assert!(!format!("{key:?}").contains("sk-secret"));
        assert!(!format!("{app_key:?}").contains("app-secret"));
    }

    #[test]
    fn agent_serves_from_either_side() {
        let model = Model {
            id: "m1".to_owned(),
            model_agents: vec!["a2".to_owned()],
            ..Model::default()
        };
        let listed_on_agent = ModelAgent {
            id: "a1".to_owned(),
            models: vec!["m1".to_owned()],
            ..ModelAgent::default()
        };
        let listed_on_model = ModelAgent {
            id: "a2".to_owned(),
            ..ModelAgent::default()
        };
        let unrelated = ModelAgent {
            id: "a3".to_owned(),
            ..ModelAgent::default()
        };

        assert!(listed_on_agent.serves(&model));
        assert!(listed_on_model.serves(&model));
        assert!(!unrelated.serves(&model));
    }

    #[test]
    fn group_expiry() {
        let group = Group {
            expires_at: 100,
            ..Group::default()
        };
        assert!(group.is_usable(99));
        assert!(!group.is_usable(100));

        let forever = Group::default();
        assert!(forever.is_usable(i64::MAX));
    }

    #[test]
    fn rolling_expiry_awaits_first_use() {
        let mut key = AppKey {
            quota_expires_minutes: 30,
            ..AppKey::default()
        };
        assert!(key.awaits_first_use());

        key.quota_expires_at = 1_700_000_000;
        assert!(!key.awaits_first_use());
    }
}
