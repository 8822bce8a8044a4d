use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use crate::{App, AppKey, Reseller, User};

/// Agents and keys already tried and failed within one logical request
#[derive(Debug, Clone, Default)]
pub struct Exclusion {
    agents: HashSet<String>,
    keys: HashSet<String>,
}

impl Exclusion {
    pub fn exclude_agent(&mut self, id: impl Into<String>) {
        self.agents.insert(id.into());
    }

    pub fn exclude_key(&mut self, id: impl Into<String>) {
        self.keys.insert(id.into());
    }

    pub fn has_agent(&self, id: &str) -> bool {
        self.agents.contains(id)
    }

    pub fn has_key(&self, id: &str) -> bool {
        self.keys.contains(id)
    }

    /// Forget every exclusion, e.g. before trying a fallback model
    pub fn reset(&mut self) {
        self.agents.clear();
        self.keys.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.keys.is_empty()
    }
}

/// Per-request selection state consulted by the selection engine
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    /// Backends that already failed during this request
    pub exclusion: Exclusion,
    /// Sticky test session: pin to this agent when it is a candidate
    pub pinned_agent: Option<String>,
}

impl RequestScope {
    /// Scope for a test session pinned to one agent
    pub fn pinned(agent_id: impl Into<String>) -> Self {
        Self {
            exclusion: Exclusion::default(),
            pinned_agent: Some(agent_id.into()),
        }
    }
}

/// Resolved credential chain for an authenticated request
///
/// Populated once by the auth pipeline so selection and billing never
/// look the same entities up again.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: Arc<User>,
    pub app: Arc<App>,
    pub app_key: Arc<AppKey>,
    pub reseller: Option<Arc<Reseller>>,
    pub client_ip: Option<IpAddr>,
    pub scope: RequestScope,
}

impl Session {
    /// Group ids bound to this request: the key's own group, else the user's groups
    pub fn bound_groups(&self) -> Vec<String> {
        self.app_key
            .group
            .as_ref()
            .map_or_else(|| self.user.groups.clone(), |group| vec![group.clone()])
    }

    /// Whether the app's model allow-list admits this model name
    pub fn allows_model(&self, model: &str) -> bool {
        self.app.models.is_empty() || self.app.models.iter().any(|m| m == model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(key_group: Option<&str>, app_models: &[&str]) -> Session {
        Session {
            user: Arc::new(User {
                id: "u1".to_owned(),
                groups: vec!["g-user".to_owned(), "g-default".to_owned()],
                ..User::default()
            }),
            app: Arc::new(App {
                id: "app1".to_owned(),
                models: app_models.iter().map(|m| (*m).to_owned()).collect(),
                ..App::default()
            }),
            app_key: Arc::new(AppKey {
                id: "ak1".to_owned(),
                group: key_group.map(str::to_owned),
                ..AppKey::default()
            }),
            reseller: None,
            client_ip: None,
            scope: RequestScope::default(),
        }
    }

    #[test]
    fn key_group_overrides_user_groups() {
        assert_eq!(session(Some("g-key"), &[]).bound_groups(), vec!["g-key".to_owned()]);
        assert_eq!(session(None, &[]).bound_groups().len(), 2);
    }

    #[test]
    fn empty_allow_list_admits_everything() {
        assert!(session(None, &[]).allows_model("gpt-x"));
        assert!(session(None, &["gpt-x"]).allows_model("gpt-x"));
        assert!(!session(None, &["gpt-x"]).allows_model("gpt-y"));
    }

    #[test]
    fn exclusion_reset() {
        let mut exclusion = Exclusion::default();
        exclusion.exclude_agent("a1");
        exclusion.exclude_key("k1");
        assert!(exclusion.has_agent("a1"));
        assert!(exclusion.has_key("k1"));

        exclusion.reset();
        assert!(exclusion.is_empty());
    }
}
