//! Entity builders and a standard tenant

use std::sync::Arc;

use switchyard_core::{App, AppKey, Group, Key, LbStrategy, Model, ModelAgent, Provider, Reseller, User};
use switchyard_store::Store;

pub const SECRET: &str = "sk-test-0001";

/// Entities written to the store before a world starts
#[derive(Debug, Default, Clone)]
pub struct Seed {
    pub users: Vec<User>,
    pub resellers: Vec<Reseller>,
    pub apps: Vec<App>,
    pub app_keys: Vec<AppKey>,
    pub models: Vec<Model>,
    pub agents: Vec<ModelAgent>,
    pub keys: Vec<Key>,
    pub groups: Vec<Group>,
    pub providers: Vec<Provider>,
}

impl Seed {
    /// One user with an app and a quota-limited app key, bound to a
    /// weighted group and the default group, both carrying `gpt-4o`
    /// served by agents `a1` and `a2` with one key each
    pub fn standard() -> Self {
        Self {
            users: vec![User {
                id: "u1".to_owned(),
                name: "alice".to_owned(),
                quota: 1_000,
                groups: vec!["g-default".to_owned(), "g-main".to_owned()],
                ..User::default()
            }],
            apps: vec![App {
                id: "app1".to_owned(),
                user_id: "u1".to_owned(),
                name: "chat".to_owned(),
                ..App::default()
            }],
            app_keys: vec![AppKey {
                id: "ak1".to_owned(),
                app_id: "app1".to_owned(),
                user_id: "u1".to_owned(),
                key: SECRET.to_owned(),
                is_limit_quota: true,
                quota: 100,
                ..AppKey::default()
            }],
            models: vec![model("m1", "gpt-4o")],
            agents: vec![agent("a1", &["m1"], 1), agent("a2", &["m1"], 1)],
            keys: vec![key("k1", &["a1"]), key("k2", &["a2"])],
            groups: vec![
                group("g-main", &["m1"], 10, false),
                group("g-default", &["m1"], 0, true),
            ],
            ..Self::default()
        }
    }

    pub async fn save(&self, store: &Arc<dyn Store>) {
        for user in &self.users {
            store.save(user).await.unwrap();
        }
        for reseller in &self.resellers {
            store.save(reseller).await.unwrap();
        }
        for app in &self.apps {
            store.save(app).await.unwrap();
        }
        for app_key in &self.app_keys {
            store.save(app_key).await.unwrap();
        }
        for model in &self.models {
            store.save(model).await.unwrap();
        }
        for agent in &self.agents {
            store.save(agent).await.unwrap();
        }
        for key in &self.keys {
            store.save(key).await.unwrap();
        }
        for group in &self.groups {
            store.save(group).await.unwrap();
        }
        for provider in &self.providers {
            store.save(provider).await.unwrap();
        }
    }
}

pub fn model(id: &str, name: &str) -> Model {
    Model {
        id: id.to_owned(),
        model: name.to_owned(),
        ..Model::default()
    }
}

pub fn agent(id: &str, models: &[&str], weight: i64) -> ModelAgent {
    ModelAgent {
        id: id.to_owned(),
        name: id.to_owned(),
        base_url: format!("https://{id}.example.test"),
        weight,
        models: models.iter().map(|&m| m.to_owned()).collect(),
        ..ModelAgent::default()
    }
}

pub fn key(id: &str, agents: &[&str]) -> Key {
    Key {
        id: id.to_owned(),
        key: format!("upstream-{id}"),
        model_agents: agents.iter().map(|&a| a.to_owned()).collect(),
        weight: 1,
        ..Key::default()
    }
}

pub fn group(id: &str, models: &[&str], weight: i64, is_default: bool) -> Group {
    Group {
        id: id.to_owned(),
        name: id.to_owned(),
        models: models.iter().map(|&m| m.to_owned()).collect(),
        lb_strategy: LbStrategy::RoundRobin,
        weight,
        is_default,
        ..Group::default()
    }
}
