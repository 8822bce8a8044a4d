use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use switchyard_core::{App, AppKey, Corp, Entity, EntityKind, Group, Key, Model, ModelAgent, Provider, Reseller, User};
use switchyard_store::{Store, StoreError};

use crate::{EntityCache, IdIndex, secret_digest};

/// One full generation of every collection, as loaded by a refresh
#[derive(Debug, Default)]
pub struct Snapshot {
    pub users: Vec<User>,
    pub resellers: Vec<Reseller>,
    pub apps: Vec<App>,
    pub app_keys: Vec<AppKey>,
    pub models: Vec<Model>,
    pub agents: Vec<ModelAgent>,
    pub keys: Vec<Key>,
    pub groups: Vec<Group>,
    pub providers: Vec<Provider>,
    pub corps: Vec<Corp>,
}

/// Entities cached by id in the registry
///
/// `put` and `evict` keep the secondary indexes consistent for the
/// types that feed them.
pub trait Cached: Entity {
    fn cache(registry: &Registry) -> &EntityCache<Self>;

    fn put(registry: &Registry, value: Self) -> Arc<Self> {
        let id = value.id().to_owned();
        Self::cache(registry).set(id, value)
    }

    fn evict(registry: &Registry, id: &str) -> Option<Arc<Self>> {
        Self::cache(registry).remove(id)
    }
}

macro_rules! plain_cached {
    ($($ty:ty => $field:ident),+ $(,)?) => {
        $(
            impl Cached for $ty {
                fn cache(registry: &Registry) -> &EntityCache<Self> {
                    &registry.$field
                }
            }
        )+
    };
}

plain_cached! {
    User => users,
    Reseller => resellers,
    App => apps,
    Provider => providers,
    Corp => corps,
}

impl Cached for Model {
    fn cache(registry: &Registry) -> &EntityCache<Self> {
        &registry.models
    }

    fn put(registry: &Registry, model: Self) -> Arc<Self> {
        let model = Arc::new(model);
        registry.models.set_arc(model.id.clone(), Arc::clone(&model));

        registry.model_names.remove_member(&model.id);
        registry.model_names.add(&model.model, &model.id);
        registry.model_agents.set(model.id.clone(), registry.derive_model_agents(&model));
        registry.model_keys.set(model.id.clone(), registry.derive_model_keys(&model.id));
        model
    }

    fn evict(registry: &Registry, id: &str) -> Option<Arc<Self>> {
        registry.model_names.remove_member(id);
        registry.model_agents.remove_owner(id);
        registry.model_keys.remove_owner(id);
        registry.models.remove(id)
    }
}

impl Cached for ModelAgent {
    fn cache(registry: &Registry) -> &EntityCache<Self> {
        &registry.agents
    }

    fn put(registry: &Registry, agent: Self) -> Arc<Self> {
        let agent = Arc::new(agent);
        registry.agents.set_arc(agent.id.clone(), Arc::clone(&agent));

        registry.model_agents.remove_member(&agent.id);
        for model in registry.models.values() {
            if agent.serves(&model) {
                registry.model_agents.add(&model.id, &agent.id);
            }
        }
        registry.agent_keys.set(agent.id.clone(), registry.derive_agent_keys(&agent.id));
        agent
    }

    fn evict(registry: &Registry, id: &str) -> Option<Arc<Self>> {
        registry.model_agents.remove_member(id);
        registry.group_agents.remove_member(id);
        registry.agent_keys.remove_owner(id);
        registry.agents.remove(id)
    }
}

impl Cached for Key {
    fn cache(registry: &Registry) -> &EntityCache<Self> {
        &registry.keys
    }

    fn put(registry: &Registry, key: Self) -> Arc<Self> {
        let key = Arc::new(key);
        registry.keys.set_arc(key.id.clone(), Arc::clone(&key));

        registry.agent_keys.remove_member(&key.id);
        registry.model_keys.remove_member(&key.id);
        for agent_id in &key.model_agents {
            if registry.agents.contains(agent_id) {
                registry.agent_keys.add(agent_id, &key.id);
            }
        }
        if key.model_agents.is_empty() {
            for model_id in &key.models {
                if registry.models.contains(model_id) {
                    registry.model_keys.add(model_id, &key.id);
                }
            }
        }
        key
    }

    fn evict(registry: &Registry, id: &str) -> Option<Arc<Self>> {
        registry.agent_keys.remove_member(id);
        registry.model_keys.remove_member(id);
        registry.keys.remove(id)
    }
}

impl Cached for Group {
    fn cache(registry: &Registry) -> &EntityCache<Self> {
        &registry.groups
    }

    fn put(registry: &Registry, group: Self) -> Arc<Self> {
        registry.group_agents.set(group.id.clone(), group.model_agents.clone());
        let id = group.id.clone();
        registry.groups.set(id, group)
    }

    fn evict(registry: &Registry, id: &str) -> Option<Arc<Self>> {
        registry.group_agents.remove_owner(id);
        registry.groups.remove(id)
    }
}

/// Every entity cache and secondary index of one gateway instance
///
/// Misses fall through to the store and fill the cache; store reads
/// never run while a cache guard is held.
pub struct Registry {
    store: Arc<dyn Store>,

    pub users: EntityCache<User>,
    pub resellers: EntityCache<Reseller>,
    pub apps: EntityCache<App>,
    /// Keyed by the SHA-256 digest of the secret
    pub app_keys: EntityCache<AppKey>,
    pub models: EntityCache<Model>,
    pub agents: EntityCache<ModelAgent>,
    pub keys: EntityCache<Key>,
    pub groups: EntityCache<Group>,
    pub providers: EntityCache<Provider>,
    pub corps: EntityCache<Corp>,

    /// App key id to secret digest
    app_key_digests: DashMap<String, String>,
    /// Model name to model ids
    model_names: IdIndex,
    /// Model id to the agents serving it
    model_agents: IdIndex,
    /// Group id to its agents
    group_agents: IdIndex,
    /// Agent id to its pooled keys
    agent_keys: IdIndex,
    /// Model id to keys scoped directly to it
    model_keys: IdIndex,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("users", &self.users.len())
            .field("app_keys", &self.app_keys.len())
            .field("models", &self.models.len())
            .field("agents", &self.agents.len())
            .field("keys", &self.keys.len())
            .field("groups", &self.groups.len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            users: EntityCache::new(),
            resellers: EntityCache::new(),
            apps: EntityCache::new(),
            app_keys: EntityCache::new(),
            models: EntityCache::new(),
            agents: EntityCache::new(),
            keys: EntityCache::new(),
            groups: EntityCache::new(),
            providers: EntityCache::new(),
            corps: EntityCache::new(),
            app_key_digests: DashMap::new(),
            model_names: IdIndex::new(),
            model_agents: IdIndex::new(),
            group_agents: IdIndex::new(),
            agent_keys: IdIndex::new(),
            model_keys: IdIndex::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Cache or replace an entity, maintaining its indexes
    pub fn put<T: Cached>(&self, value: T) -> Arc<T> {
        T::put(self, value)
    }

    /// Drop an entity and its index memberships
    pub fn remove<T: Cached>(&self, id: &str) -> Option<Arc<T>> {
        T::evict(self, id)
    }

    /// Cache-only lookup
    pub fn cached<T: Cached>(&self, id: &str) -> Option<Arc<T>> {
        T::cache(self).get(id)
    }

    /// Cache lookup, filling from the store on a miss
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read
    pub async fn get_or_load<T: Cached>(&self, id: &str) -> Result<Option<Arc<T>>, StoreError> {
        if let Some(hit) = T::cache(self).get(id) {
            return Ok(Some(hit));
        }

        tracing::debug!(kind = %T::KIND, id, "cache miss, reading from store");
        Ok(self.store.load::<T>(id).await?.map(|value| T::put(self, value)))
    }

    /// Resolve ids in order, filling misses with one batched store read
    async fn resolve<T: Cached>(&self, ids: &[String]) -> Result<Vec<Arc<T>>, StoreError> {
        let cache = T::cache(self);
        let missing: Vec<String> = ids.iter().filter(|id| !cache.contains(id)).cloned().collect();

        if !missing.is_empty() {
            for value in self.store.load_many::<T>(&missing).await? {
                T::put(self, value);
            }
        }

        Ok(ids.iter().filter_map(|id| cache.get(id)).collect())
    }

    pub fn put_app_key(&self, app_key: AppKey) -> Arc<AppKey> {
        let digest = secret_digest(&app_key.key);
        if let Some(previous) = self.app_key_digests.insert(app_key.id.clone(), digest.clone())
            && previous != digest
        {
            self.app_keys.remove(&previous);
        }
        self.app_keys.set(digest, app_key)
    }

    pub fn remove_app_key(&self, id: &str) -> Option<Arc<AppKey>> {
        let (_, digest) = self.app_key_digests.remove(id)?;
        self.app_keys.remove(&digest)
    }

    /// Cached app key by id
    pub fn app_key(&self, id: &str) -> Option<Arc<AppKey>> {
        let digest = self.app_key_digests.get(id).map(|d| d.value().clone())?;
        self.app_keys.get(&digest)
    }

    /// Replace a cached app key by id with `f(current)`
    pub fn update_app_key(&self, id: &str, f: impl FnOnce(&AppKey) -> AppKey) -> Option<Arc<AppKey>> {
        let digest = self.app_key_digests.get(id).map(|d| d.value().clone())?;
        self.app_keys.update(&digest, f)
    }

    /// App key by presented secret, filling from the store on a miss
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read
    pub async fn app_key_by_secret(&self, secret: &str) -> Result<Option<Arc<AppKey>>, StoreError> {
        if let Some(hit) = self.app_keys.get(&secret_digest(secret)) {
            return Ok(Some(hit));
        }

        Ok(self
            .store
            .load_by::<AppKey>("key", secret)
            .await?
            .map(|app_key| self.put_app_key(app_key)))
    }

    /// Load an app key by id from the store, refreshing the cache
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read
    pub async fn reload_app_key(&self, id: &str) -> Result<Option<Arc<AppKey>>, StoreError> {
        match self.store.load::<AppKey>(id).await? {
            Some(app_key) => Ok(Some(self.put_app_key(app_key))),
            None => Ok(self.remove_app_key(id)),
        }
    }

    /// The user's reseller, by the reseller's bound user id
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read
    pub async fn reseller_for(&self, user: &User) -> Result<Option<Arc<Reseller>>, StoreError> {
        match user.rid.as_deref() {
            Some(rid) if !rid.is_empty() => self.get_or_load::<Reseller>(rid).await,
            _ => Ok(None),
        }
    }

    /// Models carrying the requested name
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read
    pub async fn models_named(&self, name: &str) -> Result<Vec<Arc<Model>>, StoreError> {
        if let Some(ids) = self.model_names.get(name)
            && !ids.is_empty()
        {
            return Ok(ids.iter().filter_map(|id| self.models.get(id)).collect());
        }

        let mut models: Vec<Model> = self
            .store
            .load_all::<Model>()
            .await?
            .into_iter()
            .filter(|model| model.model == name)
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(models.into_iter().map(|model| self.put(model)).collect())
    }

    /// Agents serving a model, whatever their status
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read
    pub async fn agents_for_model(&self, model: &Model) -> Result<Vec<Arc<ModelAgent>>, StoreError> {
        if let Some(ids) = self.model_agents.get(&model.id) {
            return self.resolve::<ModelAgent>(&ids).await;
        }

        let agents = self.store.load_all::<ModelAgent>().await?;
        let mut ids: Vec<String> = agents.iter().filter(|a| a.serves(model)).map(|a| a.id.clone()).collect();
        ids.sort();
        for agent in agents {
            self.put(agent);
        }
        self.model_agents.set(model.id.clone(), ids.clone());

        self.resolve::<ModelAgent>(&ids).await
    }

    /// Agents attached to a group, whatever their status
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read
    pub async fn agents_for_group(&self, group_id: &str) -> Result<Vec<Arc<ModelAgent>>, StoreError> {
        let ids = match self.group_agents.get(group_id) {
            Some(ids) => ids,
            None => match self.get_or_load::<Group>(group_id).await? {
                Some(group) => group.model_agents.clone(),
                None => return Ok(Vec::new()),
            },
        };

        self.resolve::<ModelAgent>(&ids).await
    }

    /// Keys pooled in an agent, whatever their status
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read
    pub async fn keys_for_agent(&self, agent_id: &str) -> Result<Vec<Arc<Key>>, StoreError> {
        if let Some(ids) = self.agent_keys.get(agent_id) {
            return self.resolve::<Key>(&ids).await;
        }

        self.derive_keys_from_store(&self.agent_keys, agent_id, |key| {
            key.model_agents.iter().any(|id| id == agent_id)
        })
        .await
    }

    /// Keys scoped directly to a model, whatever their status
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read
    pub async fn keys_for_model(&self, model_id: &str) -> Result<Vec<Arc<Key>>, StoreError> {
        if let Some(ids) = self.model_keys.get(model_id) {
            return self.resolve::<Key>(&ids).await;
        }

        self.derive_keys_from_store(&self.model_keys, model_id, |key| {
            key.model_agents.is_empty() && key.models.iter().any(|id| id == model_id)
        })
        .await
    }

    async fn derive_keys_from_store(
        &self,
        index: &IdIndex,
        owner: &str,
        belongs: impl Fn(&Key) -> bool,
    ) -> Result<Vec<Arc<Key>>, StoreError> {
        let keys = self.store.load_all::<Key>().await?;
        let mut ids: Vec<String> = keys.iter().filter(|k| belongs(k)).map(|k| k.id.clone()).collect();
        ids.sort();
        for key in keys {
            self.keys.set(key.id.clone(), key);
        }
        index.set(owner, ids.clone());

        Ok(ids.iter().filter_map(|id| self.keys.get(id)).collect())
    }

    fn derive_model_agents(&self, model: &Model) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .values()
            .iter()
            .filter(|agent| agent.serves(model))
            .map(|agent| agent.id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn derive_agent_keys(&self, agent_id: &str) -> Vec<String> {
        self.derive_keys(|key| key.model_agents.iter().any(|id| id == agent_id))
    }

    fn derive_model_keys(&self, model_id: &str) -> Vec<String> {
        self.derive_keys(|key| key.model_agents.is_empty() && key.models.iter().any(|id| id == model_id))
    }

    fn derive_keys(&self, belongs: impl Fn(&Key) -> bool) -> Vec<String> {
        let mut ids: Vec<String> = self
            .keys
            .values()
            .iter()
            .filter(|key| belongs(key))
            .map(|key| key.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Re-derive every secondary index from the primary caches
    pub fn rebuild_indexes(&self) {
        let models = self.models.values();
        let agents = self.agents.values();

        let mut names: HashMap<String, Vec<String>> = HashMap::new();
        for model in &models {
            names.entry(model.model.clone()).or_default().push(model.id.clone());
        }
        for ids in names.values_mut() {
            ids.sort();
        }
        self.model_names.replace_all(names);

        self.model_agents.replace_all(
            models
                .iter()
                .map(|model| (model.id.clone(), self.derive_model_agents(model)))
                .collect(),
        );
        self.model_keys.replace_all(
            models
                .iter()
                .map(|model| (model.id.clone(), self.derive_model_keys(&model.id)))
                .collect(),
        );
        self.agent_keys.replace_all(
            agents
                .iter()
                .map(|agent| (agent.id.clone(), self.derive_agent_keys(&agent.id)))
                .collect(),
        );
        self.group_agents.replace_all(
            self.groups
                .values()
                .iter()
                .map(|group| (group.id.clone(), group.model_agents.clone()))
                .collect(),
        );
    }

    /// Swap in a full generation and re-derive the indexes
    pub fn install(&self, snapshot: Snapshot) {
        fn by_id<T: Entity>(values: Vec<T>) -> impl Iterator<Item = (String, T)> {
            values.into_iter().map(|v| (v.id().to_owned(), v))
        }

        self.users.replace_all(by_id(snapshot.users));
        self.resellers.replace_all(by_id(snapshot.resellers));
        self.apps.replace_all(by_id(snapshot.apps));
        self.models.replace_all(by_id(snapshot.models));
        self.agents.replace_all(by_id(snapshot.agents));
        self.keys.replace_all(by_id(snapshot.keys));
        self.groups.replace_all(by_id(snapshot.groups));
        self.providers.replace_all(by_id(snapshot.providers));
        self.corps.replace_all(by_id(snapshot.corps));

        let mut digests = HashMap::with_capacity(snapshot.app_keys.len());
        let app_keys: Vec<(String, AppKey)> = snapshot
            .app_keys
            .into_iter()
            .map(|app_key| {
                let digest = secret_digest(&app_key.key);
                digests.insert(app_key.id.clone(), digest.clone());
                (digest, app_key)
            })
            .collect();
        self.app_keys.replace_all(app_keys);
        for (id, digest) in &digests {
            self.app_key_digests.insert(id.clone(), digest.clone());
        }
        self.app_key_digests.retain(|id, _| digests.contains_key(id));

        self.rebuild_indexes();
    }

    /// Cached entry count per collection
    pub fn counts(&self) -> Vec<(EntityKind, usize)> {
        vec![
            (EntityKind::User, self.users.len()),
            (EntityKind::Reseller, self.resellers.len()),
            (EntityKind::App, self.apps.len()),
            (EntityKind::AppKey, self.app_keys.len()),
            (EntityKind::Model, self.models.len()),
            (EntityKind::Key, self.keys.len()),
            (EntityKind::Agent, self.agents.len()),
            (EntityKind::Group, self.groups.len()),
            (EntityKind::Provider, self.providers.len()),
            (EntityKind::Corp, self.corps.len()),
        ]
    }

    /// Agent ids indexed under a model, if derived
    pub fn indexed_model_agents(&self, model_id: &str) -> Option<Vec<String>> {
        self.model_agents.get(model_id)
    }

    /// Agent ids indexed under a group, if derived
    pub fn indexed_group_agents(&self, group_id: &str) -> Option<Vec<String>> {
        self.group_agents.get(group_id)
    }

    /// Key ids indexed under an agent, if derived
    pub fn indexed_agent_keys(&self, agent_id: &str) -> Option<Vec<String>> {
        self.agent_keys.get(agent_id)
    }
}
