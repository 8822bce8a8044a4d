use std::sync::Arc;

use switchyard_cache::Registry;
use switchyard_core::{GatewayError, Group, Key, LbStrategy, Model, ModelAgent, RequestScope, clock};
use switchyard_quota::QuotaLedger;

use crate::balance::{Candidate, RoundRobin, SmoothWeighted};

/// A picked candidate and the number of enabled candidates it was picked from
#[derive(Debug, Clone)]
pub struct Picked<T> {
    pub total: usize,
    pub entity: Arc<T>,
}

/// Model, group, agent and key selection over the shared caches
#[derive(Debug)]
pub struct Selector {
    registry: Arc<Registry>,
    ledger: QuotaLedger,
    round_robin: RoundRobin,
    weighted: SmoothWeighted,
}

impl Selector {
    pub fn new(registry: Arc<Registry>, ledger: QuotaLedger) -> Self {
        Self {
            registry,
            ledger,
            round_robin: RoundRobin::new(),
            weighted: SmoothWeighted::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Resolve the group and model serving `model_name` among the bound groups
    ///
    /// Non-default groups are tried by descending weight; the default
    /// group is tried last. Groups that are disabled, expired or out of
    /// their own quota are passed over. `Ok(None)` means no bound group
    /// carries an enabled model with that name.
    pub async fn pick_group_and_model(
        &self,
        group_ids: &[String],
        model_name: &str,
    ) -> Result<Option<(Arc<Group>, Arc<Model>)>, GatewayError> {
        let mut groups = Vec::with_capacity(group_ids.len());
        for id in group_ids {
            match self.registry.get_or_load::<Group>(id).await? {
                Some(group) => groups.push(group),
                None => tracing::debug!(group = %id, "bound group not found"),
            }
        }

        let models = self.registry.models_named(model_name).await?;
        let now = clock::now_secs();

        if let [only] = groups.as_slice()
            && only.is_default
        {
            if !self.is_open(only, now).await {
                return Ok(None);
            }
            return Ok(Self::model_in_group(only, &models).map(|model| (Arc::clone(only), model)));
        }

        let default = groups.iter().position(|g| g.is_default).map(|i| groups.remove(i));
        groups.sort_by(|a, b| b.weight.cmp(&a.weight));

        for group in groups.into_iter().chain(default) {
            if !self.is_open(&group, now).await {
                continue;
            }
            if let Some(model) = Self::model_in_group(&group, &models) {
                tracing::debug!(group = %group.id, model = %model.id, "resolved group and model");
                return Ok(Some((group, model)));
            }
        }

        Ok(None)
    }

    /// Usable, and with quota left when the group limits its own spend
    async fn is_open(&self, group: &Group, now: i64) -> bool {
        if !group.is_usable(now) {
            return false;
        }
        if !group.is_limit_quota {
            return true;
        }

        if group.quota_expires_at > 0 && group.quota_expires_at <= now {
            tracing::debug!(group = %group.id, "group quota expired");
            return false;
        }
        if !self.ledger.has_quota(group).await {
            tracing::debug!(group = %group.id, "group quota exhausted");
            return false;
        }
        true
    }

    fn model_in_group(group: &Group, models: &[Arc<Model>]) -> Option<Arc<Model>> {
        models
            .iter()
            .find(|model| model.status.is_enabled() && group.models.iter().any(|id| *id == model.id))
            .cloned()
    }

    /// Pick an agent among those serving the model, balanced by the model's strategy
    pub async fn pick(&self, model: &Model, scope: &RequestScope) -> Result<Picked<ModelAgent>, GatewayError> {
        let agents = self.registry.agents_for_model(model).await?;
        self.choose(
            agents,
            model.lb_strategy,
            &format!("model:{}", model.id),
            scope,
            scope.pinned_agent.as_deref(),
        )
    }

    /// Pick an agent among the group's agents that serve the model, balanced by the group's strategy
    pub async fn pick_group(
        &self,
        model: &Model,
        group: &Group,
        scope: &RequestScope,
    ) -> Result<Picked<ModelAgent>, GatewayError> {
        let agents = self
            .registry
            .agents_for_group(&group.id)
            .await?
            .into_iter()
            .filter(|agent| agent.serves(model))
            .collect();

        self.choose(
            agents,
            group.lb_strategy,
            &format!("group:{}:{}", group.id, model.id),
            scope,
            scope.pinned_agent.as_deref(),
        )
    }

    /// Pick one of the agent's keys, balanced by the agent's strategy
    pub async fn pick_key(&self, agent: &ModelAgent, scope: &RequestScope) -> Result<Picked<Key>, GatewayError> {
        let keys = self.registry.keys_for_agent(&agent.id).await?;
        self.choose(keys, agent.lb_strategy, &format!("agent:{}", agent.id), scope, None)
    }

    /// Pick one of the keys scoped directly to a model served without agents
    pub async fn pick_model_key(&self, model: &Model, scope: &RequestScope) -> Result<Picked<Key>, GatewayError> {
        let keys = self.registry.keys_for_model(&model.id).await?;
        self.choose(keys, model.lb_strategy, &format!("model-keys:{}", model.id), scope, None)
    }

    fn choose<T: Candidate>(
        &self,
        candidates: Vec<Arc<T>>,
        strategy: LbStrategy,
        cursor: &str,
        scope: &RequestScope,
        pinned: Option<&str>,
    ) -> Result<Picked<T>, GatewayError> {
        if candidates.is_empty() {
            return Err(T::none_configured(cursor.to_owned()));
        }

        if let Some(pinned) = pinned
            && let Some(hit) = candidates.iter().find(|c| c.candidate_id() == pinned)
        {
            return Ok(Picked {
                total: candidates.iter().filter(|c| c.status().is_enabled()).count(),
                entity: Arc::clone(hit),
            });
        }

        let enabled: Vec<Arc<T>> = candidates.into_iter().filter(|c| c.status().is_enabled()).collect();
        if enabled.is_empty() {
            return Err(T::none_enabled(cursor.to_owned()));
        }

        let total = enabled.len();
        let pool = if total > 1 {
            let remaining: Vec<Arc<T>> = enabled
                .iter()
                .filter(|c| !c.is_excluded(&scope.exclusion))
                .cloned()
                .collect();
            if remaining.is_empty() { enabled } else { remaining }
        } else {
            enabled
        };

        let index = match strategy {
            LbStrategy::RoundRobin => self.round_robin.next(cursor, pool.len()),
            LbStrategy::Weighted => self.weighted.next(cursor, &pool),
        };

        Ok(Picked {
            total,
            entity: Arc::clone(&pool[index]),
        })
    }
}

#[cfg(test)]
mod tests {
    use switchyard_cache::Snapshot;
    use switchyard_core::Status;
    use switchyard_quota::mirror_key;
    use switchyard_store::Backends;

    use super::*;

    fn selector_with(snapshot: Snapshot) -> (Selector, Backends) {
        let backends = Backends::memory();
        let registry = Arc::new(Registry::new(Arc::clone(&backends.store)));
        registry.install(snapshot);
        let ledger = QuotaLedger::new(Arc::clone(&registry), Arc::clone(&backends.counters));
        (Selector::new(registry, ledger), backends)
    }

    fn selector(snapshot: Snapshot) -> Selector {
        selector_with(snapshot).0
    }

    fn agent(id: &str, status: Status) -> ModelAgent {
        ModelAgent {
            id: id.to_owned(),
            models: vec!["m1".to_owned()],
            weight: 1,
            status,
            ..ModelAgent::default()
        }
    }

    fn model() -> Model {
        Model {
            id: "m1".to_owned(),
            model: "gpt-4o".to_owned(),
            ..Model::default()
        }
    }

    fn group(id: &str, weight: i64, is_default: bool) -> Group {
        Group {
            id: id.to_owned(),
            models: vec!["m1".to_owned()],
            weight,
            is_default,
            ..Group::default()
        }
    }

    #[tokio::test]
    async fn no_agents_configured() {
        let selector = selector(Snapshot {
            models: vec![model()],
            ..Snapshot::default()
        });

        let err = selector.pick(&model(), &RequestScope::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableAgent { .. }));
    }

    #[tokio::test]
    async fn all_agents_disabled() {
        let selector = selector(Snapshot {
            models: vec![model()],
            agents: vec![agent("a1", Status::Disabled), agent("a2", Status::Disabled)],
            ..Snapshot::default()
        });

        let err = selector.pick(&model(), &RequestScope::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::AllAgentsExcluded { .. }));
    }

    #[tokio::test]
    async fn exclusion_skips_failed_agent() {
        let selector = selector(Snapshot {
            models: vec![model()],
            agents: vec![agent("a1", Status::Enabled), agent("a2", Status::Enabled)],
            ..Snapshot::default()
        });

        let mut scope = RequestScope::default();
        scope.exclusion.exclude_agent("a1");

        for _ in 0..4 {
            let picked = selector.pick(&model(), &scope).await.unwrap();
            assert_eq!(picked.entity.id, "a2");
            assert_eq!(picked.total, 2);
        }
    }

    #[tokio::test]
    async fn exclusion_never_empties_the_list() {
        let selector = selector(Snapshot {
            models: vec![model()],
            agents: vec![agent("a1", Status::Enabled), agent("a2", Status::Enabled)],
            ..Snapshot::default()
        });

        let mut scope = RequestScope::default();
        scope.exclusion.exclude_agent("a1");
        scope.exclusion.exclude_agent("a2");

        let picked = selector.pick(&model(), &scope).await.unwrap();
        assert!(["a1", "a2"].contains(&picked.entity.id.as_str()));
    }

    #[tokio::test]
    async fn pinned_agent_bypasses_balancing() {
        let selector = selector(Snapshot {
            models: vec![model()],
            agents: vec![agent("a1", Status::Enabled), agent("a2", Status::Enabled)],
            ..Snapshot::default()
        });

        let scope = RequestScope::pinned("a2");
        for _ in 0..3 {
            assert_eq!(selector.pick(&model(), &scope).await.unwrap().entity.id, "a2");
        }
    }

    #[tokio::test]
    async fn pinned_pick_counts_only_enabled_candidates() {
        let selector = selector(Snapshot {
            models: vec![model()],
            agents: vec![
                agent("a1", Status::Disabled),
                agent("a2", Status::Enabled),
                agent("a3", Status::Enabled),
            ],
            ..Snapshot::default()
        });

        let picked = selector.pick(&model(), &RequestScope::pinned("a3")).await.unwrap();
        assert_eq!(picked.entity.id, "a3");
        assert_eq!(picked.total, 2);
    }

    #[tokio::test]
    async fn default_group_is_tried_last() {
        let selector = selector(Snapshot {
            models: vec![model()],
            groups: vec![group("gd", 100, true), group("g1", 1, false), group("g2", 5, false)],
            ..Snapshot::default()
        });

        let ids = vec!["gd".to_owned(), "g1".to_owned(), "g2".to_owned()];
        let (group, model) = selector.pick_group_and_model(&ids, "gpt-4o").await.unwrap().unwrap();
        assert_eq!(group.id, "g2");
        assert_eq!(model.id, "m1");
    }

    #[tokio::test]
    async fn default_group_used_when_others_lack_model() {
        let mut other = group("g1", 10, false);
        other.models.clear();
        let selector = selector(Snapshot {
            models: vec![model()],
            groups: vec![group("gd", 0, true), other],
            ..Snapshot::default()
        });

        let ids = vec!["g1".to_owned(), "gd".to_owned()];
        let (group, _) = selector.pick_group_and_model(&ids, "gpt-4o").await.unwrap().unwrap();
        assert_eq!(group.id, "gd");
    }

    #[tokio::test]
    async fn unknown_model_is_not_an_error() {
        let selector = selector(Snapshot {
            models: vec![model()],
            groups: vec![group("g1", 1, false)],
            ..Snapshot::default()
        });

        let ids = vec!["g1".to_owned()];
        assert!(selector.pick_group_and_model(&ids, "claude").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_group_is_skipped() {
        let mut expired = group("g1", 10, false);
        expired.expires_at = 1;
        let selector = selector(Snapshot {
            models: vec![model()],
            groups: vec![expired, group("g2", 1, false)],
            ..Snapshot::default()
        });

        let ids = vec!["g1".to_owned(), "g2".to_owned()];
        let (group, _) = selector.pick_group_and_model(&ids, "gpt-4o").await.unwrap().unwrap();
        assert_eq!(group.id, "g2");
    }

    #[tokio::test]
    async fn group_out_of_quota_is_skipped() {
        let limited = |id: &str, weight, quota| Group {
            is_limit_quota: true,
            quota,
            ..group(id, weight, false)
        };
        let (selector, backends) = selector_with(Snapshot {
            models: vec![model()],
            groups: vec![
                limited("g-empty", 10, 0),
                limited("g-drained", 5, 500),
                group("gd", 0, true),
            ],
            ..Snapshot::default()
        });
        let ids = vec!["g-empty".to_owned(), "g-drained".to_owned(), "gd".to_owned()];

        let (group, _) = selector.pick_group_and_model(&ids, "gpt-4o").await.unwrap().unwrap();
        assert_eq!(group.id, "g-drained");

        // Drained on another instance; the cached group still shows 500
        backends
            .counters
            .set(&mirror_key(switchyard_core::EntityKind::Group, "g-drained"), 0)
            .await
            .unwrap();
        let (group, _) = selector.pick_group_and_model(&ids, "gpt-4o").await.unwrap().unwrap();
        assert_eq!(group.id, "gd");
    }

    #[tokio::test]
    async fn group_with_expired_quota_is_skipped() {
        let expired = Group {
            is_limit_quota: true,
            quota: 100,
            quota_expires_at: 1,
            ..group("g1", 10, false)
        };
        let selector = selector(Snapshot {
            models: vec![model()],
            groups: vec![expired],
            ..Snapshot::default()
        });

        let ids = vec!["g1".to_owned()];
        assert!(selector.pick_group_and_model(&ids, "gpt-4o").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn group_agents_must_serve_the_model() {
        let mut unrelated = agent("a2", Status::Enabled);
        unrelated.models.clear();
        let mut g = group("g1", 1, false);
        g.model_agents = vec!["a1".to_owned(), "a2".to_owned()];
        let selector = selector(Snapshot {
            models: vec![model()],
            agents: vec![agent("a1", Status::Enabled), unrelated],
            groups: vec![g.clone()],
            ..Snapshot::default()
        });

        let picked = selector.pick_group(&model(), &g, &RequestScope::default()).await.unwrap();
        assert_eq!(picked.entity.id, "a1");
        assert_eq!(picked.total, 1);
    }

    #[tokio::test]
    async fn keys_are_picked_per_agent() {
        let a1 = agent("a1", Status::Enabled);
        let key = |id: &str, status| Key {
            id: id.to_owned(),
            model_agents: vec!["a1".to_owned()],
            weight: 1,
            status,
            ..Key::default()
        };
        let selector = selector(Snapshot {
            models: vec![model()],
            agents: vec![a1.clone()],
            keys: vec![key("k1", Status::Disabled), key("k2", Status::Enabled)],
            ..Snapshot::default()
        });

        let picked = selector.pick_key(&a1, &RequestScope::default()).await.unwrap();
        assert_eq!(picked.entity.id, "k2");
        assert_eq!(picked.total, 1);
    }
}
