//! Bounded retry loop around one upstream call

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use switchyard_config::RetryConfig;
use switchyard_core::{GatewayError, Group, Key, Model, ModelAgent, Session};
use thiserror::Error;

use crate::breaker::Breaker;
use crate::selector::{Picked, Selector};

/// Backend chosen for one attempt
#[derive(Debug, Clone)]
pub struct Route {
    pub group: Arc<Group>,
    pub model: Arc<Model>,
    /// `None` when the model is served by directly scoped keys
    pub agent: Option<Arc<ModelAgent>>,
    pub key: Arc<Key>,
    /// 1-based attempt number within the current model
    pub attempt: u32,
}

/// Failure reported by the external translator call
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub message: String,
    /// Whether another backend might succeed where this one failed
    pub retryable: bool,
}

impl UpstreamError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Result of a successful dispatch
#[derive(Debug)]
pub struct Dispatched<T> {
    pub route: Route,
    /// Attempts spent across the model and its fallback
    pub attempts: u32,
    pub value: T,
}

/// Resolves, picks, calls and retries with a narrowing candidate set
#[derive(Debug, Clone)]
pub struct Dispatcher {
    selector: Arc<Selector>,
    breaker: Arc<Breaker>,
    retry: RetryConfig,
}

impl Dispatcher {
    pub fn new(selector: Arc<Selector>, breaker: Arc<Breaker>, retry: RetryConfig) -> Self {
        Self {
            selector,
            breaker,
            retry,
        }
    }

    /// Route one request for `model_name`, retrying on upstream failures
    ///
    /// Failed agents and keys join the session's exclusion set and are
    /// reported to the breaker in the background. Once the model's own
    /// candidates are exhausted, a configured fallback model gets one
    /// more run with a fresh budget.
    pub async fn dispatch<T, F, Fut>(
        &self,
        session: &mut Session,
        model_name: &str,
        mut call: F,
    ) -> Result<Dispatched<T>, GatewayError>
    where
        F: FnMut(Route) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        if !session.allows_model(model_name) {
            return Err(GatewayError::NoEligibleModel {
                model: model_name.to_owned(),
            });
        }

        let groups = session.bound_groups();
        let Some((group, model)) = self.selector.pick_group_and_model(&groups, model_name).await? else {
            return Err(GatewayError::NoEligibleModel {
                model: model_name.to_owned(),
            });
        };

        let mut spent = 0;
        let err = match self.run(session, group, Arc::clone(&model), &mut call, &mut spent).await {
            Ok(mut dispatched) => {
                dispatched.attempts = spent;
                return Ok(dispatched);
            }
            Err(err) => err,
        };

        let Some(fallback) = model.fallback.as_ref().filter(|_| triggers_fallback(&err)) else {
            return Err(err);
        };
        let Some(fallback_name) = fallback.model.as_deref().filter(|name| *name != model.model) else {
            return Err(err);
        };

        let Some((fallback_group, fallback_model)) =
            self.selector.pick_group_and_model(&groups, fallback_name).await?
        else {
            tracing::warn!(model = %model.model, fallback = fallback_name, "fallback model not available");
            return Err(err);
        };

        tracing::info!(model = %model.model, fallback = fallback_name, error = %err, "switching to fallback model");
        session.scope.exclusion.reset();
        if let Some(agent) = &fallback.agent {
            session.scope.pinned_agent = Some(agent.clone());
        }

        let mut dispatched = self
            .run(session, fallback_group, fallback_model, &mut call, &mut spent)
            .await?;
        dispatched.attempts = spent;
        Ok(dispatched)
    }

    async fn run<T, F, Fut>(
        &self,
        session: &mut Session,
        group: Arc<Group>,
        model: Arc<Model>,
        call: &mut F,
        spent: &mut u32,
    ) -> Result<Dispatched<T>, GatewayError>
    where
        F: FnMut(Route) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut budget = None;
        let mut attempt = 0;
        let mut keyless = HashSet::new();

        loop {
            let agent = self.pick_agent(session, &group, &model).await?;
            let key = match &agent {
                None => self.selector.pick_model_key(&model, &session.scope).await?,
                Some(agent) => match self.selector.pick_key(&agent.entity, &session.scope).await {
                    Ok(key) => key,
                    Err(err @ (GatewayError::NoAvailableKey { .. } | GatewayError::AllKeysExcluded { .. })) => {
                        attempt += 1;
                        *spent += 1;
                        let budget = *budget.get_or_insert_with(|| self.budget(Some(agent.total), 0));

                        // Seeing a keyless agent twice means every other agent is excluded
                        if !keyless.insert(agent.entity.id.clone()) || attempt >= budget {
                            return Err(err);
                        }

                        tracing::warn!(
                            model = %model.id,
                            agent = %agent.entity.id,
                            attempt,
                            budget,
                            error = %err,
                            "agent has no usable key, trying another"
                        );
                        session.scope.exclusion.exclude_agent(agent.entity.id.clone());
                        continue;
                    }
                    Err(err) => return Err(err),
                },
            };
            attempt += 1;
            *spent += 1;

            let budget = *budget.get_or_insert_with(|| self.budget(agent.as_ref().map(|a| a.total), key.total));

            let route = Route {
                group: Arc::clone(&group),
                model: Arc::clone(&model),
                agent: agent.as_ref().map(|a| Arc::clone(&a.entity)),
                key: Arc::clone(&key.entity),
                attempt,
            };

            let failure = match call(route.clone()).await {
                Ok(value) => {
                    return Ok(Dispatched {
                        route,
                        attempts: attempt,
                        value,
                    });
                }
                Err(failure) => failure,
            };

            tracing::warn!(
                model = %model.id,
                agent = route.agent.as_ref().map(|a| a.id.as_str()),
                key = %route.key.id,
                attempt,
                budget,
                retryable = failure.retryable,
                error = %failure.message,
                "upstream attempt failed"
            );

            if let Some(agent) = &route.agent {
                session.scope.exclusion.exclude_agent(agent.id.clone());
            }
            session.scope.exclusion.exclude_key(route.key.id.clone());
            self.report(&route, &failure.message);

            if !failure.retryable || attempt >= budget {
                return Err(GatewayError::Upstream {
                    attempts: attempt,
                    message: failure.message,
                });
            }
        }
    }

    /// The agent to route through, or `None` when the model is served by directly scoped keys
    async fn pick_agent(
        &self,
        session: &Session,
        group: &Group,
        model: &Model,
    ) -> Result<Option<Picked<ModelAgent>>, GatewayError> {
        let scope = &session.scope;
        let agent = if group.model_agents.is_empty() {
            self.selector.pick(model, scope).await
        } else {
            self.selector.pick_group(model, group, scope).await
        };

        match agent {
            Ok(agent) => Ok(Some(agent)),
            Err(GatewayError::NoAvailableAgent { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn budget(&self, agents: Option<usize>, keys: usize) -> u32 {
        let agents = agents.unwrap_or(1);
        if agents <= 1 && keys <= 1 {
            return 1;
        }

        match u32::try_from(self.retry.max_attempts) {
            Ok(max) => max.max(1),
            Err(_) => u32::try_from(agents.max(keys)).unwrap_or(u32::MAX),
        }
    }

    fn report(&self, route: &Route, reason: &str) {
        let breaker = Arc::clone(&self.breaker);
        let agent_id = route.agent.as_ref().map(|a| a.id.clone());
        let key_id = route.key.id.clone();
        let reason = reason.to_owned();

        tokio::spawn(async move {
            if let Some(agent_id) = agent_id
                && let Err(e) = breaker.record_error(&agent_id, &reason).await
            {
                tracing::error!(agent = %agent_id, error = %e, "failed to record agent error");
            }
            if let Err(e) = breaker.record_error_key(&key_id, &reason).await {
                tracing::error!(key = %key_id, error = %e, "failed to record key error");
            }
        });
    }
}

fn triggers_fallback(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::Upstream { .. }
            | GatewayError::NoAvailableAgent { .. }
            | GatewayError::NoAvailableKey { .. }
            | GatewayError::AllAgentsExcluded { .. }
            | GatewayError::AllKeysExcluded { .. }
    )
}
