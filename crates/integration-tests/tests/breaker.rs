mod harness;

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::future::join_all;
use harness::eventually;
use harness::seed::Seed;
use harness::world::{World, test_config};
use switchyard_core::{ChangeAction, Channel, EntityKind, Key, ModelAgent, Status};
use switchyard_routing::error_counter_key;

#[tokio::test]
async fn never_disable_agent_keeps_counting() {
    let mut seed = Seed::standard();
    seed.agents[0].is_never_disable = true;
    let mut config = test_config();
    config.breaker.agent_error_threshold = 3;
    let world = World::start_with(&seed, config).await;

    for _ in 0..20 {
        assert!(!world.gateway.breaker.record_error("a1", "upstream 500").await.unwrap());
    }

    let agent = world.gateway.registry.cached::<ModelAgent>("a1").unwrap();
    assert_eq!(agent.status, Status::Enabled);
    assert!(!agent.is_auto_disabled);
    assert_eq!(
        world
            .gateway
            .backends
            .counters
            .get(&error_counter_key::<ModelAgent>("a1"))
            .await
            .unwrap(),
        Some(20)
    );
}

#[tokio::test]
async fn concurrent_errors_flip_exactly_once() {
    let mut config = test_config();
    config.breaker.key_error_threshold = 5;
    let world = World::start_with(&Seed::standard(), config).await;

    let mut changes = world
        .gateway
        .backends
        .bus
        .subscribe(&[Channel::Entity(EntityKind::Key)])
        .await
        .unwrap();

    let errors = (0..40).map(|_| {
        let breaker = Arc::clone(&world.gateway.breaker);
        tokio::spawn(async move { breaker.record_error_key("k1", "rate limited").await })
    });
    let flips = join_all(errors)
        .await
        .into_iter()
        .filter(|result| *result.as_ref().unwrap().as_ref().unwrap())
        .count();
    assert_eq!(flips, 1);

    let (channel, message) = changes.next().await.unwrap().unwrap();
    assert_eq!(channel, Channel::Entity(EntityKind::Key));
    assert_eq!(message.action, ChangeAction::Status);
    let disabled: Key = message.new_entity().unwrap().unwrap();
    assert_eq!(disabled.status, Status::Disabled);
    assert_eq!(disabled.auto_disabled_reason.as_deref(), Some("rate limited"));

    // No second announcement follows
    let second = tokio::time::timeout(std::time::Duration::from_millis(100), changes.next()).await;
    assert!(second.is_err());

    let stored = world.gateway.backends.store.load::<Key>("k1").await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Disabled);
    assert!(stored.is_auto_disabled);
}

#[tokio::test]
async fn operator_reenable_resets_the_day_counter() {
    let mut config = test_config();
    config.breaker.agent_error_threshold = 2;
    let world = World::start_with(&Seed::standard(), config).await;
    let gateway = &world.gateway;

    gateway.breaker.record_error("a1", "timeout").await.unwrap();
    assert!(gateway.breaker.record_error("a1", "timeout").await.unwrap());
    let disabled = gateway.registry.cached::<ModelAgent>("a1").unwrap();

    let enabled = ModelAgent {
        status: Status::Enabled,
        is_auto_disabled: false,
        auto_disabled_reason: None,
        ..(*disabled).clone()
    };
    gateway.backends.store.save(&enabled).await.unwrap();
    gateway
        .backends
        .bus
        .announce::<ModelAgent>(ChangeAction::Status, Some(&*disabled), Some(&enabled))
        .await
        .unwrap();

    let registry = &gateway.registry;
    eventually("re-enable", || {
        registry
            .cached::<ModelAgent>("a1")
            .is_some_and(|a| a.status == Status::Enabled)
    })
    .await;

    let counters = Arc::clone(&gateway.backends.counters);
    let key = error_counter_key::<ModelAgent>("a1");
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while counters.get(&key).await.unwrap().is_some() {
        assert!(tokio::time::Instant::now() < deadline, "error counter was not cleared");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // A fresh day budget: one error no longer trips the breaker
    assert!(!gateway.breaker.record_error("a1", "timeout").await.unwrap());
}

#[tokio::test]
async fn two_instances_flip_a_shared_key_once() {
    let config = || {
        let mut config = test_config();
        config.breaker.key_error_threshold = 5;
        config
    };
    let world = World::start_with(&Seed::standard(), config()).await;
    let peer = world.peer_with(config()).await;

    let mut changes = world
        .gateway
        .backends
        .bus
        .subscribe(&[Channel::Entity(EntityKind::Key)])
        .await
        .unwrap();

    let errors = (0..30).map(|i| {
        let breaker = if i % 2 == 0 {
            Arc::clone(&world.gateway.breaker)
        } else {
            Arc::clone(&peer.breaker)
        };
        tokio::spawn(async move { breaker.record_error_key("k1", "rate limited").await })
    });
    let flips = join_all(errors)
        .await
        .into_iter()
        .filter(|result| *result.as_ref().unwrap().as_ref().unwrap())
        .count();
    assert_eq!(flips, 1);

    let (_, message) = changes.next().await.unwrap().unwrap();
    assert_eq!(message.action, ChangeAction::Status);
    let second = tokio::time::timeout(std::time::Duration::from_millis(100), changes.next()).await;
    assert!(second.is_err());

    // Both caches converge on the disabled key
    for gateway in [&world.gateway, &peer] {
        let registry = &gateway.registry;
        eventually("disabled on every instance", || {
            registry
                .cached::<Key>("k1")
                .is_some_and(|k| k.status == Status::Disabled)
        })
        .await;
    }
}
