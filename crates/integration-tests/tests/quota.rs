mod harness;

use std::sync::Arc;

use futures_util::future::join_all;
use harness::seed::{SECRET, Seed};
use harness::world::World;
use switchyard_core::{AppKey, EntityKind, GatewayError, User, clock};
use switchyard_quota::{Balance, usage_key};

#[tokio::test]
async fn app_key_spend_updates_cache_and_store() {
    let world = World::start(&Seed::standard()).await;
    let ledger = &world.gateway.ledger;

    let balance = ledger.spend_quota(EntityKind::AppKey, "ak1", 40).await.unwrap();

    assert_eq!(balance, Balance { quota: 60, used_quota: 40 });
    assert_eq!(ledger.cache_quota(EntityKind::AppKey, "ak1").await.unwrap(), Some(60));
    assert_eq!(world.gateway.registry.app_key("ak1").unwrap().quota, 60);

    let stored = world.gateway.backends.store.load::<AppKey>("ak1").await.unwrap().unwrap();
    assert_eq!(stored.quota, 60);
    assert_eq!(stored.used_quota, 40);
}

#[tokio::test]
async fn concurrent_spends_lose_no_updates() {
    let world = World::start(&Seed::standard()).await;
    let ledger = Arc::new(world.gateway.ledger.clone());

    let spends = (0..50).map(|_| {
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move { ledger.spend_quota(EntityKind::User, "u1", 3).await })
    });
    for result in join_all(spends).await {
        result.unwrap().unwrap();
    }

    let stored = world.gateway.backends.store.load::<User>("u1").await.unwrap().unwrap();
    assert_eq!(stored.quota, 1_000 - 150);
    assert_eq!(stored.used_quota, 150);

    let day = usage_key(&clock::day_stamp());
    assert_eq!(
        world.gateway.backends.counters.hget(&day, "user:u1").await.unwrap(),
        Some(150)
    );
}

#[tokio::test]
async fn exhausted_app_key_is_refused_at_auth() {
    let world = World::start(&Seed::standard()).await;

    world.gateway.ledger.spend_quota(EntityKind::AppKey, "ak1", 100).await.unwrap();

    let err = world.gateway.auth.authenticate(SECRET, None).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::QuotaExhausted {
            entity: EntityKind::AppKey
        }
    ));
}

#[tokio::test]
async fn spend_on_one_instance_is_refused_on_another() {
    let world = World::start(&Seed::standard()).await;
    let peer = world.peer().await;

    peer.ledger.spend_quota(EntityKind::AppKey, "ak1", 100).await.unwrap();

    // Spends are not announced, so this instance still caches the full balance
    assert_eq!(world.gateway.registry.app_key("ak1").unwrap().quota, 100);

    let err = world.gateway.auth.authenticate(SECRET, None).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::QuotaExhausted {
            entity: EntityKind::AppKey
        }
    ));
}
