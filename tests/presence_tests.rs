mod common;

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use serial_test::serial;

use breakoutglobe_server::error::AppError;
use breakoutglobe_server::models::{LatLng, Session};
use breakoutglobe_server::store::presence::PresenceStore;

async fn store_with_ttl(ttl: Duration) -> PresenceStore {
    let (_client, conn) = common::test_redis().await;
    PresenceStore::new(conn, ttl)
}

fn session(map_id: Uuid) -> Session {
    let now = Utc::now();
    Session {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        map_id,
        position: LatLng::new(48.8566, 2.3522),
        created_at: now,
        last_active: now,
    }
}

#[tokio::test]
async fn put_then_get_round_trips() {
    let store = store_with_ttl(Duration::from_secs(30)).await;
    let session = session(Uuid::new_v4());

    store.put(&session).await.unwrap();
    let fetched = store.get(session.id).await.unwrap();
    assert_eq!(fetched.user_id, session.user_id);
    assert_eq!(fetched.map_id, session.map_id);
    assert_eq!(fetched.position, session.position);
}

#[tokio::test]
async fn get_of_unknown_session_is_not_found() {
    let store = store_with_ttl(Duration::from_secs(30)).await;
    assert!(matches!(
        store.get(Uuid::new_v4()).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
#[serial]
async fn record_expires_without_heartbeat() {
    let store = store_with_ttl(Duration::from_millis(300)).await;
    let session = session(Uuid::new_v4());
    store.put(&session).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(matches!(
        store.get(session.id).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
#[serial]
async fn heartbeat_keeps_the_record_alive() {
    let store = store_with_ttl(Duration::from_millis(400)).await;
    let session = session(Uuid::new_v4());
    store.put(&session).await.unwrap();

    // Three heartbeats, each inside the window, spanning more than one TTL.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        store.heartbeat(session.id).await.unwrap();
    }

    let fetched = store.get(session.id).await.unwrap();
    assert!(
        fetched.last_active > session.last_active,
        "each heartbeat advances last_active"
    );
}

#[tokio::test]
#[serial]
async fn heartbeat_on_expired_session_is_not_found() {
    let store = store_with_ttl(Duration::from_millis(200)).await;
    let session = session(Uuid::new_v4());
    store.put(&session).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(matches!(
        store.heartbeat(session.id).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn update_position_moves_and_renews() {
    let store = store_with_ttl(Duration::from_secs(30)).await;
    let session = session(Uuid::new_v4());
    store.put(&session).await.unwrap();

    let target = LatLng::new(-33.86, 151.2);
    store.update_position(session.id, target).await.unwrap();

    let fetched = store.get(session.id).await.unwrap();
    assert_eq!(fetched.position, target);
    assert!(fetched.last_active >= session.last_active);
}

#[tokio::test]
#[serial]
async fn list_by_map_returns_only_live_sessions_and_prunes() {
    let store = store_with_ttl(Duration::from_millis(300)).await;
    let map_id = Uuid::new_v4();

    let stays = session(map_id);
    store.put(&stays).await.unwrap();
    let expires = session(map_id);
    store.put(&expires).await.unwrap();

    // Keep one alive past the other's expiry.
    tokio::time::sleep(Duration::from_millis(200)).await;
    store.heartbeat(stays.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let listed = store.list_by_map(map_id).await.unwrap();
    let ids: Vec<Uuid> = listed.iter().map(|s| s.id).collect();
    assert!(ids.contains(&stays.id));
    assert!(!ids.contains(&expires.id), "expired session must be pruned");
}

#[tokio::test]
async fn remove_is_idempotent() {
    let store = store_with_ttl(Duration::from_secs(30)).await;
    let map_id = Uuid::new_v4();
    let session = session(map_id);
    store.put(&session).await.unwrap();

    store.remove(session.id).await.unwrap();
    assert!(matches!(
        store.get(session.id).await,
        Err(AppError::NotFound(_))
    ));
    // Second removal of the same id is fine.
    store.remove(session.id).await.unwrap();

    assert!(store.list_by_map(map_id).await.unwrap().is_empty());
}
