mod common;

use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

async fn setup() -> (axum::Router, sqlx::PgPool, Uuid) {
    let state = common::test_state().await;
    let pool = state.pool.clone();
    let map_id = common::create_map(&pool).await;
    (common::create_test_app(state), pool, map_id)
}

// ============================================================================
// POST /api/pois — creation and validation
// ============================================================================

#[tokio::test]
async fn create_poi_returns_201_with_defaults() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;

    let (status, body) = common::post_json_as(
        app,
        "/api/pois",
        creator,
        json!({
            "map_id": map_id,
            "name": "Coffee Corner",
            "description": "Informal chats",
            "position": { "lat": 52.52, "lng": 13.405 },
        }),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["name"], "Coffee Corner");
    assert_eq!(body["max_participants"], 10);
    assert_eq!(body["participant_count"], 0);
    assert_eq!(body["created_by"], json!(creator));
}

#[tokio::test]
async fn create_poi_requires_principal() {
    let (app, _pool, map_id) = setup().await;
    let (status, _) = common::post_json(
        app,
        "/api/pois",
        json!({
            "map_id": map_id,
            "name": "Anonymous",
            "position": { "lat": 0.0, "lng": 0.0 },
        }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_poi_rejects_empty_name_and_bad_capacity() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;

    let (status, _) = common::post_json_as(
        app.clone(),
        "/api/pois",
        creator,
        json!({ "map_id": map_id, "name": "", "position": { "lat": 0.0, "lng": 0.0 } }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = common::post_json_as(
        app,
        "/api/pois",
        creator,
        json!({
            "map_id": map_id,
            "name": "Too big",
            "position": { "lat": 0.0, "lng": 0.0 },
            "max_participants": 51,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_poi_enforces_the_minimum_distance() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;
    common::create_poi(app.clone(), creator, map_id, 0.0, 0.0, json!({})).await;

    // ~0.00089 deg latitude is just under 100 m at the equator.
    let (status, body) = common::post_json_as(
        app.clone(),
        "/api/pois",
        creator,
        json!({
            "map_id": map_id,
            "name": "Too close",
            "position": { "lat": 0.00089, "lng": 0.0 },
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
    assert_eq!(body["code"], "DUPLICATE_LOCATION");

    // Just over 100 m is allowed: "minimum distance" rejects strictly-closer.
    let (status, body) = common::post_json_as(
        app,
        "/api/pois",
        creator,
        json!({
            "map_id": map_id,
            "name": "Far enough",
            "position": { "lat": 0.00091, "lng": 0.0 },
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
}

#[tokio::test]
async fn proximity_rule_is_per_map() {
    let (app, pool, map_id) = setup().await;
    let other_map = common::create_map(&pool).await;
    let creator = common::create_user(&pool).await;

    common::create_poi(app.clone(), creator, map_id, 10.0, 10.0, json!({})).await;

    // Same coordinates on a different map are fine.
    let (status, _) = common::post_json_as(
        app,
        "/api/pois",
        creator,
        json!({
            "map_id": other_map,
            "name": "Twin",
            "position": { "lat": 10.0, "lng": 10.0 },
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

// ============================================================================
// GET /api/pois — listing
// ============================================================================

#[tokio::test]
async fn list_pois_filters_by_viewport() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;
    let inside = common::create_poi(app.clone(), creator, map_id, 10.0, 10.0, json!({})).await;
    let outside = common::create_poi(app.clone(), creator, map_id, 50.0, 50.0, json!({})).await;

    let uri = format!(
        "/api/pois?map_id={map_id}&min_lat=0&max_lat=20&min_lng=0&max_lng=20"
    );
    let (status, body) = common::get_json(app.clone(), &uri).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&inside["id"].as_str().unwrap()));
    assert!(!ids.contains(&outside["id"].as_str().unwrap()));

    // Partial bounds are a client error.
    let uri = format!("/api/pois?map_id={map_id}&min_lat=0");
    let (status, _) = common::get_json(app, &uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// PUT / DELETE /api/pois/:id — authorization
// ============================================================================

#[tokio::test]
async fn creator_can_update_their_poi() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;
    let poi = common::create_poi(app.clone(), creator, map_id, 0.0, 0.0, json!({})).await;
    let poi_id = poi["id"].as_str().unwrap();

    let (status, body) = common::put_json_as(
        app,
        &format!("/api/pois/{poi_id}"),
        creator,
        json!({ "name": "Renamed" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["name"], "Renamed");
    // Untouched fields survive a partial update.
    assert_eq!(body["max_participants"], 10);
}

#[tokio::test]
async fn stranger_cannot_update_or_delete() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;
    let stranger = common::create_user(&pool).await;
    let poi = common::create_poi(app.clone(), creator, map_id, 0.0, 0.0, json!({})).await;
    let poi_id = poi["id"].as_str().unwrap();

    let (status, _) = common::put_json_as(
        app.clone(),
        &format!("/api/pois/{poi_id}"),
        stranger,
        json!({ "name": "Hijacked" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = common::delete_as(app, &format!("/api/pois/{poi_id}"), stranger).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_can_delete_user_created_poi() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;
    let admin = common::create_user_with_role(&pool, "admin").await;
    let poi = common::create_poi(app.clone(), creator, map_id, 0.0, 0.0, json!({})).await;
    let poi_id = poi["id"].as_str().unwrap();

    let (status, _) = common::delete_as(app.clone(), &format!("/api/pois/{poi_id}"), admin).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = common::get_json(app, &format!("/api/pois/{poi_id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_cannot_touch_superadmin_poi() {
    let (app, pool, map_id) = setup().await;
    let superadmin = common::create_user_with_role(&pool, "superadmin").await;
    let admin = common::create_user_with_role(&pool, "admin").await;
    let poi = common::create_poi(app.clone(), superadmin, map_id, 0.0, 0.0, json!({})).await;
    let poi_id = poi["id"].as_str().unwrap();

    let (status, _) = common::put_json_as(
        app.clone(),
        &format!("/api/pois/{poi_id}"),
        admin,
        json!({ "name": "Nope" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The superadmin outranks everyone.
    let (status, _) = common::delete_as(app, &format!("/api/pois/{poi_id}"), superadmin).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

// ============================================================================
// Join / leave
// ============================================================================

#[tokio::test]
async fn join_and_leave_track_counts() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;
    let user = common::create_user(&pool).await;
    let poi = common::create_poi(app.clone(), creator, map_id, 0.0, 0.0, json!({})).await;
    let poi_id = poi["id"].as_str().unwrap().to_owned();

    let (status, body) =
        common::post_empty_as(app.clone(), &format!("/api/pois/{poi_id}/join"), user).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["current_count"], 1);

    let (_, fetched) = common::get_json(app.clone(), &format!("/api/pois/{poi_id}")).await;
    assert_eq!(fetched["participant_count"], 1);

    let (status, body) =
        common::post_empty_as(app, &format!("/api/pois/{poi_id}/leave"), user).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_count"], 0);
}

#[tokio::test]
async fn double_join_is_already_member_and_count_is_stable() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;
    let user = common::create_user(&pool).await;
    let poi = common::create_poi(app.clone(), creator, map_id, 0.0, 0.0, json!({})).await;
    let poi_id = poi["id"].as_str().unwrap().to_owned();

    common::post_empty_as(app.clone(), &format!("/api/pois/{poi_id}/join"), user).await;
    let (status, body) =
        common::post_empty_as(app.clone(), &format!("/api/pois/{poi_id}/join"), user).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ALREADY_MEMBER");

    let (_, fetched) = common::get_json(app, &format!("/api/pois/{poi_id}")).await;
    assert_eq!(fetched["participant_count"], 1);
}

#[tokio::test]
async fn join_at_capacity_is_rejected_with_poi_full() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;
    let poi = common::create_poi(
        app.clone(),
        creator,
        map_id,
        0.0,
        0.0,
        json!({ "max_participants": 2 }),
    )
    .await;
    let poi_id = poi["id"].as_str().unwrap().to_owned();

    let u1 = common::create_user(&pool).await;
    let u2 = common::create_user(&pool).await;
    let u3 = common::create_user(&pool).await;

    // Filling to capacity-1 succeeds, the capacity-th join succeeds, then Full.
    common::post_empty_as(app.clone(), &format!("/api/pois/{poi_id}/join"), u1).await;
    let (status, _) =
        common::post_empty_as(app.clone(), &format!("/api/pois/{poi_id}/join"), u2).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) =
        common::post_empty_as(app.clone(), &format!("/api/pois/{poi_id}/join"), u3).await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
    assert_eq!(body["code"], "POI_FULL");

    let (_, fetched) = common::get_json(app, &format!("/api/pois/{poi_id}")).await;
    assert_eq!(fetched["participant_count"], 2);
}

#[tokio::test]
async fn joining_a_second_poi_leaves_the_first() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;
    let user = common::create_user(&pool).await;
    let p1 = common::create_poi(app.clone(), creator, map_id, 0.0, 0.0, json!({})).await;
    let p2 = common::create_poi(app.clone(), creator, map_id, 1.0, 1.0, json!({})).await;
    let p1_id = p1["id"].as_str().unwrap().to_owned();
    let p2_id = p2["id"].as_str().unwrap().to_owned();

    common::post_empty_as(app.clone(), &format!("/api/pois/{p1_id}/join"), user).await;
    let (status, body) =
        common::post_empty_as(app.clone(), &format!("/api/pois/{p2_id}/join"), user).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (_, first) = common::get_json(app.clone(), &format!("/api/pois/{p1_id}")).await;
    let (_, second) = common::get_json(app, &format!("/api/pois/{p2_id}")).await;
    assert_eq!(first["participant_count"], 0);
    assert_eq!(second["participant_count"], 1);
}

#[tokio::test]
async fn leave_of_non_member_is_a_noop() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;
    let member = common::create_user(&pool).await;
    let outsider = common::create_user(&pool).await;
    let poi = common::create_poi(app.clone(), creator, map_id, 0.0, 0.0, json!({})).await;
    let poi_id = poi["id"].as_str().unwrap().to_owned();

    common::post_empty_as(app.clone(), &format!("/api/pois/{poi_id}/join"), member).await;

    let (status, body) =
        common::post_empty_as(app, &format!("/api/pois/{poi_id}/leave"), outsider).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_count"], 1, "count must be unchanged");
}

#[tokio::test]
async fn join_unknown_poi_returns_404() {
    let (app, pool, _map_id) = setup().await;
    let user = common::create_user(&pool).await;
    let (status, _) =
        common::post_empty_as(app, &format!("/api/pois/{}/join", Uuid::new_v4()), user).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_cascades_members_out() {
    let (app, pool, map_id) = setup().await;
    let creator = common::create_user(&pool).await;
    let member = common::create_user(&pool).await;
    let poi = common::create_poi(app.clone(), creator, map_id, 0.0, 0.0, json!({})).await;
    let poi_id = poi["id"].as_str().unwrap().to_owned();

    common::post_empty_as(app.clone(), &format!("/api/pois/{poi_id}/join"), member).await;
    let (status, _) = common::delete_as(app.clone(), &format!("/api/pois/{poi_id}"), creator).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The member is free to join elsewhere immediately.
    let other = common::create_poi(app.clone(), creator, map_id, 5.0, 5.0, json!({})).await;
    let other_id = other["id"].as_str().unwrap().to_owned();
    let (status, body) =
        common::post_empty_as(app, &format!("/api/pois/{other_id}/join"), member).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}
