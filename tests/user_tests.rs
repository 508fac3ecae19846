mod common;

use axum::http::StatusCode;
use serde_json::json;

#[tokio::test]
async fn update_profile_changes_display_name() {
    let state = common::test_state().await;
    let pool = state.pool.clone();
    let app = common::create_test_app(state);
    let user = common::create_user(&pool).await;

    let (status, body) = common::put_json_as(
        app,
        "/api/users/profile",
        user,
        json!({ "display_name": "Margaret" }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["display_name"], "Margaret");
    assert_eq!(body["id"], json!(user));
}

#[tokio::test]
async fn update_profile_requires_principal() {
    let state = common::test_state().await;
    let app = common::create_test_app(state);

    let (status, _) = common::put_json(
        app,
        "/api/users/profile",
        json!({ "display_name": "Nobody" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn update_profile_rejects_empty_payload_and_bad_name() {
    let state = common::test_state().await;
    let pool = state.pool.clone();
    let app = common::create_test_app(state);
    let user = common::create_user(&pool).await;

    let (status, _) = common::put_json_as(app.clone(), "/api/users/profile", user, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = common::put_json_as(
        app,
        "/api/users/profile",
        user,
        json!({ "display_name": "" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn avatar_url_updates_are_preserved_across_partial_updates() {
    let state = common::test_state().await;
    let pool = state.pool.clone();
    let app = common::create_test_app(state);
    let user = common::create_user(&pool).await;

    common::put_json_as(
        app.clone(),
        "/api/users/profile",
        user,
        json!({ "avatar_url": "https://cdn.example.com/a.png" }),
    )
    .await;

    let (status, body) = common::put_json_as(
        app,
        "/api/users/profile",
        user,
        json!({ "display_name": "Ada" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["display_name"], "Ada");
    assert_eq!(body["avatar_url"], "https://cdn.example.com/a.png");
}
