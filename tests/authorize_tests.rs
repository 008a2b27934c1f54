// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! `/authorize` redirect tests.

use axum::body::to_bytes;
use axum::http::StatusCode;
use idgate::config::Config;
use idgate::models::ProviderEmail;

mod common;
use common::{create_test_app, create_test_app_with, location};

fn state_param(url: &str) -> String {
    let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
    let raw = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("state="))
        .expect("state parameter missing");
    urlencoding::decode(raw).unwrap().into_owned()
}

#[tokio::test]
async fn test_authorize_redirects_with_signed_state() {
    let app = create_test_app_with(
        Config::test_default(),
        vec![ProviderEmail::new("stub@example.com", true, true)],
    );

    let response = app.get("/authorize?provider=Stub&redirect_to=http://localhost:5173/after").await;
    assert_eq!(response.status(), StatusCode::FOUND);

    let url = location(&response);
    assert!(url.starts_with("https://stub.example/authorize?state="));

    let intent = app.state.state_codec.decode(&state_param(&url)).unwrap();
    assert_eq!(intent.provider, "stub");
    assert_eq!(intent.instance_id, app.config().instance_id);
    assert_eq!(intent.referrer.as_deref(), Some("http://localhost:5173/after"));
    assert!(intent.invite_token.is_none());
}

#[tokio::test]
async fn test_authorize_unknown_provider() {
    let (app, _state) = create_test_app();

    let response = tower::ServiceExt::oneshot(
        app,
        axum::http::Request::builder()
            .uri("/authorize?provider=myspace")
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "invalid_request");
    assert_eq!(json["details"], "Unsupported provider: myspace");
}

#[tokio::test]
async fn test_authorize_missing_provider() {
    let app = create_test_app_with(Config::test_default(), vec![]);
    let response = app.get("/authorize").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_authorize_unknown_invite() {
    let app = create_test_app_with(Config::test_default(), vec![]);

    let response = app
        .get("/authorize?provider=stub&invite_token=missing")
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_authorize_carries_invite_token() {
    let app = create_test_app_with(Config::test_default(), vec![]);
    let mut invited = app.seed_user("invited@example.com", false);
    invited.confirmation_token = Some("invite123".to_string());
    app.db.put_user(invited).unwrap();

    let response = app
        .get("/authorize?provider=stub&invite_token=invite123")
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);

    let intent = app
        .state
        .state_codec
        .decode(&state_param(&location(&response)))
        .unwrap();
    assert_eq!(intent.invite_token.as_deref(), Some("invite123"));
}

#[tokio::test]
async fn test_authorize_saml_without_configuration() {
    let app = create_test_app_with(Config::test_default(), vec![]);
    let response = app.get("/authorize?provider=saml").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health() {
    let app = create_test_app_with(Config::test_default(), vec![]);
    let response = app.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}
