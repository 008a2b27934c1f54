// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Refresh token grant and logout over HTTP.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use idgate::config::Config;
use idgate::models::ProviderEmail;
use serde_json::{json, Value};
use tower::ServiceExt;

mod common;
use common::{create_test_app_with, fragment_params, location, TestApp};

async fn signed_in_app() -> (TestApp, String, String) {
    let app = create_test_app_with(
        Config::test_default(),
        vec![ProviderEmail::new("stub@example.com", true, true)],
    );
    let response = app.callback("authcode", None).await;
    let params = fragment_params(&location(&response));
    let access = params["access_token"].clone();
    let refresh = params["refresh_token"].clone();
    (app, access, refresh)
}

async fn post_token(app: &TestApp, grant_type: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/token?grant_type={}", grant_type))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn logout(app: &TestApp, bearer: Option<&str>) -> StatusCode {
    let mut request = Request::builder().method("POST").uri("/logout");
    if let Some(token) = bearer {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    app.router
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn test_refresh_rotates_token() {
    let (app, _access, refresh) = signed_in_app().await;

    let (status, body) = post_token(&app, "refresh_token", json!({ "refresh_token": refresh })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "bearer");
    assert_eq!(body["expires_in"], 3600);
    let next = body["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(next, refresh);

    let tokens = app.db.refresh_tokens();
    assert_eq!(tokens.len(), 2);
    assert!(tokens.iter().any(|t| t.token == refresh && t.revoked));
    assert!(tokens.iter().any(|t| t.token == next && !t.revoked));

    let actions: Vec<_> = app
        .db
        .audit_entries()
        .iter()
        .filter_map(|e| e.action().map(str::to_string))
        .collect();
    assert!(actions.contains(&"token_refreshed".to_string()));
}

#[tokio::test]
async fn test_revoked_token_is_invalid_grant() {
    let (app, _access, refresh) = signed_in_app().await;

    let (status, _) = post_token(&app, "refresh_token", json!({ "refresh_token": refresh })).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_token(&app, "refresh_token", json!({ "refresh_token": refresh })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn test_unknown_token_is_invalid_grant() {
    let (app, _access, _refresh) = signed_in_app().await;

    let (status, body) =
        post_token(&app, "refresh_token", json!({ "refresh_token": "nope" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn test_unsupported_grant_type() {
    let (app, _access, _refresh) = signed_in_app().await;

    let (status, body) = post_token(&app, "password", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn test_logout_revokes_all_tokens() {
    let (app, access, refresh) = signed_in_app().await;
    // A second session for the same user.
    let (_, body) = post_token(&app, "refresh_token", json!({ "refresh_token": refresh })).await;
    assert!(body["refresh_token"].is_string());

    assert_eq!(logout(&app, Some(&access)).await, StatusCode::NO_CONTENT);

    assert!(app.db.refresh_tokens().iter().all(|t| t.revoked));
    assert!(app
        .db
        .audit_entries()
        .iter()
        .any(|e| e.action() == Some("logout")));

    // Logging out again is harmless.
    assert_eq!(logout(&app, Some(&access)).await, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_logout_requires_auth() {
    let (app, _access, _refresh) = signed_in_app().await;

    assert_eq!(logout(&app, None).await, StatusCode::UNAUTHORIZED);
    assert_eq!(
        logout(&app, Some("not.a.jwt")).await,
        StatusCode::UNAUTHORIZED
    );
    assert!(app.db.refresh_tokens().iter().all(|t| !t.revoked));
}

#[tokio::test]
async fn test_logout_accepts_session_cookie() {
    let (app, access, _refresh) = signed_in_app().await;

    let status = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/logout")
                .header(
                    header::COOKIE,
                    format!("{}={}", app.config().cookie_name, access),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
        .status();

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.db.refresh_tokens().iter().all(|t| t.revoked));
}
