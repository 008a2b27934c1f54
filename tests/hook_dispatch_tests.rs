// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Outbox writes from the callback and delivery by the dispatcher.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use idgate::config::{Config, WebhookConfig};
use idgate::models::{HookEventKind, ProviderEmail};
use idgate::services::hooks::{SignatureClaims, SIGNATURE_HEADER};
use idgate::services::{HookDispatcher, HookNotifier};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

mod common;
use common::{create_test_app_with, TestApp};

const HOOK_SECRET: &[u8] = b"hook_secret";

type Received = Arc<Mutex<Vec<(String, Bytes)>>>;

/// Local webhook endpoint answering every POST with `status`.
async fn spawn_endpoint(status: StatusCode) -> (String, Received) {
    let received: Received = Arc::default();
    let sink = received.clone();
    let router = Router::new().route(
        "/hook",
        post(move |headers: HeaderMap, body: Bytes| {
            let sink = sink.clone();
            async move {
                let signature = headers
                    .get(SIGNATURE_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                sink.lock().unwrap().push((signature, body));
                status
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}/hook", addr), received)
}

fn webhook(url: &str, events: Vec<HookEventKind>, max_attempts: u32) -> WebhookConfig {
    WebhookConfig {
        url: url.to_string(),
        secret: HOOK_SECRET.to_vec(),
        events,
        max_attempts,
    }
}

fn app_with_webhook(webhook: WebhookConfig) -> TestApp {
    let mut config = Config::test_default();
    config.webhook = Some(webhook);
    create_test_app_with(
        config,
        vec![ProviderEmail::new("hooked@example.com", true, true)],
    )
}

fn dispatcher(app: &TestApp) -> HookDispatcher {
    HookDispatcher::new(
        Arc::new(app.db.clone()),
        reqwest::Client::new(),
        app.config().webhook.clone().unwrap(),
        HookNotifier::new(),
    )
}

#[tokio::test]
async fn test_signup_enqueues_event() {
    let app = app_with_webhook(webhook(
        "http://127.0.0.1:9/hook",
        vec![HookEventKind::Signup],
        3,
    ));

    app.callback("authcode", None).await;

    let events = app.db.hook_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, HookEventKind::Signup);
    assert_eq!(events[0].user["email"], "hooked@example.com");
    assert!(!events[0].delivered);

    // Signing in again is a login, which this webhook does not subscribe to.
    app.callback("authcode", None).await;
    assert_eq!(app.db.hook_events().len(), 1);
}

#[tokio::test]
async fn test_login_event_when_subscribed() {
    let app = app_with_webhook(webhook(
        "http://127.0.0.1:9/hook",
        vec![HookEventKind::Login],
        3,
    ));

    app.callback("authcode", None).await;
    assert!(app.db.hook_events().is_empty());

    app.callback("authcode", None).await;
    let events = app.db.hook_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, HookEventKind::Login);
}

#[tokio::test]
async fn test_delivery_is_signed() {
    let (url, received) = spawn_endpoint(StatusCode::OK).await;
    let app = app_with_webhook(webhook(&url, vec![HookEventKind::Signup], 3));
    app.callback("authcode", None).await;

    let dispatcher = dispatcher(&app);
    assert_eq!(dispatcher.deliver_pending().await.unwrap(), 1);

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    let (signature, body) = &received[0];

    let payload: Value = serde_json::from_slice(body).unwrap();
    assert_eq!(payload["event"], "signup");
    assert_eq!(payload["instance_id"], app.config().instance_id);
    assert_eq!(payload["user"]["email"], "hooked@example.com");

    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    let claims = decode::<SignatureClaims>(
        signature,
        &DecodingKey::from_secret(HOOK_SECRET),
        &validation,
    )
    .unwrap()
    .claims;
    assert_eq!(claims.sha256, hex::encode(Sha256::digest(body)));
    assert_eq!(claims.sub, app.config().instance_id);

    let events = app.db.hook_events();
    assert!(events[0].delivered);
    assert!(events[0].delivered_at.is_some());
    assert_eq!(events[0].attempts, 1);

    // Nothing left to send.
    assert_eq!(dispatcher.deliver_pending().await.unwrap(), 0);
    assert_eq!(app.db.hook_events()[0].attempts, 1);
}

#[tokio::test]
async fn test_failed_delivery_is_retried_then_abandoned() {
    let (url, received) = spawn_endpoint(StatusCode::INTERNAL_SERVER_ERROR).await;
    let app = app_with_webhook(webhook(&url, vec![HookEventKind::Signup], 2));
    app.callback("authcode", None).await;

    let dispatcher = dispatcher(&app);

    assert_eq!(dispatcher.deliver_pending().await.unwrap(), 0);
    let event = app.db.hook_events().remove(0);
    assert_eq!(event.attempts, 1);
    assert!(!event.delivered);
    assert!(event.last_error.as_deref().unwrap_or("").contains("500"));

    assert_eq!(dispatcher.deliver_pending().await.unwrap(), 0);
    let event = app.db.hook_events().remove(0);
    assert_eq!(event.attempts, 2);
    assert!(event.delivered, "event should be abandoned after max attempts");
    assert!(event.delivered_at.is_none());

    assert_eq!(dispatcher.deliver_pending().await.unwrap(), 0);
    assert_eq!(received.lock().unwrap().len(), 2);
}
