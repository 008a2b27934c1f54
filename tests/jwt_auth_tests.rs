// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! JWT compatibility tests.
//!
//! Downstream services decode access tokens with their own claim structs.
//! These tests decode issued tokens the way such a consumer would, so a
//! change to the claim names or algorithm shows up here first.

use chrono::Utc;
use idgate::middleware::auth::AccessTokenSigner;
use idgate::models::{RefreshToken, User};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// The claim set a consumer relies on.
#[derive(Debug, Deserialize)]
struct ConsumerClaims {
    sub: String,
    aud: String,
    exp: i64,
    iat: i64,
    email: String,
    role: String,
    app_metadata: Map<String, Value>,
    user_metadata: Map<String, Value>,
}

const SIGNING_KEY: &[u8] = b"test_signing_key_32_bytes_long!!";

fn user(aud: &str) -> User {
    let mut metadata = Map::new();
    metadata.insert("full_name".into(), json!("Ada Lovelace"));
    let mut user = User::new("inst", "ada@example.com", aud, metadata, Utc::now());
    user.set_provider("gitlab");
    user
}

#[test]
fn test_consumer_can_decode_with_audience_check() {
    let signer = AccessTokenSigner::new(SIGNING_KEY, 3600);
    let user = user("dashboard");
    let token = signer.sign(&user).unwrap();

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&["dashboard"]);
    let claims = decode::<ConsumerClaims>(&token, &DecodingKey::from_secret(SIGNING_KEY), &validation)
        .expect("consumer should accept the token")
        .claims;

    assert_eq!(claims.sub, user.id);
    assert_eq!(claims.aud, "dashboard");
    assert_eq!(claims.email, "ada@example.com");
    assert_eq!(claims.role, "authenticated");
    assert_eq!(claims.app_metadata["provider"], "gitlab");
    assert_eq!(claims.user_metadata["full_name"], "Ada Lovelace");
    assert_eq!(claims.exp - claims.iat, 3600);
}

#[test]
fn test_consumer_rejects_other_audience() {
    let signer = AccessTokenSigner::new(SIGNING_KEY, 3600);
    let token = signer.sign(&user("dashboard")).unwrap();

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&["billing"]);
    assert!(decode::<ConsumerClaims>(&token, &DecodingKey::from_secret(SIGNING_KEY), &validation).is_err());
}

#[test]
fn test_issue_pairs_access_and_refresh_token() {
    let signer = AccessTokenSigner::new(SIGNING_KEY, 900);
    let user = user("");
    let refresh = RefreshToken::new("r-token".to_string(), &user.id, &user.instance_id, Utc::now());

    let response = signer.issue(&user, &refresh).unwrap();
    assert_eq!(response.token_type, "bearer");
    assert_eq!(response.expires_in, 900);
    assert_eq!(response.refresh_token, refresh.token);

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;
    let claims = decode::<ConsumerClaims>(
        &response.access_token,
        &DecodingKey::from_secret(SIGNING_KEY),
        &validation,
    )
    .unwrap()
    .claims;
    assert_eq!(claims.sub, user.id);
    assert!(claims.exp > Utc::now().timestamp() + 800);
}
