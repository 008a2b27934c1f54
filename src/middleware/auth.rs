// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Access-token issuance and the JWT authentication middleware.

use crate::models::{AccessTokenResponse, RefreshToken, User};
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Access token claims.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Audience of the user
    pub aud: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    pub email: String,
    #[serde(default)]
    pub app_metadata: Map<String, Value>,
    #[serde(default)]
    pub user_metadata: Map<String, Value>,
    pub role: String,
}

/// Authenticated user extracted from the access token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub email: String,
    pub aud: String,
}

/// Signs HS256 access tokens.
#[derive(Clone)]
pub struct AccessTokenSigner {
    key: Vec<u8>,
    expires_in: i64,
}

impl AccessTokenSigner {
    pub fn new(key: &[u8], expires_in: i64) -> Self {
        Self {
            key: key.to_vec(),
            expires_in,
        }
    }

    pub fn expires_in(&self) -> i64 {
        self.expires_in
    }

    pub fn sign(&self, user: &User) -> anyhow::Result<String> {
        create_jwt(user, &self.key, self.expires_in)
    }

    /// Token pair for `user` around an already granted refresh token.
    pub fn issue(&self, user: &User, refresh: &RefreshToken) -> anyhow::Result<AccessTokenResponse> {
        Ok(AccessTokenResponse::bearer(
            self.sign(user)?,
            self.expires_in,
            refresh.token.clone(),
        ))
    }
}

/// Create an access token for a user session.
pub fn create_jwt(user: &User, signing_key: &[u8], expires_in: i64) -> anyhow::Result<String> {
    let now = chrono::Utc::now().timestamp();

    let claims = Claims {
        sub: user.id.clone(),
        aud: user.aud.clone(),
        exp: now + expires_in,
        iat: now,
        email: user.email.clone(),
        app_metadata: user.app_metadata.clone(),
        user_metadata: user.user_metadata.clone(),
        role: user.role.clone(),
    };

    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(signing_key),
    )?)
}

/// Validate an access token and return its claims.
pub fn verify_jwt(token: &str, signing_key: &[u8]) -> Option<Claims> {
    let key = DecodingKey::from_secret(signing_key);
    let mut validation = Validation::new(Algorithm::HS256);
    // Audiences vary per user; callers compare `aud` themselves.
    validation.validate_aud = false;

    decode::<Claims>(token, &key, &validation)
        .ok()
        .map(|data| data.claims)
}

/// Middleware that requires valid JWT authentication.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Try cookie first, then header
    let token = if let Some(cookie) = jar.get(&state.config.cookie_name) {
        cookie.value().to_string()
    } else {
        let auth_header = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok());

        match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
            Some(t) => t.to_string(),
            None => return Err(StatusCode::UNAUTHORIZED),
        }
    };

    let claims = verify_jwt(&token, &state.config.jwt_secret).ok_or(StatusCode::UNAUTHORIZED)?;

    request.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        email: claims.email,
        aud: claims.aud,
    });

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn user() -> User {
        let mut u = User::new("inst", "a@example.com", "api", Map::new(), Utc::now());
        u.set_provider("github");
        u
    }

    #[test]
    fn test_claims_roundtrip() {
        let u = user();
        let token = create_jwt(&u, b"secret", 3600).unwrap();
        let claims = verify_jwt(&token, b"secret").unwrap();

        assert_eq!(claims.sub, u.id);
        assert_eq!(claims.aud, "api");
        assert_eq!(claims.role, "authenticated");
        assert_eq!(claims.app_metadata["provider"], json!("github"));
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_wrong_key_and_expired_rejected() {
        let u = user();
        let token = create_jwt(&u, b"secret", 3600).unwrap();
        assert!(verify_jwt(&token, b"other").is_none());

        let expired = create_jwt(&u, b"secret", -3600).unwrap();
        assert!(verify_jwt(&expired, b"secret").is_none());
    }
}
