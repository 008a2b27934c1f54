// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Refresh token model and the token pair returned to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Opaque, rotating refresh token (document ID is the token string).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: String,
    pub token: String,
    pub user_id: String,
    pub instance_id: String,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefreshToken {
    pub fn new(token: String, user_id: &str, instance_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            token,
            user_id: user_id.to_string(),
            instance_id: instance_id.to_string(),
            revoked: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_revoked(&mut self, revoked: bool, now: DateTime<Utc>) {
        self.revoked = revoked;
        self.updated_at = now;
    }
}

/// Session credentials handed to the client after a successful login or refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: String,
}

impl AccessTokenResponse {
    pub fn bearer(access_token: String, expires_in: i64, refresh_token: String) -> Self {
        Self {
            access_token,
            token_type: "bearer".to_string(),
            expires_in,
            refresh_token,
        }
    }

    /// URL fragment form used on the federation redirect.
    pub fn to_fragment(&self) -> String {
        format!(
            "access_token={}&token_type={}&expires_in={}&refresh_token={}",
            urlencoding::encode(&self.access_token),
            self.token_type,
            self.expires_in,
            urlencoding::encode(&self.refresh_token)
        )
    }
}
