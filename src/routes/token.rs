// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Refresh token grant and logout.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::post,
    Extension, Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::db::StoreError;
use crate::error::{AppError, Result};
use crate::middleware::auth::AuthUser;
use crate::models::{AccessTokenResponse, AuditAction, AuditLogEntry};
use crate::services::RefreshTokenService;
use crate::AppState;

/// `/token` is public; logout is mounted behind `require_auth`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/token", post(token))
}

pub fn protected_routes() -> Router<Arc<AppState>> {
    Router::new().route("/logout", post(logout))
}

#[derive(Deserialize)]
pub struct TokenParams {
    #[serde(default)]
    grant_type: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct RefreshTokenGrant {
    #[serde(default)]
    refresh_token: Option<String>,
}

async fn token(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Query(params): Query<TokenParams>,
    Json(body): Json<RefreshTokenGrant>,
) -> Result<Json<AccessTokenResponse>> {
    match params.grant_type.as_deref() {
        Some("refresh_token") => refresh_token_grant(&state, &ctx, body).await.map(Json),
        other => Err(AppError::UnsupportedGrantType(format!(
            "unsupported grant_type {}",
            other.unwrap_or("(none)")
        ))),
    }
}

/// Rotate a refresh token. The swap, the audit entry and the new token commit together.
async fn refresh_token_grant(
    state: &AppState,
    ctx: &RequestContext,
    body: RefreshTokenGrant,
) -> Result<AccessTokenResponse> {
    let old = body
        .refresh_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::BadRequest("refresh_token required".to_string()))?;

    let mut unit = state.db.begin().await?;
    let result = async {
        let (user, next) = RefreshTokenService::swap_in(unit.as_mut(), &old).await?;
        let entry = AuditLogEntry::new(
            &ctx.instance_id,
            &user,
            AuditAction::TokenRefreshed,
            None,
            Utc::now(),
        );
        unit.insert_audit_entry(&entry).await?;
        let tokens = state.signer.issue(&user, &next)?;
        Ok::<_, AppError>((user.id, tokens))
    }
    .await;

    let (user_id, tokens) = match result {
        Ok(v) => v,
        Err(e) => {
            unit.rollback().await;
            return Err(e);
        }
    };

    unit.commit().await.map_err(|e| match e {
        // Another request rotated the same token first.
        StoreError::Conflict(_) => AppError::InvalidGrant("Invalid Refresh Token".to_string()),
        other => other.into(),
    })?;

    tracing::info!(user_id = %user_id, "Refresh token rotated");
    Ok(tokens)
}

/// Revoke every refresh token of the authenticated user.
async fn logout(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Extension(auth): Extension<AuthUser>,
) -> Result<StatusCode> {
    let mut unit = state.db.begin().await?;
    let result = async {
        let user = unit
            .find_user_by_id(&auth.user_id)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Invalid user".to_string()))?;
        let revoked = RefreshTokenService::revoke_all_in(unit.as_mut(), &user.id).await?;
        let entry = AuditLogEntry::new(
            &ctx.instance_id,
            &user,
            AuditAction::Logout,
            None,
            Utc::now(),
        );
        unit.insert_audit_entry(&entry).await?;
        Ok::<_, AppError>(revoked)
    }
    .await;

    match result {
        Ok(revoked) => {
            unit.commit().await?;
            tracing::info!(user_id = %auth.user_id, revoked, "User logged out");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) => {
            unit.rollback().await;
            Err(e)
        }
    }
}
