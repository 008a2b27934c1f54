// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Refresh token rotation.
//!
//! Every operation runs in one unit of work. The `*_in` variants take a unit
//! owned by the caller so they can be combined with other writes (audit
//! entries, user updates) in a single commit.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::{json, Map};

use crate::db::{Store, StoreError, UnitOfWork};
use crate::models::{AuditAction, AuditLogEntry, RefreshToken, User};

/// Bytes of randomness in a refresh or confirmation token.
const TOKEN_BYTES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Refresh token not found")]
    TokenNotFound,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to generate secure token")]
    Random,
}

/// Random URL-safe token string.
pub fn secure_token() -> Result<String, TokenError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| TokenError::Random)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Grants, rotates and revokes refresh tokens.
#[derive(Clone)]
pub struct RefreshTokenService {
    store: Arc<dyn Store>,
}

impl RefreshTokenService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Issue a fresh token for `user`.
    pub async fn grant(&self, user: &User) -> Result<RefreshToken, TokenError> {
        let mut unit = self.store.begin().await?;
        match Self::grant_in(unit.as_mut(), user).await {
            Ok(token) => {
                unit.commit().await?;
                Ok(token)
            }
            Err(e) => {
                unit.rollback().await;
                Err(e)
            }
        }
    }

    pub async fn grant_in(
        unit: &mut dyn UnitOfWork,
        user: &User,
    ) -> Result<RefreshToken, TokenError> {
        let token = RefreshToken::new(secure_token()?, &user.id, &user.instance_id, Utc::now());
        unit.insert_refresh_token(&token).await?;
        Ok(token)
    }

    /// Revoke `old` and issue its successor for the same user.
    pub async fn swap(&self, old: &str) -> Result<(User, RefreshToken), TokenError> {
        let mut unit = self.store.begin().await?;
        match Self::swap_in(unit.as_mut(), old).await {
            Ok(result) => {
                unit.commit().await?;
                Ok(result)
            }
            Err(e) => {
                unit.rollback().await;
                Err(e)
            }
        }
    }

    pub async fn swap_in(
        unit: &mut dyn UnitOfWork,
        old: &str,
    ) -> Result<(User, RefreshToken), TokenError> {
        let mut current = unit
            .find_refresh_token(old)
            .await?
            .filter(|t| !t.revoked)
            .ok_or(TokenError::TokenNotFound)?;
        let user = unit
            .find_user_by_id(&current.user_id)
            .await?
            .ok_or(TokenError::TokenNotFound)?;

        current.set_revoked(true, Utc::now());
        unit.update_refresh_token(&current).await?;
        let next = Self::grant_in(unit, &user).await?;
        Ok((user, next))
    }

    /// Undo a swap: revoke `new`, reinstate `old`, and record the revocation
    /// in the owner's audit log.
    pub async fn rollback(&self, new: &RefreshToken, old: &RefreshToken) -> Result<(), TokenError> {
        let mut unit = self.store.begin().await?;
        let result = async {
            let now = Utc::now();
            let mut new_row = unit
                .find_refresh_token(&new.token)
                .await?
                .ok_or(TokenError::TokenNotFound)?;
            let mut old_row = unit
                .find_refresh_token(&old.token)
                .await?
                .ok_or(TokenError::TokenNotFound)?;

            let user = unit
                .find_user_by_id(&new_row.user_id)
                .await?
                .ok_or(TokenError::TokenNotFound)?;

            new_row.set_revoked(true, now);
            old_row.set_revoked(false, now);
            unit.update_refresh_token(&new_row).await?;
            unit.update_refresh_token(&old_row).await?;

            let mut traits = Map::new();
            traits.insert("reason".into(), json!("rotation_rollback"));
            let entry = AuditLogEntry::new(
                &user.instance_id,
                &user,
                AuditAction::TokenRevoked,
                Some(traits),
                now,
            );
            unit.insert_audit_entry(&entry).await?;
            Ok::<_, TokenError>(user)
        }
        .await;

        match result {
            Ok(user) => {
                unit.commit().await?;
                tracing::warn!(user_id = %user.id, "Refresh token rotation rolled back");
                Ok(())
            }
            Err(e) => {
                unit.rollback().await;
                Err(e)
            }
        }
    }

    /// Revoke every live token of a user. Returns how many were revoked.
    pub async fn revoke_all(&self, user_id: &str) -> Result<usize, TokenError> {
        let mut unit = self.store.begin().await?;
        match Self::revoke_all_in(unit.as_mut(), user_id).await {
            Ok(count) => {
                unit.commit().await?;
                Ok(count)
            }
            Err(e) => {
                unit.rollback().await;
                Err(e)
            }
        }
    }

    pub async fn revoke_all_in(
        unit: &mut dyn UnitOfWork,
        user_id: &str,
    ) -> Result<usize, TokenError> {
        let now = Utc::now();
        let mut count = 0;
        for mut token in unit.refresh_tokens_for_user(user_id).await? {
            if token.revoked {
                continue;
            }
            token.set_revoked(true, now);
            unit.update_refresh_token(&token).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Look up a token and its owner. Revoked tokens are returned as-is.
    pub async fn find_by_token(&self, token: &str) -> Result<(User, RefreshToken), TokenError> {
        let mut unit = self.store.begin().await?;
        let result = Self::find_by_token_in(unit.as_mut(), token).await;
        unit.rollback().await;
        result
    }

    pub async fn find_by_token_in(
        unit: &mut dyn UnitOfWork,
        token: &str,
    ) -> Result<(User, RefreshToken), TokenError> {
        let token = unit
            .find_refresh_token(token)
            .await?
            .ok_or(TokenError::TokenNotFound)?;
        let user = unit
            .find_user_by_id(&token.user_id)
            .await?
            .ok_or(TokenError::TokenNotFound)?;
        Ok((user, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_token_shape() {
        let a = secure_token().unwrap();
        let b = secure_token().unwrap();
        assert_eq!(a.len(), 22);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
