// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Database layer.
//!
//! All reads and writes of a federation callback, a token refresh or a logout
//! go through one [`UnitOfWork`]: either every write commits or none does.
//! Two backends implement it: Firestore (production) and an in-memory store
//! (tests and local development).

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;
pub use memory::MemoryDb;

use crate::models::{AuditLogEntry, HookEvent, RefreshToken, User};
use async_trait::async_trait;

/// Collection names as constants.
pub mod collections {
    pub const USERS: &str = "users";
    /// Uniqueness index for (instance, aud, email), keyed by [`super::email_key`]
    pub const USER_EMAILS: &str = "user_emails";
    /// Keyed by the token string
    pub const REFRESH_TOKENS: &str = "refresh_tokens";
    pub const AUDIT_LOG: &str = "audit_log_entries";
    pub const HOOK_EVENTS: &str = "hook_events";
}

/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint or concurrent modification prevented the commit.
    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Entry point to storage: opens units of work and serves the hook outbox.
#[async_trait]
pub trait Store: Send + Sync {
    /// Begin a new atomic unit.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError>;

    /// Outbox rows not yet delivered, oldest first where the backend can order them.
    async fn pending_hook_events(&self, limit: usize) -> Result<Vec<HookEvent>, StoreError>;

    /// Persist delivery progress for an outbox row.
    async fn save_hook_event(&self, event: &HookEvent) -> Result<(), StoreError>;
}

/// An atomic unit of reads and buffered writes.
///
/// Dropping a unit without calling [`UnitOfWork::commit`] discards its writes.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn find_user_by_id(&mut self, id: &str) -> Result<Option<User>, StoreError>;

    async fn find_user_by_email(
        &mut self,
        instance_id: &str,
        email: &str,
        aud: &str,
    ) -> Result<Option<User>, StoreError>;

    async fn find_user_by_confirmation_token(
        &mut self,
        token: &str,
    ) -> Result<Option<User>, StoreError>;

    /// Insert a new user; violates uniqueness → `StoreError::Conflict` (possibly at commit).
    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError>;

    async fn update_user(&mut self, user: &User) -> Result<(), StoreError>;

    async fn find_refresh_token(&mut self, token: &str)
        -> Result<Option<RefreshToken>, StoreError>;

    async fn refresh_tokens_for_user(
        &mut self,
        user_id: &str,
    ) -> Result<Vec<RefreshToken>, StoreError>;

    async fn insert_refresh_token(&mut self, token: &RefreshToken) -> Result<(), StoreError>;

    async fn update_refresh_token(&mut self, token: &RefreshToken) -> Result<(), StoreError>;

    async fn insert_audit_entry(&mut self, entry: &AuditLogEntry) -> Result<(), StoreError>;

    async fn enqueue_hook_event(&mut self, event: &HookEvent) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>);
}

/// Key of the email uniqueness index.
pub fn email_key(instance_id: &str, aud: &str, email: &str) -> String {
    format!(
        "{}|{}|{}",
        urlencoding::encode(instance_id),
        urlencoding::encode(aud),
        urlencoding::encode(email)
    )
}
