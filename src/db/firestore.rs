// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore implementation of the storage traits.
//!
//! Every unit of work is a Firestore transaction:
//! - reads use a client bound to the transaction, so the documents they touch
//!   are checked for conflicting writes at commit
//! - writes are buffered into the transaction and land atomically on commit
//! - `(instance_id, aud, email)` uniqueness is enforced by a `user_emails`
//!   index document written with an `Exists(false)` precondition

use async_trait::async_trait;
use firestore::{FirestoreConsistencySelector, FirestoreTransaction, FirestoreWritePrecondition};
use serde::{Deserialize, Serialize};

use super::{collections, email_key, Store, StoreError, UnitOfWork};
use crate::models::{AuditLogEntry, HookEvent, RefreshToken, User};

/// Index document pointing from an email key to the owning user.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserEmailIndex {
    user_id: String,
}

fn backend(context: &str) -> impl Fn(firestore::errors::FirestoreError) -> StoreError + '_ {
    move |e| StoreError::Backend(format!("{}: {}", context, e))
}

/// Map a commit failure, surfacing contention and failed preconditions as conflicts.
fn commit_error(e: firestore::errors::FirestoreError) -> StoreError {
    let message = e.to_string();
    match e {
        firestore::errors::FirestoreError::DataConflictError(_) => StoreError::Conflict(message),
        _ if message.contains("ALREADY_EXISTS")
            || message.contains("AlreadyExists")
            || message.contains("FAILED_PRECONDITION")
            || message.contains("FailedPrecondition")
            || message.contains("ABORTED")
            || message.contains("Aborted") =>
        {
            StoreError::Conflict(message)
        }
        _ => StoreError::Backend(format!("Transaction commit failed: {}", message)),
    }
}

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, StoreError> {
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, StoreError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            StoreError::Backend(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create an offline client; every operation returns an error.
    pub fn new_mock() -> Self {
        Self { client: None }
    }

    fn get_client(&self) -> Result<&firestore::FirestoreDb, StoreError> {
        self.client
            .as_ref()
            .ok_or_else(|| StoreError::Backend("Database not connected (offline mode)".to_string()))
    }
}

#[async_trait]
impl Store for FirestoreDb {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError> {
        let client = self.get_client()?;
        let transaction = client
            .begin_transaction()
            .await
            .map_err(backend("Failed to begin transaction"))?;
        let reader = client.clone_with_consistency_selector(
            FirestoreConsistencySelector::Transaction(transaction.transaction_id().clone()),
        );

        Ok(Box::new(FirestoreUnit {
            client,
            reader,
            transaction,
        }))
    }

    async fn pending_hook_events(&self, limit: usize) -> Result<Vec<HookEvent>, StoreError> {
        self.get_client()?
            .fluent()
            .select()
            .from(collections::HOOK_EVENTS)
            .filter(|q| q.field("delivered").eq(false))
            .limit(limit as u32)
            .obj()
            .query()
            .await
            .map_err(backend("Failed to query hook events"))
    }

    async fn save_hook_event(&self, event: &HookEvent) -> Result<(), StoreError> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::HOOK_EVENTS)
            .document_id(&event.id)
            .object(event)
            .execute()
            .await
            .map_err(backend("Failed to save hook event"))?;
        Ok(())
    }
}

/// A Firestore transaction plus a reader bound to it.
pub struct FirestoreUnit<'a> {
    client: &'a firestore::FirestoreDb,
    reader: firestore::FirestoreDb,
    transaction: FirestoreTransaction<'a>,
}

impl FirestoreUnit<'_> {
    async fn find_one_user(&self, field: &'static str, value: String) -> Result<Option<User>, StoreError> {
        let users: Vec<User> = self
            .reader
            .fluent()
            .select()
            .from(collections::USERS)
            .filter(move |q| q.field(field).eq(value.clone()))
            .limit(1)
            .obj()
            .query()
            .await
            .map_err(backend("Failed to query users"))?;
        Ok(users.into_iter().next())
    }
}

#[async_trait]
impl UnitOfWork for FirestoreUnit<'_> {
    // ─── User Operations ─────────────────────────────────────────

    async fn find_user_by_id(&mut self, id: &str) -> Result<Option<User>, StoreError> {
        self.reader
            .fluent()
            .select()
            .by_id_in(collections::USERS)
            .obj()
            .one(id)
            .await
            .map_err(backend("Failed to read user"))
    }

    async fn find_user_by_email(
        &mut self,
        instance_id: &str,
        email: &str,
        aud: &str,
    ) -> Result<Option<User>, StoreError> {
        // The index document is read through the transaction so a concurrent
        // signup for the same key aborts this commit.
        let index: Option<UserEmailIndex> = self
            .reader
            .fluent()
            .select()
            .by_id_in(collections::USER_EMAILS)
            .obj()
            .one(&email_key(instance_id, aud, email))
            .await
            .map_err(backend("Failed to read email index"))?;

        match index {
            Some(index) => self.find_user_by_id(&index.user_id).await,
            None => Ok(None),
        }
    }

    async fn find_user_by_confirmation_token(
        &mut self,
        token: &str,
    ) -> Result<Option<User>, StoreError> {
        self.find_one_user("confirmation_token", token.to_string())
            .await
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        let index = UserEmailIndex {
            user_id: user.id.clone(),
        };

        self.client
            .fluent()
            .update()
            .in_col(collections::USER_EMAILS)
            .precondition(FirestoreWritePrecondition::Exists(false))
            .document_id(email_key(&user.instance_id, &user.aud, &user.email))
            .object(&index)
            .add_to_transaction(&mut self.transaction)
            .map_err(backend("Failed to add email index to transaction"))?;

        self.client
            .fluent()
            .update()
            .in_col(collections::USERS)
            .precondition(FirestoreWritePrecondition::Exists(false))
            .document_id(&user.id)
            .object(user)
            .add_to_transaction(&mut self.transaction)
            .map_err(backend("Failed to add user to transaction"))?;
        Ok(())
    }

    async fn update_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.client
            .fluent()
            .update()
            .in_col(collections::USERS)
            .document_id(&user.id)
            .object(user)
            .add_to_transaction(&mut self.transaction)
            .map_err(backend("Failed to add user update to transaction"))?;
        Ok(())
    }

    // ─── Refresh Token Operations ────────────────────────────────

    async fn find_refresh_token(
        &mut self,
        token: &str,
    ) -> Result<Option<RefreshToken>, StoreError> {
        self.reader
            .fluent()
            .select()
            .by_id_in(collections::REFRESH_TOKENS)
            .obj()
            .one(token)
            .await
            .map_err(backend("Failed to read refresh token"))
    }

    async fn refresh_tokens_for_user(
        &mut self,
        user_id: &str,
    ) -> Result<Vec<RefreshToken>, StoreError> {
        let user_id = user_id.to_string();
        self.reader
            .fluent()
            .select()
            .from(collections::REFRESH_TOKENS)
            .filter(move |q| q.field("user_id").eq(user_id.clone()))
            .obj()
            .query()
            .await
            .map_err(backend("Failed to query refresh tokens"))
    }

    async fn insert_refresh_token(&mut self, token: &RefreshToken) -> Result<(), StoreError> {
        self.client
            .fluent()
            .update()
            .in_col(collections::REFRESH_TOKENS)
            .precondition(FirestoreWritePrecondition::Exists(false))
            .document_id(&token.token)
            .object(token)
            .add_to_transaction(&mut self.transaction)
            .map_err(backend("Failed to add refresh token to transaction"))?;
        Ok(())
    }

    async fn update_refresh_token(&mut self, token: &RefreshToken) -> Result<(), StoreError> {
        self.client
            .fluent()
            .update()
            .in_col(collections::REFRESH_TOKENS)
            .document_id(&token.token)
            .object(token)
            .add_to_transaction(&mut self.transaction)
            .map_err(backend("Failed to add refresh token update to transaction"))?;
        Ok(())
    }

    // ─── Audit & Outbox ──────────────────────────────────────────

    async fn insert_audit_entry(&mut self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        self.client
            .fluent()
            .update()
            .in_col(collections::AUDIT_LOG)
            .document_id(&entry.id)
            .object(entry)
            .add_to_transaction(&mut self.transaction)
            .map_err(backend("Failed to add audit entry to transaction"))?;
        Ok(())
    }

    async fn enqueue_hook_event(&mut self, event: &HookEvent) -> Result<(), StoreError> {
        self.client
            .fluent()
            .update()
            .in_col(collections::HOOK_EVENTS)
            .document_id(&event.id)
            .object(event)
            .add_to_transaction(&mut self.transaction)
            .map_err(backend("Failed to add hook event to transaction"))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let unit = *self;
        unit.transaction.commit().await.map_err(commit_error)?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        let unit = *self;
        if let Err(e) = unit.transaction.rollback().await {
            tracing::warn!(error = %e, "Transaction rollback failed");
        }
    }
}
