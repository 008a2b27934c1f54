// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory store for tests and local development.
//!
//! Units of work are optimistic: writes are buffered in the unit, and every
//! committed row the unit read is remembered. Commit takes the table lock,
//! checks that those rows are unchanged and that no inserted user collides
//! with an existing `(instance_id, email, aud)`, then applies the writes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Store, StoreError, UnitOfWork};
use crate::models::{AuditLogEntry, HookEvent, RefreshToken, User};

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    /// Keyed by token string
    refresh_tokens: HashMap<String, RefreshToken>,
    audit_log: Vec<AuditLogEntry>,
    hook_events: Vec<HookEvent>,
}

/// Shared in-memory database. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryDb {
    tables: Arc<Mutex<Tables>>,
}

fn lock(tables: &Mutex<Tables>) -> Result<MutexGuard<'_, Tables>, StoreError> {
    tables
        .lock()
        .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
}

fn same_identity(a: &User, b: &User) -> bool {
    a.instance_id == b.instance_id && a.email == b.email && a.aud == b.aud
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Inspection helpers ──────────────────────────────────────

    pub fn users(&self) -> Vec<User> {
        lock(&self.tables)
            .map(|t| t.users.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn refresh_tokens(&self) -> Vec<RefreshToken> {
        lock(&self.tables)
            .map(|t| t.refresh_tokens.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        lock(&self.tables)
            .map(|t| t.audit_log.clone())
            .unwrap_or_default()
    }

    pub fn hook_events(&self) -> Vec<HookEvent> {
        lock(&self.tables)
            .map(|t| t.hook_events.clone())
            .unwrap_or_default()
    }

    /// Seed a committed user directly (fixtures).
    pub fn put_user(&self, user: User) -> Result<(), StoreError> {
        lock(&self.tables)?.users.insert(user.id.clone(), user);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryDb {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError> {
        Ok(Box::new(MemoryUnit::new(self.tables.clone())))
    }

    async fn pending_hook_events(&self, limit: usize) -> Result<Vec<HookEvent>, StoreError> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .hook_events
            .iter()
            .filter(|e| !e.delivered)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_hook_event(&self, event: &HookEvent) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables)?;
        match tables.hook_events.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => *existing = event.clone(),
            None => tables.hook_events.push(event.clone()),
        }
        Ok(())
    }
}

/// A unit of work over [`MemoryDb`].
pub struct MemoryUnit {
    tables: Arc<Mutex<Tables>>,
    // Committed state observed by this unit, validated at commit.
    read_users: HashMap<String, Option<User>>,
    read_tokens: HashMap<String, Option<RefreshToken>>,
    // Buffered writes.
    users: HashMap<String, User>,
    inserted_users: HashSet<String>,
    tokens: HashMap<String, RefreshToken>,
    inserted_tokens: HashSet<String>,
    audit: Vec<AuditLogEntry>,
    events: Vec<HookEvent>,
}

impl MemoryUnit {
    fn new(tables: Arc<Mutex<Tables>>) -> Self {
        Self {
            tables,
            read_users: HashMap::new(),
            read_tokens: HashMap::new(),
            users: HashMap::new(),
            inserted_users: HashSet::new(),
            tokens: HashMap::new(),
            inserted_tokens: HashSet::new(),
            audit: Vec::new(),
            events: Vec::new(),
        }
    }

    /// First committed user matching `pred`, ignoring rows this unit has rewritten.
    fn find_committed_user(
        &mut self,
        pred: impl Fn(&User) -> bool,
    ) -> Result<Option<User>, StoreError> {
        let found = {
            let tables = lock(&self.tables)?;
            let mut matches: Vec<&User> = tables
                .users
                .values()
                .filter(|u| !self.users.contains_key(&u.id) && pred(*u))
                .collect();
            matches.sort_by_key(|u| u.created_at);
            matches.first().map(|u| (*u).clone())
        };
        if let Some(user) = &found {
            self.read_users
                .entry(user.id.clone())
                .or_insert_with(|| Some(user.clone()));
        }
        Ok(found)
    }

    fn find_user(&mut self, pred: impl Fn(&User) -> bool) -> Result<Option<User>, StoreError> {
        if let Some(user) = self.users.values().find(|u| pred(*u)) {
            return Ok(Some(user.clone()));
        }
        self.find_committed_user(pred)
    }

    fn validate(&self, tables: &Tables) -> Result<(), StoreError> {
        for (id, seen) in &self.read_users {
            if tables.users.get(id) != seen.as_ref() {
                return Err(StoreError::Conflict(format!(
                    "user {} modified concurrently",
                    id
                )));
            }
        }
        for (token, seen) in &self.read_tokens {
            if tables.refresh_tokens.get(token) != seen.as_ref() {
                return Err(StoreError::Conflict(
                    "refresh token modified concurrently".to_string(),
                ));
            }
        }
        for id in &self.inserted_users {
            if tables.users.contains_key(id) {
                return Err(StoreError::Conflict(format!("user {} already exists", id)));
            }
        }
        for user in self.users.values() {
            let collides = tables
                .users
                .values()
                .any(|other| other.id != user.id && same_identity(other, user));
            if collides {
                return Err(StoreError::Conflict(format!(
                    "a user with email {} already exists",
                    user.email
                )));
            }
        }
        for token in &self.inserted_tokens {
            if tables.refresh_tokens.contains_key(token) {
                return Err(StoreError::Conflict(
                    "refresh token already exists".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn find_user_by_id(&mut self, id: &str) -> Result<Option<User>, StoreError> {
        self.find_user(|u| u.id == id)
    }

    async fn find_user_by_email(
        &mut self,
        instance_id: &str,
        email: &str,
        aud: &str,
    ) -> Result<Option<User>, StoreError> {
        self.find_user(|u| u.instance_id == instance_id && u.email == email && u.aud == aud)
    }

    async fn find_user_by_confirmation_token(
        &mut self,
        token: &str,
    ) -> Result<Option<User>, StoreError> {
        self.find_user(|u| u.confirmation_token.as_deref() == Some(token))
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        if self.users.values().any(|u| same_identity(u, user)) {
            return Err(StoreError::Conflict(format!(
                "a user with email {} already exists",
                user.email
            )));
        }
        self.inserted_users.insert(user.id.clone());
        self.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn update_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn find_refresh_token(
        &mut self,
        token: &str,
    ) -> Result<Option<RefreshToken>, StoreError> {
        if let Some(t) = self.tokens.get(token) {
            return Ok(Some(t.clone()));
        }
        let committed = lock(&self.tables)?.refresh_tokens.get(token).cloned();
        self.read_tokens
            .entry(token.to_string())
            .or_insert_with(|| committed.clone());
        Ok(committed)
    }

    async fn refresh_tokens_for_user(
        &mut self,
        user_id: &str,
    ) -> Result<Vec<RefreshToken>, StoreError> {
        let committed: Vec<RefreshToken> = lock(&self.tables)?
            .refresh_tokens
            .values()
            .filter(|t| t.user_id == user_id && !self.tokens.contains_key(&t.token))
            .cloned()
            .collect();
        for t in &committed {
            self.read_tokens
                .entry(t.token.clone())
                .or_insert_with(|| Some(t.clone()));
        }
        let mut all: Vec<RefreshToken> = self
            .tokens
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .chain(committed)
            .collect();
        all.sort_by_key(|t| t.created_at);
        Ok(all)
    }

    async fn insert_refresh_token(&mut self, token: &RefreshToken) -> Result<(), StoreError> {
        self.inserted_tokens.insert(token.token.clone());
        self.tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn update_refresh_token(&mut self, token: &RefreshToken) -> Result<(), StoreError> {
        self.tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn insert_audit_entry(&mut self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        self.audit.push(entry.clone());
        Ok(())
    }

    async fn enqueue_hook_event(&mut self, event: &HookEvent) -> Result<(), StoreError> {
        self.events.push(event.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let unit = *self;
        let mut tables = lock(&unit.tables)?;
        unit.validate(&tables)?;

        tables.users.extend(unit.users);
        tables.refresh_tokens.extend(unit.tokens);
        tables.audit_log.extend(unit.audit);
        tables.hook_events.extend(unit.events);
        Ok(())
    }

    async fn rollback(self: Box<Self>) {}
}
