// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Append-only audit log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::User;
use crate::time_utils::format_utc_rfc3339;

/// Auditable actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    Logout,
    InviteAccepted,
    #[serde(rename = "user_signedup")]
    UserSignedUp,
    TokenRevoked,
    TokenRefreshed,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Login => "login",
            AuditAction::Logout => "logout",
            AuditAction::InviteAccepted => "invite_accepted",
            AuditAction::UserSignedUp => "user_signedup",
            AuditAction::TokenRevoked => "token_revoked",
            AuditAction::TokenRefreshed => "token_refreshed",
        }
    }

    /// Log category the action is filed under.
    pub fn log_type(self) -> &'static str {
        match self {
            AuditAction::Login | AuditAction::Logout => "account",
            AuditAction::InviteAccepted | AuditAction::UserSignedUp => "team",
            AuditAction::TokenRevoked | AuditAction::TokenRefreshed => "token",
        }
    }
}

/// One audit log row, written in the same unit of work as the change it records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub instance_id: String,
    pub created_at: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl AuditLogEntry {
    pub fn new(
        instance_id: &str,
        actor: &User,
        action: AuditAction,
        traits: Option<Map<String, Value>>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("timestamp".into(), json!(format_utc_rfc3339(now)));
        payload.insert("actor_id".into(), json!(actor.id));
        payload.insert("actor_email".into(), json!(actor.email));
        payload.insert("action".into(), json!(action.as_str()));
        payload.insert("log_type".into(), json!(action.log_type()));
        if let Some(name) = actor.display_name() {
            payload.insert("actor_name".into(), json!(name));
        }
        if let Some(traits) = traits {
            payload.insert("traits".into(), Value::Object(traits));
        }

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            created_at: now,
            payload,
        }
    }

    /// Traits map naming the provider, as attached to federation entries.
    pub fn provider_traits(provider: &str) -> Map<String, Value> {
        let mut traits = Map::new();
        traits.insert("provider".into(), json!(provider));
        traits
    }

    pub fn action(&self) -> Option<&str> {
        self.payload.get("action").and_then(Value::as_str)
    }
}
