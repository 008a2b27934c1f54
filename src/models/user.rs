// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User model for storage and token claims.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role assigned to users created through federation.
pub const DEFAULT_ROLE: &str = "authenticated";

/// User record stored in Firestore.
///
/// `(instance_id, email, aud)` is unique across all users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// UUID (also used as document ID)
    pub id: String,
    pub instance_id: String,
    /// Audience the user belongs to
    pub aud: String,
    pub role: String,
    /// Primary email address
    pub email: String,
    /// None until the user confirms their email or federates with a verified one
    #[serde(default)]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invited_at: Option<DateTime<Utc>>,
    /// Single-use token for invite and confirmation links
    #[serde(default)]
    pub confirmation_token: Option<String>,
    #[serde(default)]
    pub confirmation_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sign_in_at: Option<DateTime<Utc>>,
    /// Operator-controlled metadata (e.g. `provider`)
    #[serde(default)]
    pub app_metadata: Map<String, Value>,
    /// User-controlled metadata (name, avatar, ...)
    #[serde(default)]
    pub user_metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Build a new, unconfirmed user.
    pub fn new(
        instance_id: &str,
        email: &str,
        aud: &str,
        user_metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            aud: aud.to_string(),
            role: DEFAULT_ROLE.to_string(),
            email: email.to_string(),
            confirmed_at: None,
            invited_at: None,
            confirmation_token: None,
            confirmation_sent_at: None,
            last_sign_in_at: None,
            app_metadata: Map::new(),
            user_metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }

    /// Mark the user confirmed and consume any outstanding confirmation token.
    pub fn confirm(&mut self, now: DateTime<Utc>) {
        self.confirmed_at = Some(now);
        self.confirmation_token = None;
        self.updated_at = now;
    }

    /// Record which external provider the user authenticated with.
    pub fn set_provider(&mut self, provider: &str) {
        self.app_metadata
            .insert("provider".to_string(), Value::String(provider.to_string()));
    }

    /// Merge provider metadata into `user_metadata`, skipping empty values.
    pub fn merge_user_metadata(&mut self, metadata: &Map<String, Value>) {
        for (key, value) in metadata {
            if is_present(value) {
                self.user_metadata.insert(key.clone(), value.clone());
            }
        }
    }

    /// Display name used in audit entries, when the provider supplied one.
    pub fn display_name(&self) -> Option<&str> {
        self.user_metadata
            .get("full_name")
            .or_else(|| self.user_metadata.get("name"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// True for values worth persisting: non-null and, for strings, non-empty.
pub(crate) fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> User {
        User::new("inst", "a@example.com", "aud", Map::new(), Utc::now())
    }

    #[test]
    fn test_new_user_is_unconfirmed() {
        let u = user();
        assert!(!u.is_confirmed());
        assert_eq!(u.role, DEFAULT_ROLE);
        assert!(!u.id.is_empty());
    }

    #[test]
    fn test_confirm_consumes_token() {
        let mut u = user();
        u.confirmation_token = Some("tok".to_string());
        u.confirm(Utc::now());
        assert!(u.is_confirmed());
        assert!(u.confirmation_token.is_none());
    }

    #[test]
    fn test_merge_skips_empty_values() {
        let mut u = user();
        u.user_metadata.insert("name".into(), json!("Old"));
        let incoming = json!({"name": "", "avatar_url": "https://a/b.png", "sub": null})
            .as_object()
            .cloned()
            .unwrap();
        u.merge_user_metadata(&incoming);

        assert_eq!(u.user_metadata["name"], json!("Old"));
        assert_eq!(u.user_metadata["avatar_url"], json!("https://a/b.png"));
        assert!(!u.user_metadata.contains_key("sub"));
    }

    #[test]
    fn test_display_name_prefers_full_name() {
        let mut u = user();
        assert_eq!(u.display_name(), None);
        u.user_metadata.insert("name".into(), json!("Short"));
        u.user_metadata.insert("full_name".into(), json!("Full Name"));
        assert_eq!(u.display_name(), Some("Full Name"));
    }
}
