// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Outbox rows for webhook delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::User;

/// Webhook event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookEventKind {
    Signup,
    Login,
}

impl HookEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HookEventKind::Signup => "signup",
            HookEventKind::Login => "login",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "signup" => Some(HookEventKind::Signup),
            "login" => Some(HookEventKind::Login),
            _ => None,
        }
    }
}

/// A pending or delivered webhook notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    pub id: String,
    pub instance_id: String,
    pub event: HookEventKind,
    /// Snapshot of the user at the time of the event
    pub user: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    /// Set once delivery succeeded or was abandoned
    #[serde(default)]
    pub delivered: bool,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl HookEvent {
    pub fn new(
        instance_id: &str,
        event: HookEventKind,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            event,
            user: serde_json::to_value(user)?,
            created_at: now,
            attempts: 0,
            delivered: false,
            delivered_at: None,
            last_error: None,
        })
    }

    /// JSON body posted to the webhook endpoint.
    pub fn payload(&self) -> Value {
        serde_json::json!({
            "event": self.event.as_str(),
            "instance_id": self.instance_id,
            "user": self.user,
        })
    }
}
