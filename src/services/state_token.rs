// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Signed, expiring state tokens carried through the external redirect.
//!
//! The token is an HS256 JWT signed with the state key (never the access
//! token secret). Anything other than an intact, unexpired token naming a
//! provider is rejected.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Default state lifetime in seconds.
pub const DEFAULT_STATE_TTL_SECS: i64 = 5 * 60;

/// What the user asked for before being sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateIntent {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    pub site_url: String,
    pub instance_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateClaims {
    #[serde(flatten)]
    intent: StateIntent,
    exp: i64,
}

/// Reasons a state token is rejected. All surface to callers as "invalid state".
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid state: {0}")]
    Invalid(String),

    #[error("invalid state: token expired")]
    Expired,

    #[error("invalid state: missing provider")]
    MissingProvider,

    #[error("invalid state: issued for instance {0}")]
    InstanceMismatch(String),

    #[error("failed to sign state: {0}")]
    Signing(String),
}

/// Encodes and decodes [`StateIntent`]s.
#[derive(Clone)]
pub struct StateTokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl StateTokenCodec {
    pub fn new(key: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(key),
            decoding_key: DecodingKey::from_secret(key),
            ttl: Duration::seconds(DEFAULT_STATE_TTL_SECS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn encode(&self, intent: &StateIntent) -> Result<String, StateError> {
        let claims = StateClaims {
            intent: intent.clone(),
            exp: (Utc::now() + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| StateError::Signing(e.to_string()))
    }

    pub fn decode(&self, token: &str) -> Result<StateIntent, StateError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;

        let data = decode::<StateClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => StateError::Expired,
                _ => StateError::Invalid(e.to_string()),
            }
        })?;

        if data.claims.intent.provider.is_empty() {
            return Err(StateError::MissingProvider);
        }
        Ok(data.claims.intent)
    }

    /// Decode and require the token to have been issued for `instance_id`.
    pub fn decode_for_instance(
        &self,
        token: &str,
        instance_id: &str,
    ) -> Result<StateIntent, StateError> {
        let intent = self.decode(token)?;
        if intent.instance_id != instance_id {
            return Err(StateError::InstanceMismatch(intent.instance_id));
        }
        Ok(intent)
    }
}
