// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Normalized identity returned by every external provider.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::user::is_present;

/// One email address as reported by the provider, flags untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEmail {
    pub email: String,
    pub verified: bool,
    pub primary: bool,
}

impl ProviderEmail {
    pub fn new(email: impl Into<String>, verified: bool, primary: bool) -> Self {
        Self {
            email: email.into(),
            verified,
            primary,
        }
    }
}

/// Identity assertion produced by an OAuth adapter or the SAML verifier.
///
/// Emails keep the provider's ordering; matching iterates them in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityAssertion {
    pub emails: Vec<ProviderEmail>,
    /// Free-form claims: name, full_name, avatar_url, sub, iss, provider_id, ...
    pub metadata: Map<String, Value>,
}

impl IdentityAssertion {
    /// Email used when a new user has to be created: the primary entry, else the first.
    pub fn preferred_email(&self) -> Option<&ProviderEmail> {
        self.emails
            .iter()
            .find(|e| e.primary)
            .or_else(|| self.emails.first())
    }

    /// Metadata with null and empty-string values dropped.
    pub fn sparse_metadata(&self) -> Map<String, Value> {
        self.metadata
            .iter()
            .filter(|(_, v)| is_present(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn has_email(&self, email: &str) -> bool {
        self.emails.iter().any(|e| e.email == email)
    }

    pub fn email_addresses(&self) -> Vec<String> {
        self.emails.iter().map(|e| e.email.clone()).collect()
    }
}
