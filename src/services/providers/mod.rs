// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! External OAuth2 identity providers.
//!
//! Each provider implements [`ProviderAdapter`]; the [`ProviderRegistry`] maps
//! lowercase provider names to adapters and is built once at startup.

pub mod github;
pub mod gitlab;
pub mod google;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::Config;
use crate::models::{IdentityAssertion, ProviderEmail};

pub use github::GithubProvider;
pub use gitlab::GitlabProvider;
pub use google::GoogleProvider;

/// Errors from provider adapters.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Unsupported provider: {0}")]
    Unsupported(String),

    #[error("Unable to exchange external code with {provider}: {reason}")]
    ExchangeFailed { provider: String, reason: String },

    #[error("Error getting user identity from {provider}: {reason}")]
    IdentityFetchFailed { provider: String, reason: String },
}

impl ProviderError {
    pub fn exchange(provider: &str, reason: impl ToString) -> Self {
        ProviderError::ExchangeFailed {
            provider: provider.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn identity(provider: &str, reason: impl ToString) -> Self {
        ProviderError::IdentityFetchFailed {
            provider: provider.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Provider access token obtained from the code exchange. Opaque to callers.
#[derive(Debug, Clone)]
pub struct ProviderToken {
    pub access_token: String,
    pub token_type: String,
}

/// One external OAuth2 identity provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Lowercase registry name.
    fn name(&self) -> &'static str;

    /// URL the user is redirected to, carrying `state` through the round-trip.
    fn authorize_url(&self, state: &str) -> String;

    /// Exchange an authorization code for a provider token.
    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, ProviderError>;

    /// Fetch the user's identity. Every failure is `IdentityFetchFailed`.
    async fn fetch_identity(&self, token: &ProviderToken)
        -> Result<IdentityAssertion, ProviderError>;
}

/// Name → adapter lookup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every provider enabled in `config`.
    pub fn from_config(config: &Config, http: reqwest::Client) -> Self {
        let mut registry = Self::new();
        for name in ["github", "google", "gitlab"] {
            let Some(c) = config.provider(name) else {
                continue;
            };
            let adapter: Arc<dyn ProviderAdapter> = match name {
                "github" => Arc::new(GithubProvider::new(c, http.clone())),
                "google" => Arc::new(GoogleProvider::new(c, http.clone())),
                _ => Arc::new(GitlabProvider::new(c, http.clone())),
            };
            registry.register(adapter);
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        tracing::info!(provider = adapter.name(), "Registered external provider");
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ProviderError::Unsupported(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Build the shared HTTP client used for every provider call.
pub fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;

    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("idgate/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed building provider HTTP client")
}

/// The email recorded in metadata: primary, else first verified, else first.
pub fn select_email(emails: &[ProviderEmail]) -> Option<&ProviderEmail> {
    emails
        .iter()
        .find(|e| e.primary)
        .or_else(|| emails.iter().find(|e| e.verified))
        .or_else(|| emails.first())
}

/// Fill `email` and `email_verified` in the metadata from the selected email.
pub(crate) fn record_selected_email(identity: &mut IdentityAssertion) {
    if let Some(selected) = select_email(&identity.emails).cloned() {
        identity
            .metadata
            .insert("email".into(), serde_json::json!(selected.email));
        identity
            .metadata
            .insert("email_verified".into(), serde_json::json!(selected.verified));
    }
}

// ─── OAuth2 authorization-code helpers ─────────────────────────

/// Client settings for the standard authorization-code flow.
#[derive(Debug, Clone)]
pub(crate) struct OAuthClient {
    pub client_id: String,
    pub secret: String,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<&'static str>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl OAuthClient {
    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&self.scopes.join(" ")),
            urlencoding::encode(state)
        )
    }

    /// Exchange `code` at the token endpoint.
    ///
    /// Some providers report errors with a 200 status and an `error` field.
    pub async fn exchange(
        &self,
        http: &reqwest::Client,
        provider: &str,
        code: &str,
    ) -> Result<ProviderToken, ProviderError> {
        let response = http
            .post(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::exchange(provider, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::exchange(
                provider,
                format!("token endpoint returned {}: {}", status, body),
            ));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::exchange(provider, e))?;

        if let Some(error) = body.error {
            return Err(ProviderError::exchange(
                provider,
                format!("{}: {}", error, body.error_description.unwrap_or_default()),
            ));
        }

        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::exchange(provider, "response has no access_token"))?;

        Ok(ProviderToken {
            access_token,
            token_type: body.token_type.unwrap_or_else(|| "bearer".to_string()),
        })
    }
}

/// GET a JSON document with the provider token, mapping every failure to
/// `IdentityFetchFailed`.
pub(crate) async fn fetch_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    provider: &str,
    url: &str,
    token: &ProviderToken,
) -> Result<T, ProviderError> {
    let response = http
        .get(url)
        .bearer_auth(&token.access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| ProviderError::identity(provider, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::identity(
            provider,
            format!("{} returned {}", url, status),
        ));
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::identity(provider, e))
}
