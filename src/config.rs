// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Secrets are injected as environment variables (or a local `.env` file) and
//! read once at startup.

use std::env;
use std::str::FromStr;

use hkdf::Hkdf;
use sha2::Sha256;
use validator::Validate;

use crate::models::HookEventKind;

/// HKDF info label for the state-token key.
const STATE_KEY_INFO: &[u8] = b"idgate oauth state token v1";

/// Where users and tokens are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Firestore,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "firestore" => Ok(StorageBackend::Firestore),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(ConfigError::Invalid(format!(
                "STORAGE_BACKEND must be 'firestore' or 'memory', got '{}'",
                s
            ))),
        }
    }
}

/// OAuth client settings for one external provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub client_id: String,
    pub secret: String,
    /// Callback URL registered with the provider
    pub redirect_uri: String,
    /// Base URL override for self-hosted or test instances
    pub url: Option<String>,
}

/// Configured external providers; `None` means disabled.
#[derive(Debug, Clone, Default)]
pub struct ExternalConfig {
    pub github: Option<ProviderConfig>,
    pub google: Option<ProviderConfig>,
    pub gitlab: Option<ProviderConfig>,
}

/// Outbound webhook settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: Vec<u8>,
    pub events: Vec<HookEventKind>,
    pub max_attempts: u32,
}

impl WebhookConfig {
    pub fn has_event(&self, event: HookEventKind) -> bool {
        self.events.contains(&event)
    }
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone, Validate)]
pub struct Config {
    // --- Environment Variables (non-sensitive) ---
    /// Server port
    pub port: u16,
    /// Identifier of the tenant this process serves
    pub instance_id: String,
    /// Public URL of the site users come from
    #[validate(url)]
    pub site_url: String,
    /// Where federation results are redirected when no referrer applies
    #[validate(url)]
    pub external_redirect_url: String,
    /// Externally visible base URL of this service
    #[validate(url)]
    pub api_base: String,
    /// Default audience for users and access tokens
    pub jwt_aud: String,
    /// Access-token lifetime in seconds
    pub jwt_exp: i64,
    /// State-token lifetime in seconds
    pub state_token_ttl_secs: i64,
    pub disable_signup: bool,
    /// Treat every provider email as verified
    pub autoconfirm: bool,
    /// Minimum seconds between two confirmation mails to one user
    pub mailer_max_frequency_secs: i64,
    pub provider_timeout_secs: u64,
    pub gcp_project_id: String,
    pub storage_backend: StorageBackend,
    /// Cookie checked before the Authorization header
    pub cookie_name: String,
    pub external: ExternalConfig,
    pub saml_metadata_url: Option<String>,
    pub webhook: Option<WebhookConfig>,

    // --- Secrets ---
    /// HS256 secret for access tokens
    pub jwt_secret: Vec<u8>,
    /// HS256 secret for OAuth state tokens, never equal to `jwt_secret`
    pub state_signing_key: Vec<u8>,
}

impl Config {
    /// Default config for testing only.
    pub fn test_default() -> Self {
        Self {
            port: 8080,
            instance_id: "test-instance".to_string(),
            site_url: "http://localhost:5173".to_string(),
            external_redirect_url: "http://localhost:5173".to_string(),
            api_base: "http://localhost:8080".to_string(),
            jwt_aud: String::new(),
            jwt_exp: 3600,
            state_token_ttl_secs: 300,
            disable_signup: false,
            autoconfirm: false,
            mailer_max_frequency_secs: 900,
            provider_timeout_secs: 10,
            gcp_project_id: "test-project".to_string(),
            storage_backend: StorageBackend::Memory,
            cookie_name: "idgate_token".to_string(),
            external: ExternalConfig::default(),
            saml_metadata_url: None,
            webhook: None,
            jwt_secret: b"test_jwt_key_32_bytes_minimum!!".to_vec(),
            state_signing_key: derive_key(b"test_operator_token", STATE_KEY_INFO),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let site_url = env::var("SITE_URL").unwrap_or_else(|_| "http://localhost:5173".to_string());
        let api_base = env::var("API_BASE").unwrap_or_else(|_| "http://localhost:8080".to_string());
        let callback_url = format!("{}/callback", api_base.trim_end_matches('/'));

        let jwt_secret = env::var("JWT_SECRET")
            .map(|v| v.trim().as_bytes().to_vec())
            .map_err(|_| ConfigError::Missing("JWT_SECRET"))?;

        let state_signing_key = match env::var("STATE_SIGNING_KEY") {
            Ok(key) if !key.trim().is_empty() => key.trim().as_bytes().to_vec(),
            _ => {
                let operator = env::var("OPERATOR_TOKEN")
                    .map_err(|_| ConfigError::Missing("OPERATOR_TOKEN"))?;
                derive_key(operator.trim().as_bytes(), STATE_KEY_INFO)
            }
        };
        if state_signing_key == jwt_secret {
            return Err(ConfigError::Invalid(
                "STATE_SIGNING_KEY must differ from JWT_SECRET".to_string(),
            ));
        }

        let config = Self {
            port: parse_var("PORT", 8080),
            instance_id: env::var("INSTANCE_ID").unwrap_or_else(|_| "default".to_string()),
            external_redirect_url: env::var("EXTERNAL_REDIRECT_URL")
                .unwrap_or_else(|_| site_url.clone()),
            site_url,
            jwt_aud: env::var("JWT_AUD").unwrap_or_default(),
            jwt_exp: parse_var("JWT_EXP", 3600),
            state_token_ttl_secs: parse_var("STATE_TOKEN_TTL_SECS", 300),
            disable_signup: parse_var("DISABLE_SIGNUP", false),
            autoconfirm: parse_var("MAILER_AUTOCONFIRM", false),
            mailer_max_frequency_secs: parse_var("MAILER_MAX_FREQUENCY_SECS", 900),
            provider_timeout_secs: parse_var("PROVIDER_TIMEOUT_SECS", 10),
            gcp_project_id: env::var("GCP_PROJECT_ID").unwrap_or_else(|_| "local-dev".to_string()),
            storage_backend: env::var("STORAGE_BACKEND")
                .unwrap_or_else(|_| "firestore".to_string())
                .parse()?,
            cookie_name: env::var("COOKIE_NAME").unwrap_or_else(|_| "idgate_token".to_string()),
            external: ExternalConfig {
                github: provider_from_env("GITHUB", &callback_url),
                google: provider_from_env("GOOGLE", &callback_url),
                gitlab: provider_from_env("GITLAB", &callback_url),
            },
            saml_metadata_url: non_empty_var("SAML_METADATA_URL"),
            webhook: webhook_from_env()?,
            api_base,
            jwt_secret,
            state_signing_key,
        };

        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }

    /// Provider settings by lowercase name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "github" => self.external.github.as_ref(),
            "google" => self.external.google.as_ref(),
            "gitlab" => self.external.gitlab.as_ref(),
            _ => None,
        }
    }
}

/// Derive a 32-byte subkey from an operator secret with HKDF-SHA256.
pub fn derive_key(master: &[u8], info: &[u8]) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(None, master);
    let mut okm = [0u8; 32];
    // 32 bytes is far below the HKDF-SHA256 output limit, so expand cannot fail.
    let _ = hk.expand(info, &mut okm);
    okm.to_vec()
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    non_empty_var(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn provider_from_env(prefix: &str, callback_url: &str) -> Option<ProviderConfig> {
    let client_id = non_empty_var(&format!("{}_CLIENT_ID", prefix))?;
    let secret = non_empty_var(&format!("{}_SECRET", prefix))?;
    Some(ProviderConfig {
        client_id,
        secret,
        redirect_uri: non_empty_var(&format!("{}_REDIRECT_URI", prefix))
            .unwrap_or_else(|| callback_url.to_string()),
        url: non_empty_var(&format!("{}_URL", prefix)),
    })
}

fn webhook_from_env() -> Result<Option<WebhookConfig>, ConfigError> {
    let Some(url) = non_empty_var("WEBHOOK_URL") else {
        return Ok(None);
    };
    let secret = non_empty_var("WEBHOOK_SECRET").ok_or(ConfigError::Missing("WEBHOOK_SECRET"))?;
    let events = match non_empty_var("WEBHOOK_EVENTS") {
        Some(list) => list
            .split(',')
            .map(|name| {
                HookEventKind::parse(name)
                    .ok_or_else(|| ConfigError::Invalid(format!("unknown webhook event '{}'", name)))
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => vec![HookEventKind::Signup, HookEventKind::Login],
    };

    Ok(Some(WebhookConfig {
        url,
        secret: secret.into_bytes(),
        events,
        max_attempts: parse_var("WEBHOOK_MAX_ATTEMPTS", 3),
    }))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
