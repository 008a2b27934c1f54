// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Google OAuth provider.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map};

use super::{
    fetch_json, record_selected_email, OAuthClient, ProviderAdapter, ProviderError, ProviderToken,
};
use crate::config::ProviderConfig;
use crate::models::{IdentityAssertion, ProviderEmail};

const DEFAULT_AUTH_HOST: &str = "https://accounts.google.com";
const DEFAULT_API_HOST: &str = "https://www.googleapis.com";

#[derive(Debug, Deserialize)]
struct GoogleUser {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    verified_email: bool,
}

pub struct GoogleProvider {
    oauth: OAuthClient,
    profile_url: String,
    http: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(config: &ProviderConfig, http: reqwest::Client) -> Self {
        let (auth_host, api_host) = match &config.url {
            Some(url) => {
                let url = url.trim_end_matches('/').to_string();
                (url.clone(), url)
            }
            None => (DEFAULT_AUTH_HOST.to_string(), DEFAULT_API_HOST.to_string()),
        };

        Self {
            oauth: OAuthClient {
                client_id: config.client_id.clone(),
                secret: config.secret.clone(),
                redirect_uri: config.redirect_uri.clone(),
                auth_url: format!("{}/o/oauth2/auth", auth_host),
                token_url: format!("{}/o/oauth2/token", auth_host),
                scopes: vec!["email", "profile"],
            },
            profile_url: format!("{}/userinfo/v2/me", api_host),
            http,
        }
    }
}

#[async_trait]
impl ProviderAdapter for GoogleProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    fn authorize_url(&self, state: &str) -> String {
        self.oauth.authorize_url(state)
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, ProviderError> {
        self.oauth.exchange(&self.http, self.name(), code).await
    }

    async fn fetch_identity(
        &self,
        token: &ProviderToken,
    ) -> Result<IdentityAssertion, ProviderError> {
        let user: GoogleUser = fetch_json(&self.http, self.name(), &self.profile_url, token).await?;

        let email = user
            .email
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ProviderError::identity(self.name(), "no email address returned"))?;

        let mut metadata = Map::new();
        metadata.insert("provider_id".into(), json!(user.id));
        metadata.insert("sub".into(), json!(user.id));
        metadata.insert("iss".into(), json!(DEFAULT_AUTH_HOST));
        if let Some(name) = user.name {
            metadata.insert("name".into(), json!(name));
            metadata.insert("full_name".into(), json!(name));
        }
        if let Some(picture) = user.picture {
            metadata.insert("avatar_url".into(), json!(picture));
            metadata.insert("picture".into(), json!(picture));
        }

        let mut identity = IdentityAssertion {
            emails: vec![ProviderEmail::new(email, user.verified_email, true)],
            metadata,
        };
        record_selected_email(&mut identity);
        Ok(identity)
    }
}
