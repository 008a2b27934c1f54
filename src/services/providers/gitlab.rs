// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! GitLab OAuth provider (gitlab.com or self-managed).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map};

use super::{
    fetch_json, record_selected_email, OAuthClient, ProviderAdapter, ProviderError, ProviderToken,
};
use crate::config::ProviderConfig;
use crate::models::{IdentityAssertion, ProviderEmail};

const DEFAULT_HOST: &str = "https://gitlab.com";

#[derive(Debug, Deserialize)]
struct GitlabUser {
    id: u64,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    confirmed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitlabEmail {
    email: String,
    #[serde(default)]
    confirmed_at: Option<String>,
}

pub struct GitlabProvider {
    oauth: OAuthClient,
    host: String,
    http: reqwest::Client,
}

impl GitlabProvider {
    pub fn new(config: &ProviderConfig, http: reqwest::Client) -> Self {
        let host = config
            .url
            .as_deref()
            .unwrap_or(DEFAULT_HOST)
            .trim_end_matches('/')
            .to_string();

        Self {
            oauth: OAuthClient {
                client_id: config.client_id.clone(),
                secret: config.secret.clone(),
                redirect_uri: config.redirect_uri.clone(),
                auth_url: format!("{}/oauth/authorize", host),
                token_url: format!("{}/oauth/token", host),
                scopes: vec!["read_user"],
            },
            host,
            http,
        }
    }
}

#[async_trait]
impl ProviderAdapter for GitlabProvider {
    fn name(&self) -> &'static str {
        "gitlab"
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
        let user: GitlabUser = fetch_json(
            &self.http,
            self.name(),
            &format!("{}/api/v4/user", self.host),
            token,
        )
        .await?;
        let secondary: Vec<GitlabEmail> = fetch_json(
            &self.http,
            self.name(),
            &format!("{}/api/v4/user/emails", self.host),
            token,
        )
        .await?;

        let mut emails = Vec::new();
        if let Some(email) = user.email.filter(|e| !e.is_empty()) {
            emails.push(ProviderEmail::new(email, user.confirmed_at.is_some(), true));
        }
        for e in secondary {
            if !emails.iter().any(|known| known.email == e.email) {
                emails.push(ProviderEmail::new(e.email, e.confirmed_at.is_some(), false));
            }
        }
        if emails.is_empty() {
            return Err(ProviderError::identity(self.name(), "no email address returned"));
        }

        let mut metadata = Map::new();
        metadata.insert("provider_id".into(), json!(user.id.to_string()));
        metadata.insert("sub".into(), json!(user.id.to_string()));
        metadata.insert("iss".into(), json!(self.host));
        if let Some(name) = user.name {
            metadata.insert("name".into(), json!(name));
            metadata.insert("full_name".into(), json!(name));
        }
        if let Some(username) = user.username {
            metadata.insert("user_name".into(), json!(username));
        }
        if let Some(avatar) = user.avatar_url {
            metadata.insert("avatar_url".into(), json!(avatar));
        }

        let mut identity = IdentityAssertion { emails, metadata };
        record_selected_email(&mut identity);
        Ok(identity)
    }
}
