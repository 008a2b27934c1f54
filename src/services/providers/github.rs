// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! GitHub OAuth provider (github.com or GitHub Enterprise).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map};

use super::{
    fetch_json, record_selected_email, OAuthClient, ProviderAdapter, ProviderError, ProviderToken,
};
use crate::config::ProviderConfig;
use crate::models::{IdentityAssertion, ProviderEmail};

const DEFAULT_AUTH_HOST: &str = "https://github.com";
const DEFAULT_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct GithubUser {
    id: u64,
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubEmail {
    email: String,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    verified: bool,
}

pub struct GithubProvider {
    oauth: OAuthClient,
    api_base: String,
    http: reqwest::Client,
}

impl GithubProvider {
    /// With `config.url` set, the enterprise API lives under `<url>/api/v3`.
    pub fn new(config: &ProviderConfig, http: reqwest::Client) -> Self {
        let (auth_host, api_base) = match &config.url {
            Some(url) => {
                let url = url.trim_end_matches('/');
                (url.to_string(), format!("{}/api/v3", url))
            }
            None => (DEFAULT_AUTH_HOST.to_string(), DEFAULT_API_BASE.to_string()),
        };

        Self {
            oauth: OAuthClient {
                client_id: config.client_id.clone(),
                secret: config.secret.clone(),
                redirect_uri: config.redirect_uri.clone(),
                auth_url: format!("{}/login/oauth/authorize", auth_host),
                token_url: format!("{}/login/oauth/access_token", auth_host),
                scopes: vec!["user:email"],
            },
            api_base,
            http,
        }
    }
}

#[async_trait]
impl ProviderAdapter for GithubProvider {
    fn name(&self) -> &'static str {
        "github"
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
        let user: GithubUser =
            fetch_json(&self.http, self.name(), &format!("{}/user", self.api_base), token).await?;
        let emails: Vec<GithubEmail> = fetch_json(
            &self.http,
            self.name(),
            &format!("{}/user/emails", self.api_base),
            token,
        )
        .await?;

        if emails.is_empty() {
            return Err(ProviderError::identity(
                self.name(),
                "no email address returned by API call to /user/emails",
            ));
        }

        let mut metadata = Map::new();
        metadata.insert("provider_id".into(), json!(user.id.to_string()));
        metadata.insert("sub".into(), json!(user.id.to_string()));
        metadata.insert("iss".into(), json!(self.api_base));
        if let Some(name) = user.name {
            metadata.insert("name".into(), json!(name));
            metadata.insert("full_name".into(), json!(name));
        }
        if let Some(login) = user.login {
            metadata.insert("user_name".into(), json!(login));
            metadata.insert("preferred_username".into(), json!(login));
        }
        if let Some(avatar) = user.avatar_url {
            metadata.insert("avatar_url".into(), json!(avatar));
            metadata.insert("picture".into(), json!(avatar));
        }

        let mut identity = IdentityAssertion {
            emails: emails
                .into_iter()
                .map(|e| ProviderEmail::new(e.email, e.verified, e.primary))
                .collect(),
            metadata,
        };
        record_selected_email(&mut identity);
        Ok(identity)
    }
}
