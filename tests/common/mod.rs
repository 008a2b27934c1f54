// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response};
use idgate::config::Config;
use idgate::db::{FirestoreDb, MemoryDb};
use idgate::models::{IdentityAssertion, ProviderEmail, User};
use idgate::routes::create_router;
use idgate::services::mailer::Mailer;
use idgate::services::providers::{ProviderAdapter, ProviderError, ProviderToken};
use idgate::services::{HookNotifier, ProviderRegistry, SamlService, StateIntent};
use idgate::AppState;
use serde_json::{json, Map};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection.
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

/// Provider adapter that returns a canned identity without any network calls.
pub struct StubProvider {
    name: &'static str,
    identity: Mutex<IdentityAssertion>,
}

#[allow(dead_code)]
impl StubProvider {
    pub fn new(name: &'static str, emails: Vec<ProviderEmail>) -> Self {
        let mut metadata = Map::new();
        metadata.insert("full_name".into(), json!("Stub User"));
        metadata.insert("avatar_url".into(), json!("http://example.com/avatar"));
        metadata.insert("nickname".into(), json!(""));
        Self {
            name,
            identity: Mutex::new(IdentityAssertion { emails, metadata }),
        }
    }

    pub fn set_emails(&self, emails: Vec<ProviderEmail>) {
        self.identity.lock().unwrap().emails = emails;
    }
}

#[async_trait]
impl ProviderAdapter for StubProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn authorize_url(&self, state: &str) -> String {
        format!(
            "https://{}.example/authorize?state={}",
            self.name,
            urlencoding::encode(state)
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, ProviderError> {
        if code == "bad_code" {
            return Err(ProviderError::exchange(self.name, "bad_verification_code"));
        }
        Ok(ProviderToken {
            access_token: format!("token-for-{}", code),
            token_type: "bearer".to_string(),
        })
    }

    async fn fetch_identity(
        &self,
        _token: &ProviderToken,
    ) -> Result<IdentityAssertion, ProviderError> {
        Ok(self.identity.lock().unwrap().clone())
    }
}

/// Mailer that records recipients instead of sending.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl RecordingMailer {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn confirmation_mail(&self, user: &User, _referrer: Option<&str>) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(user.email.clone());
        Ok(())
    }
}

/// Everything a test needs to drive and inspect the app.
#[allow(dead_code)]
pub struct TestApp {
    pub router: axum::Router,
    pub state: Arc<AppState>,
    pub db: MemoryDb,
    pub mailer: Arc<RecordingMailer>,
    pub provider: Arc<StubProvider>,
}

#[allow(dead_code)]
impl TestApp {
    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// A signed state for the stub provider.
    pub fn state_token(&self, invite_token: Option<&str>) -> String {
        self.state_token_for("stub", invite_token)
    }

    pub fn state_token_for(&self, provider: &str, invite_token: Option<&str>) -> String {
        let intent = StateIntent {
            provider: provider.to_string(),
            invite_token: invite_token.map(str::to_string),
            referrer: None,
            site_url: self.state.config.site_url.clone(),
            instance_id: self.state.config.instance_id.clone(),
        };
        self.state.state_codec.encode(&intent).unwrap()
    }

    /// GET the callback with `code` and a fresh state; returns the response.
    pub async fn callback(&self, code: &str, invite_token: Option<&str>) -> Response<Body> {
        let uri = format!(
            "/callback?code={}&state={}",
            code,
            self.state_token(invite_token)
        );
        self.get(&uri).await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        use tower::ServiceExt;

        self.router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    /// Seed a user; `confirmed` decides whether `confirmed_at` is set.
    pub fn seed_user(&self, email: &str, confirmed: bool) -> User {
        let now = chrono::Utc::now();
        let mut user = User::new(
            &self.state.config.instance_id,
            email,
            &self.state.config.jwt_aud,
            Map::new(),
            now,
        );
        if confirmed {
            user.confirm(now);
        }
        self.db.put_user(user.clone()).unwrap();
        user
    }
}

/// Build an app over the in-memory store with one stub provider named "stub".
#[allow(dead_code)]
pub fn create_test_app_with(config: Config, emails: Vec<ProviderEmail>) -> TestApp {
    create_test_app_with_saml(config, emails, None)
}

#[allow(dead_code)]
pub fn create_test_app_with_saml(
    config: Config,
    emails: Vec<ProviderEmail>,
    saml: Option<SamlService>,
) -> TestApp {
    let db = MemoryDb::new();
    let mailer = Arc::new(RecordingMailer::default());
    let provider = Arc::new(StubProvider::new("stub", emails));

    let mut providers = ProviderRegistry::new();
    providers.register(provider.clone());

    let state = Arc::new(AppState::new(
        config,
        Arc::new(db.clone()),
        providers,
        saml,
        mailer.clone(),
        HookNotifier::new(),
    ));

    TestApp {
        router: create_router(state.clone()),
        state,
        db,
        mailer,
        provider,
    }
}

/// Create a test app with offline mock dependencies.
/// Returns the router and the shared state.
#[allow(dead_code)]
pub fn create_test_app() -> (axum::Router, Arc<AppState>) {
    let app = create_test_app_with(
        Config::test_default(),
        vec![ProviderEmail::new("stub@example.com", true, true)],
    );
    (app.router, app.state)
}

/// Location header of a redirect.
#[allow(dead_code)]
pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("missing Location header")
        .to_str()
        .unwrap()
        .to_string()
}

/// Decoded key/value pairs of the URL fragment.
#[allow(dead_code)]
pub fn fragment_params(url: &str) -> HashMap<String, String> {
    let Some((_, fragment)) = url.split_once('#') else {
        return HashMap::new();
    };
    fragment
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| {
            (
                urlencoding::decode(k).unwrap().into_owned(),
                urlencoding::decode(v).unwrap().into_owned(),
            )
        })
        .collect()
}
