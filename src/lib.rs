// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! idgate: external identity federation and session issuance.
//!
//! Users authenticate through an OAuth2 provider or a SAML IdP; the callback
//! is reconciled against local users and answered with an access JWT plus a
//! rotating refresh token.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use std::sync::Arc;

use config::Config;
use db::Store;
use middleware::auth::AccessTokenSigner;
use services::{
    CallbackReconciler, HookNotifier, Mailer, ProviderRegistry, SamlService, SignupPolicy,
    StateTokenCodec,
};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub db: Arc<dyn Store>,
    pub providers: ProviderRegistry,
    pub state_codec: StateTokenCodec,
    /// `None` when SAML is not configured
    pub saml: Option<SamlService>,
    pub reconciler: CallbackReconciler,
    pub signer: AccessTokenSigner,
    pub hooks: HookNotifier,
}

impl AppState {
    /// Wire the services for `config` on top of `db`.
    pub fn new(
        config: Config,
        db: Arc<dyn Store>,
        providers: ProviderRegistry,
        saml: Option<SamlService>,
        mailer: Arc<dyn Mailer>,
        hooks: HookNotifier,
    ) -> Self {
        let state_codec = StateTokenCodec::new(&config.state_signing_key)
            .with_ttl(chrono::Duration::seconds(config.state_token_ttl_secs));
        let signer = AccessTokenSigner::new(&config.jwt_secret, config.jwt_exp);
        let reconciler = CallbackReconciler::new(
            db.clone(),
            mailer,
            signer.clone(),
            hooks.clone(),
            SignupPolicy::from_config(&config),
        );

        Self {
            config,
            db,
            providers,
            state_codec,
            saml,
            reconciler,
            signer,
            hooks,
        }
    }
}
