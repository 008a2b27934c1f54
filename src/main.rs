// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! idgate API server
//!
//! Federates sign-in through external OAuth2 providers and issues access and
//! refresh tokens for a single configured instance.

use idgate::{
    config::{Config, StorageBackend},
    db::{FirestoreDb, MemoryDb, Store},
    services::{
        providers::http_client, HookDispatcher, HookNotifier, LogMailer, ProviderRegistry,
        SamlService, X509SignatureVerifier,
    },
    AppState,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging
    init_logging();

    // Load configuration from environment
    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!(
        port = config.port,
        instance_id = %config.instance_id,
        "Starting idgate"
    );

    let db: Arc<dyn Store> = match config.storage_backend {
        StorageBackend::Firestore => Arc::new(
            FirestoreDb::new(&config.gcp_project_id)
                .await
                .expect("Failed to connect to Firestore"),
        ),
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; data is lost on restart");
            Arc::new(MemoryDb::new())
        }
    };

    // One client for every outbound call, bounded by the provider timeout
    let http = http_client(Duration::from_secs(config.provider_timeout_secs))
        .expect("Failed to build HTTP client");

    let providers = ProviderRegistry::from_config(&config, http.clone());
    if providers.names().is_empty() {
        tracing::warn!("No external providers configured");
    }

    let saml = config.saml_metadata_url.as_deref().map(|url| {
        tracing::info!(metadata_url = %url, "SAML sign-in enabled");
        SamlService::new(
            &config.api_base,
            url,
            Arc::new(X509SignatureVerifier),
            http.clone(),
        )
    });

    let hooks = HookNotifier::new();
    if let Some(webhook) = config.webhook.clone() {
        HookDispatcher::new(db.clone(), http.clone(), webhook, hooks.clone()).spawn();
    }

    // Build shared state
    let state = Arc::new(AppState::new(
        config.clone(),
        db,
        providers,
        saml,
        Arc::new(LogMailer),
        hooks,
    ));

    // Build router
    let app = idgate::routes::create_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Initialize structured JSON logging.
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("idgate=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .with(format)
        .init();
}
