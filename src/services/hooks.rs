// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Webhook delivery from the outbox.
//!
//! Hook events are written to storage in the same unit of work as the user
//! change that caused them. After the commit the writer pokes the
//! [`HookNotifier`]; the [`HookDispatcher`] then posts pending events to the
//! configured endpoint. A periodic sweep picks up anything missed, so
//! delivery is at-least-once with a bounded number of attempts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{stream, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

use crate::config::WebhookConfig;
use crate::db::{Store, StoreError};
use crate::models::HookEvent;

/// Header carrying the signature JWT.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
const SIGNATURE_ISSUER: &str = "idgate";
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const BATCH_SIZE: usize = 50;
const MAX_CONCURRENT_DELIVERIES: usize = 8;

/// Claims of the signature JWT; `sha256` is the hex digest of the body.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignatureClaims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub sha256: String,
}

/// Sign a webhook body.
pub fn sign_payload(secret: &[u8], instance_id: &str, body: &[u8]) -> anyhow::Result<String> {
    let claims = SignatureClaims {
        iss: SIGNATURE_ISSUER.to_string(),
        sub: instance_id.to_string(),
        iat: Utc::now().timestamp(),
        sha256: hex::encode(Sha256::digest(body)),
    };
    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )?)
}

/// Wakes the dispatcher after a commit that enqueued events.
#[derive(Clone, Default)]
pub struct HookNotifier {
    notify: Arc<Notify>,
}

impl HookNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }
}

pub struct HookDispatcher {
    store: Arc<dyn Store>,
    http: reqwest::Client,
    config: WebhookConfig,
    notifier: HookNotifier,
}

impl HookDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        http: reqwest::Client,
        config: WebhookConfig,
        notifier: HookNotifier,
    ) -> Self {
        Self {
            store,
            http,
            config,
            notifier,
        }
    }

    /// Run the delivery loop on a background task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tracing::info!(url = %self.config.url, "Webhook dispatcher started");
        loop {
            tokio::select! {
                _ = self.notifier.notify.notified() => {}
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }
            if let Err(e) = self.deliver_pending().await {
                tracing::warn!(error = %e, "Webhook sweep failed");
            }
        }
    }

    /// Attempt every pending event once. Returns how many were delivered.
    pub async fn deliver_pending(&self) -> Result<usize, StoreError> {
        let events = self.store.pending_hook_events(BATCH_SIZE).await?;
        if events.is_empty() {
            return Ok(0);
        }

        let results: Vec<Result<bool, StoreError>> = stream::iter(events)
            .map(|event| self.deliver(event))
            .buffer_unordered(MAX_CONCURRENT_DELIVERIES)
            .collect()
            .await;

        let mut delivered = 0;
        for result in results {
            if result? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn deliver(&self, mut event: HookEvent) -> Result<bool, StoreError> {
        event.attempts += 1;

        let outcome = match self.post(&event).await {
            Ok(()) => {
                event.delivered = true;
                event.delivered_at = Some(Utc::now());
                event.last_error = None;
                true
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    event = event.event.as_str(),
                    attempts = event.attempts,
                    error = %e,
                    "Webhook delivery failed"
                );
                event.last_error = Some(e.to_string());
                if event.attempts >= self.config.max_attempts {
                    tracing::error!(event_id = %event.id, "Giving up on webhook event");
                    event.delivered = true;
                }
                false
            }
        };

        self.store.save_hook_event(&event).await?;
        Ok(outcome)
    }

    async fn post(&self, event: &HookEvent) -> anyhow::Result<()> {
        let body = serde_json::to_vec(&event.payload())?;
        let signature = sign_payload(&self.config.secret, &event.instance_id, &body)?;

        let response = self
            .http
            .post(&self.config.url)
            .timeout(DELIVERY_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("webhook endpoint returned {}", status);
        }
        Ok(())
    }
}
