// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Outbound mail interface. Rendering and delivery live outside this crate.

use async_trait::async_trait;

use crate::models::User;

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send the confirmation link for `user.confirmation_token`.
    async fn confirmation_mail(&self, user: &User, referrer: Option<&str>) -> anyhow::Result<()>;
}

/// Mailer that only logs; used when no delivery backend is configured.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn confirmation_mail(&self, user: &User, referrer: Option<&str>) -> anyhow::Result<()> {
        tracing::info!(
            user_id = %user.id,
            email = %user.email,
            referrer = referrer.unwrap_or(""),
            "Confirmation mail requested"
        );
        Ok(())
    }
}
