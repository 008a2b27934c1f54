// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Turns a verified external identity into a local user and a session.
//!
//! The whole decision runs inside one unit of work:
//!
//! 1. Invite link: the state carries an invite token. The invited user must
//!    exist and one of the provider's emails must equal the invited email.
//! 2. Match or create: provider emails are tried in order; an email is
//!    eligible when verified (or when auto-confirm is on) and the first one
//!    that finds a user binds to it. Otherwise a new user is created from the
//!    preferred email, unless signups are disabled. An unverified preferred
//!    email that already belongs to an unconfirmed user resumes that user.
//! 3. An unconfirmed user whose binding email is unverified gets a
//!    confirmation mail and no tokens.
//! 4. Everyone else gets an audit entry, an outbox event, and a token pair.
//!
//! Any error rolls the unit back, so nothing partial is ever committed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::Config;
use crate::context::RequestContext;
use crate::db::{Store, StoreError, UnitOfWork};
use crate::middleware::auth::AccessTokenSigner;
use crate::models::{
    AccessTokenResponse, AuditAction, AuditLogEntry, HookEvent, HookEventKind, IdentityAssertion,
    ProviderEmail, User,
};
use crate::services::hooks::HookNotifier;
use crate::services::mailer::Mailer;
use crate::services::refresh_tokens::{secure_token, RefreshTokenService, TokenError};
use crate::services::state_token::StateIntent;
use crate::time_utils::within;

/// Instance policy knobs consulted during reconciliation.
#[derive(Debug, Clone)]
pub struct SignupPolicy {
    pub disable_signup: bool,
    pub autoconfirm: bool,
    /// Minimum time between two confirmation mails
    pub confirmation_interval: Duration,
    /// Events the webhook subscribes to; empty when no webhook is configured
    pub hook_events: Vec<HookEventKind>,
}

impl SignupPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            disable_signup: config.disable_signup,
            autoconfirm: config.autoconfirm,
            confirmation_interval: Duration::seconds(config.mailer_max_frequency_secs),
            hook_events: config
                .webhook
                .as_ref()
                .map(|w| w.events.clone())
                .unwrap_or_default(),
        }
    }
}

/// Result of a successful callback.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    /// Signed in; tokens go back to the client.
    Issued(AccessTokenResponse),
    /// A confirmation mail was (or recently had been) sent; no tokens.
    PendingConfirmation { user_id: String, email: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Invite not found")]
    InviteNotFound,

    #[error("Invited email does not match emails from external provider")]
    InvitedEmailMismatch {
        invited: String,
        external: Vec<String>,
    },

    #[error("Signups not allowed for this instance")]
    SignupsDisabled { provider: String, email: String },

    #[error("A user with this email address has already been registered")]
    EmailTaken { provider: String, email: String },

    #[error("Error getting user email from external provider {provider}")]
    IdentityFetchFailed { provider: String },

    #[error("Concurrent sign-in for {email}: {reason}")]
    Conflict { email: String, reason: String },

    #[error("Error sending confirmation mail: {0}")]
    Mail(anyhow::Error),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(anyhow::Error),
}

/// What one run decided, applied after a successful commit.
struct Decision {
    outcome: CallbackOutcome,
    email: String,
    events_enqueued: bool,
}

pub struct CallbackReconciler {
    store: Arc<dyn Store>,
    mailer: Arc<dyn Mailer>,
    signer: AccessTokenSigner,
    hooks: HookNotifier,
    policy: SignupPolicy,
}

impl CallbackReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        mailer: Arc<dyn Mailer>,
        signer: AccessTokenSigner,
        hooks: HookNotifier,
        policy: SignupPolicy,
    ) -> Self {
        Self {
            store,
            mailer,
            signer,
            hooks,
            policy,
        }
    }

    pub fn policy(&self) -> &SignupPolicy {
        &self.policy
    }

    pub async fn reconcile(
        &self,
        ctx: &RequestContext,
        intent: &StateIntent,
        identity: &IdentityAssertion,
    ) -> Result<CallbackOutcome, ReconcileError> {
        let mut unit = self.store.begin().await?;

        let decision = match self.decide(unit.as_mut(), ctx, intent, identity).await {
            Ok(decision) => decision,
            Err(e) => {
                unit.rollback().await;
                return Err(e);
            }
        };

        unit.commit().await.map_err(|e| match e {
            StoreError::Conflict(reason) => {
                tracing::warn!(
                    provider = %intent.provider,
                    email = %decision.email,
                    reason = %reason,
                    "Callback lost a race with a concurrent sign-in"
                );
                ReconcileError::Conflict {
                    email: decision.email.clone(),
                    reason,
                }
            }
            other => ReconcileError::Store(other),
        })?;

        if decision.events_enqueued {
            self.hooks.notify();
        }
        Ok(decision.outcome)
    }

    async fn decide(
        &self,
        unit: &mut dyn UnitOfWork,
        ctx: &RequestContext,
        intent: &StateIntent,
        identity: &IdentityAssertion,
    ) -> Result<Decision, ReconcileError> {
        let now = Utc::now();
        let provider = intent.provider.as_str();
        if identity.emails.is_empty() {
            return Err(ReconcileError::IdentityFetchFailed {
                provider: provider.to_string(),
            });
        }

        let mut events_enqueued = false;

        if let Some(invite) = intent.invite_token.as_deref().filter(|t| !t.is_empty()) {
            let mut user = unit
                .find_user_by_confirmation_token(invite)
                .await?
                .ok_or(ReconcileError::InviteNotFound)?;

            if !identity.has_email(&user.email) {
                return Err(ReconcileError::InvitedEmailMismatch {
                    invited: user.email.clone(),
                    external: identity.email_addresses(),
                });
            }

            user.set_provider(provider);
            user.merge_user_metadata(&identity.metadata);
            self.audit(unit, ctx, &user, AuditAction::InviteAccepted, provider, now)
                .await?;
            events_enqueued |= self
                .enqueue(unit, ctx, &user, HookEventKind::Signup, now)
                .await?;
            user.confirm(now);

            tracing::info!(provider, user_id = %user.id, "Invite accepted via external provider");
            let tokens = self.issue(unit, &mut user, false, now).await?;
            return Ok(Decision {
                outcome: CallbackOutcome::Issued(tokens),
                email: user.email,
                events_enqueued,
            });
        }

        let (mut user, binding, is_new) = match self.match_existing(unit, ctx, identity).await? {
            Some((user, binding)) => (user, binding, false),
            None => {
                let preferred = identity
                    .preferred_email()
                    .cloned()
                    .ok_or_else(|| ReconcileError::IdentityFetchFailed {
                        provider: provider.to_string(),
                    })?;
                if self.policy.disable_signup {
                    return Err(ReconcileError::SignupsDisabled {
                        provider: provider.to_string(),
                        email: preferred.email,
                    });
                }

                // An unverified preferred email may already belong to a user
                // still waiting for confirmation; resume that signup instead of
                // creating a duplicate. A confirmed account is never taken over
                // through an unverified email.
                let pending = unit
                    .find_user_by_email(&ctx.instance_id, &preferred.email, &ctx.audience)
                    .await?;
                match pending {
                    Some(existing) if existing.is_confirmed() => {
                        return Err(ReconcileError::EmailTaken {
                            provider: provider.to_string(),
                            email: preferred.email,
                        });
                    }
                    Some(existing) => (existing, preferred, false),
                    None => {
                        let mut user = User::new(
                            &ctx.instance_id,
                            &preferred.email,
                            &ctx.audience,
                            identity.sparse_metadata(),
                            now,
                        );
                        user.set_provider(provider);
                        (user, preferred, true)
                    }
                }
            }
        };

        if user.is_confirmed() {
            self.audit(unit, ctx, &user, AuditAction::Login, provider, now)
                .await?;
            events_enqueued |= self
                .enqueue(unit, ctx, &user, HookEventKind::Login, now)
                .await?;
        } else if !binding.verified && !self.policy.autoconfirm {
            self.send_confirmation(&mut user, intent, now).await?;
            self.persist(unit, &user, is_new).await?;

            tracing::info!(
                provider,
                user_id = %user.id,
                new_user = is_new,
                "External email unverified, confirmation required"
            );
            return Ok(Decision {
                outcome: CallbackOutcome::PendingConfirmation {
                    user_id: user.id.clone(),
                    email: user.email.clone(),
                },
                email: user.email,
                events_enqueued,
            });
        } else {
            self.audit(unit, ctx, &user, AuditAction::UserSignedUp, provider, now)
                .await?;
            events_enqueued |= self
                .enqueue(unit, ctx, &user, HookEventKind::Signup, now)
                .await?;
            user.confirm(now);
        }

        tracing::info!(provider, user_id = %user.id, new_user = is_new, "External sign-in");
        let tokens = self.issue(unit, &mut user, is_new, now).await?;
        Ok(Decision {
            outcome: CallbackOutcome::Issued(tokens),
            email: user.email,
            events_enqueued,
        })
    }

    /// First existing user reachable through an eligible email, in provider order.
    async fn match_existing(
        &self,
        unit: &mut dyn UnitOfWork,
        ctx: &RequestContext,
        identity: &IdentityAssertion,
    ) -> Result<Option<(User, ProviderEmail)>, ReconcileError> {
        for email in &identity.emails {
            if !email.verified && !self.policy.autoconfirm {
                continue;
            }
            if let Some(user) = unit
                .find_user_by_email(&ctx.instance_id, &email.email, &ctx.audience)
                .await?
            {
                return Ok(Some((user, email.clone())));
            }
        }
        Ok(None)
    }

    async fn send_confirmation(
        &self,
        user: &mut User,
        intent: &StateIntent,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        if within(user.confirmation_sent_at, self.policy.confirmation_interval, now) {
            tracing::info!(user_id = %user.id, "Confirmation mail sent recently, not resending");
            return Ok(());
        }

        user.confirmation_token = Some(secure_token()?);
        user.confirmation_sent_at = Some(now);
        user.updated_at = now;
        self.mailer
            .confirmation_mail(user, intent.referrer.as_deref())
            .await
            .map_err(ReconcileError::Mail)
    }

    async fn persist(
        &self,
        unit: &mut dyn UnitOfWork,
        user: &User,
        is_new: bool,
    ) -> Result<(), StoreError> {
        if is_new {
            unit.insert_user(user).await
        } else {
            unit.update_user(user).await
        }
    }

    async fn issue(
        &self,
        unit: &mut dyn UnitOfWork,
        user: &mut User,
        is_new: bool,
        now: DateTime<Utc>,
    ) -> Result<AccessTokenResponse, ReconcileError> {
        user.last_sign_in_at = Some(now);
        user.updated_at = now;
        self.persist(unit, user, is_new).await?;

        let refresh = RefreshTokenService::grant_in(unit, user).await?;
        self.signer
            .issue(user, &refresh)
            .map_err(ReconcileError::Internal)
    }

    async fn audit(
        &self,
        unit: &mut dyn UnitOfWork,
        ctx: &RequestContext,
        user: &User,
        action: AuditAction,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let entry = AuditLogEntry::new(
            &ctx.instance_id,
            user,
            action,
            Some(AuditLogEntry::provider_traits(provider)),
            now,
        );
        unit.insert_audit_entry(&entry).await
    }

    /// Queue an outbox event if the webhook subscribes to it.
    async fn enqueue(
        &self,
        unit: &mut dyn UnitOfWork,
        ctx: &RequestContext,
        user: &User,
        kind: HookEventKind,
        now: DateTime<Utc>,
    ) -> Result<bool, ReconcileError> {
        if !self.policy.hook_events.contains(&kind) {
            return Ok(false);
        }
        let event = HookEvent::new(&ctx.instance_id, kind, user, now)
            .map_err(|e| ReconcileError::Internal(e.into()))?;
        unit.enqueue_hook_event(&event).await?;
        Ok(true)
    }
}
