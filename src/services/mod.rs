// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod hooks;
pub mod mailer;
pub mod providers;
pub mod reconciler;
pub mod refresh_tokens;
pub mod saml;
pub mod state_token;
pub mod xmldsig;

pub use hooks::{HookDispatcher, HookNotifier};
pub use mailer::{LogMailer, Mailer};
pub use providers::{ProviderAdapter, ProviderError, ProviderRegistry};
pub use reconciler::{CallbackOutcome, CallbackReconciler, ReconcileError, SignupPolicy};
pub use refresh_tokens::{RefreshTokenService, TokenError};
pub use saml::{SamlError, SamlService};
pub use state_token::{StateError, StateIntent, StateTokenCodec};
pub use xmldsig::X509SignatureVerifier;
