// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the application.

pub mod audit;
pub mod hook;
pub mod identity;
pub mod refresh_token;
pub mod user;

pub use audit::{AuditAction, AuditLogEntry};
pub use hook::{HookEvent, HookEventKind};
pub use identity::{IdentityAssertion, ProviderEmail};
pub use refresh_token::{AccessTokenResponse, RefreshToken};
pub use user::User;
