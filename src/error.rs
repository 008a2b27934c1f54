// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types with consistent API responses.
//!
//! JSON endpoints render an [`AppError`] as a JSON body. The federation
//! endpoints render it as a redirect fragment through
//! [`AppError::redirect_fragment`]. Both go through [`AppError::public_message`],
//! so internal detail never reaches the caller.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::db::StoreError;
use crate::services::{ProviderError, ReconcileError, SamlError, StateError, TokenError};

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    /// Error reported by the provider itself on the callback.
    #[error("OAuth error {error}: {description}")]
    OAuth { error: String, description: String },

    #[error("Invalid OAuth state: {0}")]
    InvalidState(String),

    #[error("Invalid SAML assertion: {0}")]
    InvalidAssertion(String),

    #[error("{message}: {detail}")]
    Provider {
        message: &'static str,
        detail: String,
    },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// OAuth2 error code for an HTTP status.
pub fn oauth_error_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "invalid_request",
        StatusCode::UNAUTHORIZED => "unauthorized_client",
        StatusCode::FORBIDDEN => "access_denied",
        StatusCode::SERVICE_UNAVAILABLE => "temporarily_unavailable",
        _ => "server_error",
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_)
            | AppError::InvalidGrant(_)
            | AppError::UnsupportedGrantType(_)
            | AppError::OAuth { .. }
            | AppError::InvalidState(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) | AppError::InvalidAssertion(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Provider { .. } | AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn oauth_code(&self) -> &str {
        match self {
            AppError::OAuth { error, .. } => error,
            AppError::InvalidGrant(_) => "invalid_grant",
            AppError::UnsupportedGrantType(_) => "unsupported_grant_type",
            other => oauth_error_code(other.status()),
        }
    }

    /// Message safe to show to the caller.
    pub fn public_message(&self) -> String {
        match self {
            AppError::BadRequest(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::InvalidGrant(msg)
            | AppError::UnsupportedGrantType(msg) => msg.clone(),
            AppError::OAuth { description, .. } => description.clone(),
            AppError::InvalidState(_) => "OAuth state is invalid".to_string(),
            AppError::InvalidAssertion(_) => "SAML assertion is invalid".to_string(),
            AppError::Provider { message, .. } => message.to_string(),
            AppError::Unavailable(_) => "Service temporarily unavailable".to_string(),
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    fn log(&self, error_id: Option<&str>) {
        let error_id = error_id.unwrap_or("");
        match self {
            AppError::InvalidState(_) | AppError::InvalidAssertion(_) => {
                tracing::warn!(error = %self, error_id, "Rejected federation request");
            }
            e if e.status().is_server_error() => {
                tracing::error!(error = %e, error_id, "Request failed");
            }
            e => tracing::info!(error = %e, error_id, "Request rejected"),
        }
    }

    /// URL fragment for a redirect back to the client. Server errors carry
    /// `error_id` so they can be found in the logs.
    pub fn redirect_fragment(&self, error_id: &str) -> String {
        self.log(Some(error_id));

        let mut fragment = format!(
            "error={}&error_description={}",
            urlencoding::encode(self.oauth_code()),
            urlencoding::encode(&self.public_message())
        );
        if self.status().is_server_error() {
            fragment.push_str("&error_id=");
            fragment.push_str(&urlencoding::encode(error_id));
        }
        fragment
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.log(None);

        let status = self.status();
        let details = if status.is_server_error() {
            None
        } else {
            Some(self.public_message())
        };
        let body = ErrorResponse {
            error: self.oauth_code().to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<StateError> for AppError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Signing(msg) => AppError::Internal(anyhow::anyhow!(msg)),
            other => AppError::InvalidState(other.to_string()),
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Unsupported(_) => AppError::BadRequest(e.to_string()),
            ProviderError::ExchangeFailed { .. } => AppError::Provider {
                message: "Unable to exchange external code",
                detail: e.to_string(),
            },
            ProviderError::IdentityFetchFailed { .. } => AppError::Provider {
                message: "Error getting user email from external provider",
                detail: e.to_string(),
            },
        }
    }
}

impl From<SamlError> for AppError {
    fn from(e: SamlError) -> Self {
        match e {
            SamlError::Metadata(_) => AppError::Unavailable(e.to_string()),
            other => AppError::InvalidAssertion(other.to_string()),
        }
    }
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::TokenNotFound => AppError::InvalidGrant("Invalid Refresh Token".to_string()),
            TokenError::Store(e) => e.into(),
            TokenError::Random => AppError::Internal(anyhow::anyhow!(e.to_string())),
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::InviteNotFound => AppError::NotFound(e.to_string()),
            ReconcileError::InvitedEmailMismatch { ref invited, ref external } => {
                tracing::info!(invited = %invited, external = ?external, "Invite email mismatch");
                AppError::BadRequest(e.to_string())
            }
            ReconcileError::SignupsDisabled { ref provider, ref email } => {
                tracing::info!(provider = %provider, email = %email, "Signup refused");
                AppError::Forbidden(e.to_string())
            }
            ReconcileError::EmailTaken { ref provider, ref email } => {
                tracing::info!(provider = %provider, email = %email, "Unverified email of a confirmed user");
                AppError::BadRequest(e.to_string())
            }
            ReconcileError::IdentityFetchFailed { .. } => AppError::Provider {
                message: "Error getting user email from external provider",
                detail: e.to_string(),
            },
            ReconcileError::Token(e) => e.into(),
            ReconcileError::Store(e) => e.into(),
            ReconcileError::Conflict { .. } | ReconcileError::Mail(_) | ReconcileError::Internal(_) => {
                AppError::Internal(anyhow::anyhow!(e.to_string()))
            }
        }
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
