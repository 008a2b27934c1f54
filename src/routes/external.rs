// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! External provider redirect and callback routes.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{AppError, Result};
use crate::services::providers::ProviderAdapter;
use crate::services::saml::SamlService;
use crate::services::{CallbackOutcome, StateError, StateIntent};
use crate::AppState;

/// Registry name under which SAML is requested on `/authorize`.
pub const SAML_PROVIDER: &str = "saml";

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/authorize", get(authorize))
        .route("/callback", get(callback))
}

/// 302 to `location`.
pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Where the user goes after a callback: the referrer when it is part of the
/// site, otherwise the configured redirect URL.
pub(crate) fn redirect_target(config: &Config, referrer: Option<&str>) -> String {
    let site = config.site_url.trim_end_matches('/');
    match referrer {
        Some(r) if r == site || r.starts_with(&format!("{}/", site)) => r.to_string(),
        _ => config.external_redirect_url.clone(),
    }
}

/// Turn the outcome of a callback into the redirect back to the client.
pub(crate) fn finish_callback(
    state: &AppState,
    ctx: &RequestContext,
    referrer: Option<&str>,
    result: Result<CallbackOutcome>,
) -> Response {
    let target = redirect_target(&state.config, referrer);
    match result {
        Ok(CallbackOutcome::Issued(tokens)) => {
            found(&format!("{}#{}", target, tokens.to_fragment()))
        }
        Ok(CallbackOutcome::PendingConfirmation { .. }) => found(&target),
        Err(e) => found(&format!(
            "{}#{}",
            target,
            e.redirect_fragment(&ctx.request_id)
        )),
    }
}

/// Query parameters for starting the external flow.
#[derive(Deserialize)]
pub struct AuthorizeParams {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    invite_token: Option<String>,
    /// Where to land afterwards; falls back to the Referer header.
    #[serde(default)]
    redirect_to: Option<String>,
}

enum Destination<'a> {
    OAuth(Arc<dyn ProviderAdapter>),
    Saml(&'a SamlService),
}

/// Start the external flow: redirect to the provider with a signed state.
async fn authorize(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Query(params): Query<AuthorizeParams>,
) -> Result<Response> {
    let provider = params
        .provider
        .as_deref()
        .map(|p| p.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let destination = if provider == SAML_PROVIDER {
        let saml = state
            .saml
            .as_ref()
            .ok_or_else(|| AppError::BadRequest("Unsupported provider: saml".to_string()))?;
        Destination::Saml(saml)
    } else {
        Destination::OAuth(state.providers.get(&provider)?)
    };

    let invite_token = params.invite_token.filter(|t| !t.is_empty());
    if let Some(token) = invite_token.as_deref() {
        let mut unit = state.db.begin().await?;
        let invited = unit.find_user_by_confirmation_token(token).await;
        unit.rollback().await;
        if invited?.is_none() {
            return Err(AppError::NotFound("Invite not found".to_string()));
        }
    }

    let intent = StateIntent {
        provider: provider.clone(),
        invite_token,
        referrer: params
            .redirect_to
            .filter(|r| !r.is_empty())
            .or_else(|| ctx.referrer.clone()),
        site_url: ctx.site_url.clone(),
        instance_id: ctx.instance_id.clone(),
    };
    let state_token = state.state_codec.encode(&intent)?;

    let url = match destination {
        Destination::OAuth(adapter) => adapter.authorize_url(&state_token),
        Destination::Saml(saml) => saml.authorize_url(&state_token).await?,
    };

    tracing::info!(
        provider = %provider,
        request_id = %ctx.request_id,
        "Redirecting to external provider"
    );
    Ok(found(&url))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Provider callback. Always answers with a redirect.
async fn callback(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Query(params): Query<CallbackParams>,
) -> Response {
    let intent = params
        .state
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| state.state_codec.decode_for_instance(s, &ctx.instance_id));
    let referrer = intent
        .as_ref()
        .and_then(|i| i.as_ref().ok())
        .and_then(|i| i.referrer.clone());

    let result = handle_callback(&state, &ctx, params, intent).await;
    finish_callback(&state, &ctx, referrer.as_deref(), result)
}

async fn handle_callback(
    state: &AppState,
    ctx: &RequestContext,
    params: CallbackParams,
    intent: Option<std::result::Result<StateIntent, StateError>>,
) -> Result<CallbackOutcome> {
    if let Some(error) = params.error.filter(|e| !e.is_empty()) {
        return Err(AppError::OAuth {
            error,
            description: params.error_description.unwrap_or_default(),
        });
    }

    let intent =
        intent.ok_or_else(|| AppError::BadRequest("OAuth state parameter missing".to_string()))??;
    if intent.provider == SAML_PROVIDER {
        return Err(AppError::InvalidState(
            "SAML state presented to OAuth callback".to_string(),
        ));
    }

    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::BadRequest("Authorization code missing".to_string()))?;

    let adapter = state.providers.get(&intent.provider)?;
    tracing::debug!(provider = %intent.provider, "Exchanging oauth code");
    let token = adapter.exchange_code(&code).await?;
    let identity = adapter.fetch_identity(&token).await?;

    Ok(state.reconciler.reconcile(ctx, &intent, &identity).await?)
}
