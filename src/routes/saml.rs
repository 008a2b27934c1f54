// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! SAML assertion consumer and SP metadata routes.

use axum::{
    extract::{Form, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::{AppError, Result};
use crate::routes::external::{finish_callback, SAML_PROVIDER};
use crate::services::{CallbackOutcome, StateError, StateIntent};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/saml/acs", post(acs))
        .route("/saml/metadata", get(metadata))
}

/// HTTP-POST binding form.
#[derive(Deserialize)]
pub struct AcsForm {
    #[serde(rename = "RelayState", default)]
    relay_state: Option<String>,
    #[serde(rename = "SAMLResponse", default)]
    saml_response: Option<String>,
}

async fn acs(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Form(form): Form<AcsForm>,
) -> Response {
    let intent = form
        .relay_state
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| state.state_codec.decode_for_instance(s, &ctx.instance_id));
    let referrer = intent
        .as_ref()
        .and_then(|i| i.as_ref().ok())
        .and_then(|i| i.referrer.clone());

    let result = handle_acs(&state, &ctx, form.saml_response, intent).await;
    finish_callback(&state, &ctx, referrer.as_deref(), result)
}

async fn handle_acs(
    state: &AppState,
    ctx: &RequestContext,
    saml_response: Option<String>,
    intent: Option<std::result::Result<StateIntent, StateError>>,
) -> Result<CallbackOutcome> {
    let saml = state
        .saml
        .as_ref()
        .ok_or_else(|| AppError::NotFound("SAML is not configured".to_string()))?;

    let intent =
        intent.ok_or_else(|| AppError::BadRequest("OAuth state parameter missing".to_string()))??;
    if intent.provider != SAML_PROVIDER {
        return Err(AppError::InvalidState(format!(
            "state for provider {} presented to SAML ACS",
            intent.provider
        )));
    }

    let raw = saml_response
        .filter(|r| !r.is_empty())
        .ok_or_else(|| AppError::BadRequest("SAMLResponse missing".to_string()))?;
    let identity = saml.verify_response(&raw).await?;

    Ok(state.reconciler.reconcile(ctx, &intent, &identity).await?)
}

/// SP metadata for configuring the IdP.
async fn metadata(State(state): State<Arc<AppState>>) -> Result<Response> {
    let saml = state
        .saml
        .as_ref()
        .ok_or_else(|| AppError::NotFound("SAML is not configured".to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, "application/xml")],
        saml.sp_metadata_xml(),
    )
        .into_response())
}
