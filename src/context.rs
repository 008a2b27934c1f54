// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-request context passed explicitly through the federation pipeline.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, HeaderMap};

use crate::AppState;

/// Header that selects the audience for users and tokens.
pub const AUDIENCE_HEADER: &str = "x-jwt-aud";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Caller-supplied or generated; doubles as the opaque error ID.
    pub request_id: String,
    pub instance_id: String,
    pub site_url: String,
    pub audience: String,
    pub referrer: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap, state: &AppState) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            request_id: header(REQUEST_ID_HEADER)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            instance_id: state.config.instance_id.clone(),
            site_url: state.config.site_url.clone(),
            audience: header(AUDIENCE_HEADER).unwrap_or_else(|| state.config.jwt_aud.clone()),
            referrer: header(header::REFERER.as_str()),
        }
    }
}

impl FromRequestParts<Arc<AppState>> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers, state))
    }
}
