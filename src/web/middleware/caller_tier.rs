//! Caller tier extraction from the gateway-set `X-Caller-Tier` header.
//!
//! Authentication happens upstream; the gateway forwards its verdict as
//! `anonymous`, `authenticated` or `privileged`. A missing or unknown value
//! is treated as anonymous.
//!
//! ```ignore
//! async fn handler(Tier(tier): Tier, ...) -> impl IntoResponse { ... }
//! ```

use crate::query::CallerTier;
use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use std::convert::Infallible;

pub const CALLER_TIER_HEADER: &str = "x-caller-tier";

/// The resolved caller tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier(pub CallerTier);

impl<S: Send + Sync> FromRequestParts<S> for Tier {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Tier(tier_from_headers(&parts.headers)))
    }
}

pub fn tier_from_headers(headers: &HeaderMap) -> CallerTier {
    let Some(value) = headers
        .get(CALLER_TIER_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return CallerTier::Anonymous;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "privileged" | "vip" => CallerTier::Privileged,
        "authenticated" => CallerTier::Authenticated,
        _ => CallerTier::Anonymous,
    }
}
