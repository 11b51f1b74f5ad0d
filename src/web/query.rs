//! Public query endpoints: submit, poll and the latest feed.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;

use crate::query::{PollOutcome, SubmitOutcome};
use crate::state::AppContext;
use crate::web::error::{ApiError, Envelope};
use crate::web::middleware::caller_tier::Tier;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    keyword: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResultParams {
    req_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LatestParams {
    source: Option<String>,
}

/// `GET /api/public/query/fuzzy/search?keyword=`
///
/// 200 with the cached payload, or 202 with a request id to poll.
pub(super) async fn search(
    State(ctx): State<AppContext>,
    Tier(tier): Tier,
    Query(params): Query<SearchParams>,
) -> Result<Response, ApiError> {
    let keyword = params
        .keyword
        .ok_or_else(|| ApiError::bad_request("keyword is required"))?;

    let outcome = ctx.coordinator.submit(&keyword, tier).await?;
    debug!(?tier, ready = matches!(outcome, SubmitOutcome::Ready { .. }), "query submitted");
    let response = match outcome {
        SubmitOutcome::Ready { .. } => Envelope::ok("served from cache", outcome).into_response(),
        SubmitOutcome::Pending { .. } => {
            (StatusCode::ACCEPTED, Envelope::ok("query accepted, poll for the result", outcome))
                .into_response()
        }
    };
    Ok(response)
}

/// `GET /api/public/query/fuzzy/result?req_id=`
pub(super) async fn result(
    State(ctx): State<AppContext>,
    Query(params): Query<ResultParams>,
) -> Result<Response, ApiError> {
    let req_id = params
        .req_id
        .ok_or_else(|| ApiError::bad_request("req_id is required"))?;

    let outcome = ctx.coordinator.poll(&req_id).await?;
    let message = match &outcome {
        PollOutcome::NotFound => {
            return Err(ApiError::not_found("request not found or expired"));
        }
        PollOutcome::Pending { .. } => "query queued",
        PollOutcome::Loading { .. } => "query running",
        PollOutcome::Ready { .. } => "query complete",
        PollOutcome::Failed { .. } => "query failed",
    };
    Ok(Envelope::ok(message, outcome).into_response())
}

/// `GET /api/public/data/latest?source=`
pub(super) async fn latest(
    State(ctx): State<AppContext>,
    Query(params): Query<LatestParams>,
) -> Result<Response, ApiError> {
    let source = params
        .source
        .ok_or_else(|| ApiError::bad_request("source is required"))?;
    let data = ctx.latest.latest(&source).await?;
    Ok(Envelope::ok("ok", data).into_response())
}
