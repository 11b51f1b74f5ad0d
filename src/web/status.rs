//! Health handler.

use axum::extract::State;
use axum::response::Json;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::trace;

use crate::state::{AppContext, ServiceStatus};

#[derive(Serialize)]
pub struct HealthResponse {
    status: ServiceStatus,
    version: &'static str,
    commit: &'static str,
    timestamp: String,
    services: BTreeMap<String, ServiceStatus>,
    replicas: usize,
    degraded_reads: u64,
    jobs_in_flight: usize,
}

/// `GET /api/health`
pub(super) async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    trace!("health check requested");
    Json(HealthResponse {
        status: ctx.service_statuses.overall(),
        version: env!("CARGO_PKG_VERSION"),
        commit: env!("GIT_COMMIT_SHORT"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        services: ctx.service_statuses.all().into_iter().collect(),
        replicas: ctx.router.replica_count().await,
        degraded_reads: ctx.router.degraded_reads(),
        jobs_in_flight: ctx.workers.in_flight(),
    })
}
