//! Web API router construction.

use axum::{Router, http::StatusCode, routing::get};
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

use crate::state::AppContext;
use crate::web::middleware::request_id::RequestIdLayer;
use crate::web::{query, status};

/// Creates the web server router
pub fn create_router(ctx: AppContext, request_timeout: Duration) -> Router {
    let api_router = Router::new()
        .route("/health", get(status::health))
        .route("/public/query/fuzzy/search", get(query::search))
        .route("/public/query/fuzzy/result", get(query::result))
        .route("/public/data/latest", get(query::latest))
        .with_state(ctx);

    Router::new().nest("/api", api_router).layer((
        // Outermost: per-request ID span + severity-proportional response logging.
        RequestIdLayer,
        TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latest::LatestFeed;
    use crate::query::{CacheAsideCoordinator, CoordinatorSettings};
    use crate::queue::{MemoryQueue, WorkQueue};
    use crate::router::testing::memory_router;
    use crate::search::ShardedSearch;
    use crate::web::middleware::caller_tier::CALLER_TIER_HEADER;
    use crate::worker::{WorkerPool, WorkerSettings};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        ctx: AppContext,
        queue: Arc<MemoryQueue>,
    }

    async fn harness() -> Harness {
        let router = memory_router().await;
        let queue = Arc::new(MemoryQueue::new());
        let settings = CoordinatorSettings {
            cache_ttl: Duration::from_secs(600),
            lock_ttl: Duration::from_secs(5),
            request_ttl: Duration::from_secs(300),
            publish_timeout: Duration::from_secs(1),
        };
        let workers = Arc::new(WorkerPool::new(
            queue.clone(),
            router.clone(),
            Arc::new(ShardedSearch::new(Vec::new(), 50)),
            WorkerSettings {
                concurrency: 2,
                search_timeout: Duration::from_secs(1),
                cache_ttl: Duration::from_secs(600),
                shutdown_timeout: Duration::from_secs(1),
            },
        ));
        let ctx = AppContext {
            coordinator: Arc::new(CacheAsideCoordinator::new(router.clone(), queue.clone(), settings)),
            latest: Arc::new(LatestFeed::new(router.clone(), Duration::from_secs(600))),
            queue: queue.clone(),
            workers,
            service_statuses: router.statuses().clone(),
            router,
        };
        Harness {
            app: create_router(ctx.clone(), Duration::from_secs(5)),
            ctx,
            queue,
        }
    }

    async fn get(app: &Router, uri: &str, tier: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().uri(uri);
        if let Some(tier) = tier {
            request = request.header(CALLER_TIER_HEADER, tier);
        }
        let response = app
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn search_then_poll() {
        let h = harness().await;
        let (status, body) = get(&h.app, "/api/public/query/fuzzy/search?keyword=weather", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["status"], "pending");
        assert_eq!(body["data"]["enqueued"], true);
        assert_eq!(h.queue.len(), 1);

        let poll_url = body["data"]["poll_url"].as_str().unwrap().to_owned();
        let (status, body) = get(&h.app, &poll_url, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"status": "loading", "progress": 70}));
    }

    #[tokio::test]
    async fn privileged_caller_gets_elevated_priority() {
        let h = harness().await;
        get(&h.app, "/api/public/query/fuzzy/search?keyword=vip", Some("privileged")).await;
        let delivery = h.queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(delivery.item.priority, crate::queue::Priority::ELEVATED);
    }

    #[tokio::test]
    async fn missing_or_blank_keyword_is_400() {
        let h = harness().await;
        let (status, body) = get(&h.app, "/api/public/query/fuzzy/search", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
        let (status, _) = get(&h.app, "/api/public/query/fuzzy/search?keyword=%20%20", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_request_is_404() {
        let h = harness().await;
        let id = ulid::Ulid::new();
        let (status, body) =
            get(&h.app, &format!("/api/public/query/fuzzy/result?req_id={id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn malformed_request_id_is_400() {
        let h = harness().await;
        let (status, _) = get(&h.app, "/api/public/query/fuzzy/result?req_id=nope", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn enqueue_failure_is_503() {
        let h = harness().await;
        h.queue.reject_publishes(true);
        let (status, body) = get(&h.app, "/api/public/query/fuzzy/search?keyword=storm", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], 503);
    }

    #[tokio::test]
    async fn latest_feed_roundtrip() {
        let h = harness().await;
        let (status, _) = get(&h.app, "/api/public/data/latest?source=weibo", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        h.ctx
            .latest
            .publish("weibo", &json!({"top": ["storm"]}), chrono::Utc::now())
            .await
            .unwrap();
        let (status, body) = get(&h.app, "/api/public/data/latest?source=weibo", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["top"][0], "storm");
    }

    #[tokio::test]
    async fn health_reports_replicas() {
        let h = harness().await;
        let (status, body) = get(&h.app, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["replicas"], 1);
        assert_eq!(body["degraded_reads"], 0);
        assert_eq!(body["services"]["replicas"], "active");
    }
}
