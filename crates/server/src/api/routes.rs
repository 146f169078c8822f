use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{handlers, middleware::metrics_middleware, orchestrator};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Health and config
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        // Orchestrator
        .route("/status", get(orchestrator::get_status));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::metrics))
        .route_layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use crawlforge_core::testing::{fixtures, TestHarness};
    use crawlforge_core::Config;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn router_without_orchestrator() -> Router {
        create_router(Arc::new(AppState::new(Config::default(), None, None)))
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, json) = get_json(router_without_orchestrator(), "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_config_hides_worker_endpoint() {
        let mut config = Config::default();
        config.worker.endpoint = Some("http://workers.internal:9000".to_string());
        let router = create_router(Arc::new(AppState::new(config, None, None)));

        let (status, json) = get_json(router, "/api/v1/config").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["server"]["port"], 8080);
        assert_eq!(json["worker"]["endpoint_configured"], true);
        assert!(json["worker"].get("endpoint").is_none());
        assert_eq!(json["budget"]["preset"], "local");
    }

    #[tokio::test]
    async fn test_status_without_orchestrator() {
        let (status, json) = get_json(router_without_orchestrator(), "/api/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["available"], false);
        assert!(json.get("status").is_none());
    }

    #[tokio::test]
    async fn test_status_reports_job_counts() {
        let harness = TestHarness::new(fixtures::budget(2, 1 << 20));
        harness
            .orchestrator
            .create_job(fixtures::job_request(1000, 500))
            .unwrap();
        let state = AppState::new(Config::default(), Some(harness.orchestrator.clone()), None);
        let router = create_router(Arc::new(state));

        let (status, json) = get_json(router, "/api/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["available"], true);
        assert_eq!(json["status"]["running"], false);
        assert_eq!(json["status"]["broker"], "mock");
        assert_eq!(json["status"]["jobs_by_status"]["created"], 1);
        assert_eq!(json["status"]["jobs_by_status"]["running"], 0);
        assert_eq!(json["status"]["budget"]["max_concurrent_chunks"], 2);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = router_without_orchestrator()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("crawlforge_orchestrator_running"));
        assert!(text.contains("crawlforge_active_chunks"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let response = router_without_orchestrator()
            .oneshot(Request::builder().uri("/api/v1/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
