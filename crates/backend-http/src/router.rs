use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use backend_common::error::Result;
use backend_metrics::{Clock, HttpMetrics, MetricsRegistry, ProcessMetrics, SystemClock};

use crate::{handlers, middleware::track_request_duration};

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Identity used by external monitoring to discover this service.
    pub app_name: String,
    /// Prefix for the default process metrics.
    pub metrics_prefix: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "backend".to_string(),
            metrics_prefix: "backend_".to_string(),
        }
    }
}

pub struct AppState {
    pub config: AppConfig,
    pub registry: Arc<MetricsRegistry>,
    pub http_metrics: Arc<HttpMetrics>,
    pub process_metrics: Arc<ProcessMetrics>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let registry = Arc::new(MetricsRegistry::new());
        let process_metrics = Arc::new(ProcessMetrics::register(
            registry.as_ref(),
            &config.metrics_prefix,
        )?);
        let http_metrics = Arc::new(HttpMetrics::register(registry.as_ref(), clock)?);

        Ok(Self {
            config,
            registry,
            http_metrics,
            process_metrics,
        })
    }
}

pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/metrics", get(handlers::metrics::prometheus_metrics))
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            track_request_duration,
        ))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode, header},
    };
    use backend_metrics::{HistogramSnapshot, PROMETHEUS_CONTENT_TYPE};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::{AppConfig, AppState, app_router};
    use crate::handlers::health::HEALTHY_BODY;

    fn test_app() -> (Arc<AppState>, Router) {
        let state = Arc::new(AppState::new(AppConfig::default()).unwrap());
        let app = app_router(Arc::clone(&state));
        (state, app)
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn snapshot(state: &AppState, labels: [&str; 3]) -> Option<HistogramSnapshot> {
        state
            .http_metrics
            .request_duration_seconds()
            .snapshot(&labels)
    }

    #[tokio::test]
    async fn health_returns_fixed_body() {
        let (state, app) = test_app();

        let response = app.oneshot(request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, HEALTHY_BODY);

        let recorded = snapshot(&state, ["GET", "/health", "200"]).unwrap();
        assert_eq!(recorded.count, 1);
        assert!(recorded.sum >= 0.0);
    }

    #[tokio::test]
    async fn health_is_recorded_after_its_body_is_delivered() {
        let (state, app) = test_app();

        let response = app.oneshot(request("GET", "/health")).await.unwrap();
        assert!(snapshot(&state, ["GET", "/health", "200"]).is_none());

        assert_eq!(body_text(response).await, HEALTHY_BODY);
        assert_eq!(snapshot(&state, ["GET", "/health", "200"]).unwrap().count, 1);
    }

    #[tokio::test]
    async fn repeated_health_checks_are_identical_and_counted() {
        let (state, app) = test_app();

        for _ in 0..5 {
            let response = app.clone().oneshot(request("GET", "/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, "Backend is healthy");
        }

        assert_eq!(snapshot(&state, ["GET", "/health", "200"]).unwrap().count, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_lose_no_updates() {
        let (state, app) = test_app();

        let handles = (0..64)
            .map(|_| {
                let app = app.clone();
                tokio::spawn(async move { app.oneshot(request("GET", "/health")).await })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, HEALTHY_BODY);
        }

        assert_eq!(snapshot(&state, ["GET", "/health", "200"]).unwrap().count, 64);
    }

    #[tokio::test]
    async fn unmatched_paths_are_measured_by_raw_path() {
        let (state, app) = test_app();

        let response = app.oneshot(request("GET", "/does/not/exist")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "Not Found");

        assert_eq!(
            snapshot(&state, ["GET", "/does/not/exist", "404"]).unwrap().count,
            1
        );
    }

    #[tokio::test]
    async fn wrong_method_is_measured_against_the_route() {
        let (state, app) = test_app();

        let response = app.oneshot(request("POST", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        assert_eq!(snapshot(&state, ["POST", "/health", "405"]).unwrap().count, 1);
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_histogram_and_process_metrics() {
        let (state, app) = test_app();

        let response = app.clone().oneshot(request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, HEALTHY_BODY);

        let response = app.clone().oneshot(request("GET", "/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some(PROMETHEUS_CONTENT_TYPE)
        );

        let body = body_text(response).await;
        assert!(body.contains("# HELP http_request_duration_seconds Duration of HTTP requests in seconds"));
        assert!(body.contains("# TYPE http_request_duration_seconds histogram"));
        assert!(body.contains(
            "http_request_duration_seconds_count{method=\"GET\",route=\"/health\",status_code=\"200\"} 1"
        ));
        assert!(body.contains(
            "http_request_duration_seconds_bucket{method=\"GET\",route=\"/health\",status_code=\"200\",le=\"+Inf\"} 1"
        ));
        assert!(body.contains("# TYPE backend_process_start_time_seconds gauge"));
        assert!(body.contains("# TYPE backend_uptime_seconds gauge"));
        assert!(body.contains("# TYPE backend_process_cpu_seconds_total counter"));

        // The scrape itself is recorded once its body has been read.
        assert_eq!(snapshot(&state, ["GET", "/metrics", "200"]).unwrap().count, 1);

        let body = body_text(app.oneshot(request("GET", "/metrics")).await.unwrap()).await;
        assert!(body.contains(
            "http_request_duration_seconds_count{method=\"GET\",route=\"/metrics\",status_code=\"200\"} 1"
        ));
    }

    #[tokio::test]
    async fn states_do_not_share_registries() {
        let (first, first_app) = test_app();
        let (second, _) = test_app();

        let response = first_app.oneshot(request("GET", "/health")).await.unwrap();
        body_text(response).await;

        assert!(snapshot(&first, ["GET", "/health", "200"]).is_some());
        assert!(snapshot(&second, ["GET", "/health", "200"]).is_none());
        assert_eq!(second.config.app_name, "backend");
    }
}
