use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::Response,
    routing::get,
};
use svcmetrics_common::config::{DEFAULT_EXPOSITION_PATH, MetricsConfig};
use svcmetrics_registry::{MetricRegistry, RegistryExport, exposition::CONTENT_TYPE};

const DISABLED_BODY: &str = "metrics disabled\n";

/// Scrape endpoint. Without a registry every request gets `503 Service Unavailable`, so a
/// scraper can tell "disabled" apart from "nothing recorded yet".
#[derive(Clone)]
pub struct ExpositionHandler {
    export: Option<RegistryExport>,
    path: String,
}

impl ExpositionHandler {
    pub fn new(registry: Option<&MetricRegistry>, path: impl Into<String>) -> Self {
        Self {
            export: registry.map(MetricRegistry::export),
            path: path.into(),
        }
    }

    pub fn from_config(registry: Option<&MetricRegistry>, config: &MetricsConfig) -> Self {
        Self::new(registry, config.exposition_path.clone())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.export.is_some()
    }

    pub fn respond(&self) -> Response {
        let Some(export) = &self.export else {
            return plain_response(
                StatusCode::SERVICE_UNAVAILABLE,
                DISABLED_BODY.to_string(),
                "text/plain; charset=utf-8",
            );
        };

        plain_response(StatusCode::OK, export.render(), CONTENT_TYPE)
    }

    /// A router serving `GET {path}`; merge it into the service router.
    pub fn router<S>(self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let path = self.path.clone();
        Router::new()
            .route(&path, get(serve_metrics))
            .with_state(Arc::new(self))
    }
}

impl Default for ExpositionHandler {
    fn default() -> Self {
        Self::new(None, DEFAULT_EXPOSITION_PATH)
    }
}

async fn serve_metrics(State(handler): State<Arc<ExpositionHandler>>) -> Response {
    handler.respond()
}

fn plain_response(status: StatusCode, payload: String, content_type: &'static str) -> Response {
    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use svcmetrics_registry::RegistryOptions;
    use tower::ServiceExt;

    use super::*;

    fn registry() -> MetricRegistry {
        MetricRegistry::with_options(
            "orders",
            RegistryOptions {
                version: "0.9.0".to_string(),
                include_runtime_metrics: true,
            },
        )
        .unwrap()
    }

    async fn scrape(router: Router, uri: &str) -> (StatusCode, String, Option<String>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap(), content_type)
    }

    #[tokio::test]
    async fn enabled_endpoint_serves_full_registry() {
        let registry = registry();
        let requests = registry
            .counter_with_labels("requests_total", "Total requests", &["method", "status"])
            .unwrap();
        requests.inc_one(&["GET", "200"]);

        let router = ExpositionHandler::new(Some(&registry), "/metrics").router();
        let (status, body, content_type) = scrape(router, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(CONTENT_TYPE));
        assert!(
            body.lines()
                .any(|line| line == "orders_requests_total{method=\"GET\",status=\"200\"} 1")
        );
        assert!(body.contains("orders_build_info{version=\"0.9.0\"} 1"));
        assert!(body.contains("# TYPE orders_process_resident_memory_bytes gauge"));
        assert!(body.contains("# TYPE orders_runtime_workers gauge"));
    }

    #[tokio::test]
    async fn fresh_registry_is_ok_not_unavailable() {
        let registry = registry();
        let router = ExpositionHandler::new(Some(&registry), "/metrics").router();
        let (status, _, _) = scrape(router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn disabled_endpoint_returns_503() {
        let handler = ExpositionHandler::default();
        assert!(!handler.is_enabled());

        for _ in 0..3 {
            let (status, body, _) = scrape(handler.clone().router(), "/metrics").await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(body, DISABLED_BODY);
        }
    }

    #[tokio::test]
    async fn custom_path_is_honoured() {
        let registry = registry();
        let mut config = MetricsConfig::new("orders");
        config.exposition_path = "/internal/metrics".to_string();
        let handler = ExpositionHandler::from_config(Some(&registry), &config);
        assert_eq!(handler.path(), "/internal/metrics");

        let (status, _, _) = scrape(handler.clone().router(), "/internal/metrics").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = scrape(handler.router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
