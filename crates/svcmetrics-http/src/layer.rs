//! HTTP request instrumentation as a tower layer.
//!
//! Install it with `Router::route_layer` so axum's [`MatchedPath`] is available; the route
//! template is used as the `route` label to keep cardinality bounded. A request that carries
//! neither a `MatchedPath` nor a [`CallMetadata`] extension is forwarded without recording.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Instant,
};

use axum::extract::MatchedPath;
use http::{Request, Response, StatusCode};
use pin_project_lite::pin_project;
use svcmetrics_common::{context::CallMetadata, error::Result};
use svcmetrics_registry::MetricRegistry;
use tower::{Layer, Service};
use tracing::trace;

use crate::observation::{RecorderNames, RequestObservation, RequestRecorder};

pub struct HttpRequestMetrics {
    recorder: RequestRecorder,
}

impl HttpRequestMetrics {
    pub fn register(registry: &MetricRegistry) -> Result<Self> {
        Ok(Self {
            recorder: RequestRecorder::register(
                registry,
                RecorderNames {
                    counter: "http_requests_total",
                    counter_help: "Total number of HTTP requests",
                    histogram: "http_request_duration_seconds",
                    histogram_help: "Duration of HTTP requests in seconds",
                    labels: ["method", "route", "status"],
                },
            )?,
        })
    }

    pub fn record(&self, observation: &RequestObservation<'_>) {
        self.recorder.record(
            [observation.method, observation.route, observation.outcome],
            observation.duration,
        );
    }
}

/// Chosen once at construction: with no registry the layer only forwards.
#[derive(Clone)]
pub struct HttpMetricsLayer {
    metrics: Option<Arc<HttpRequestMetrics>>,
}

impl HttpMetricsLayer {
    pub fn new(registry: Option<&MetricRegistry>) -> Result<Self> {
        let metrics = registry
            .map(HttpRequestMetrics::register)
            .transpose()?
            .map(Arc::new);
        Ok(Self { metrics })
    }

    pub fn is_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

impl<S> Layer<S> for HttpMetricsLayer {
    type Service = HttpMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpMetricsService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Clone)]
pub struct HttpMetricsService<S> {
    inner: S,
    metrics: Option<Arc<HttpRequestMetrics>>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for HttpMetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let pending = self.metrics.as_ref().and_then(|metrics| {
            let started_at = Instant::now();
            let route = route_template(&request)?;
            Some(PendingObservation {
                metrics: Arc::clone(metrics),
                method: request.method().as_str().to_string(),
                route,
                started_at,
            })
        });

        ResponseFuture {
            inner: self.inner.call(request),
            pending,
        }
    }
}

fn route_template<B>(request: &Request<B>) -> Option<String> {
    let extensions = request.extensions();
    if let Some(matched) = extensions.get::<MatchedPath>() {
        return Some(matched.as_str().to_string());
    }

    let route = extensions
        .get::<CallMetadata>()
        .map(|metadata| metadata.operation.clone());
    if route.is_none() {
        trace!(uri = %request.uri(), "no route template, request not recorded");
    }
    route
}

struct PendingObservation {
    metrics: Arc<HttpRequestMetrics>,
    method: String,
    route: String,
    started_at: Instant,
}

impl PendingObservation {
    fn finish(self, status: StatusCode) {
        self.metrics.record(&RequestObservation {
            method: &self.method,
            route: &self.route,
            outcome: status.as_str(),
            duration: self.started_at.elapsed(),
        });
    }
}

pin_project! {
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        pending: Option<PendingObservation>,
    }
}

impl<F, ResBody, E> Future for ResponseFuture<F>
where
    F: Future<Output = std::result::Result<Response<ResBody>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));

        if let Some(pending) = this.pending.take() {
            let status = match &result {
                Ok(response) => response.status(),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            pending.finish(status);
        }

        Poll::Ready(result)
    }
}
