use std::{collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use svcmetrics_common::{CallContext, MetricsConfig, MetricsError};
use svcmetrics_http::{ExpositionHandler, HttpMetricsLayer};
use svcmetrics_messaging::{Message, MessagingError, Publisher};
use svcmetrics_registry::MetricRegistry;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    publisher: Arc<dyn Publisher>,
    root: CallContext,
    topics: Arc<HashSet<String>>,
}

impl AppState {
    /// Only `topics` are accepted by `POST /topics/{topic}`; the topic becomes a metric label.
    pub fn new<I, T>(publisher: Arc<dyn Publisher>, root: CallContext, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            publisher,
            root,
            topics: Arc::new(topics.into_iter().map(Into::into).collect()),
        }
    }
}

pub struct ApiError(pub MessagingError);

impl From<MessagingError> for ApiError {
    fn from(value: MessagingError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.0 {
            MessagingError::Metrics(_) | MessagingError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            MessagingError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };

        (
            status,
            Json(serde_json::json!({
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

/// Service routes are instrumented; the exposition route is merged in after the metrics layer
/// so scrapes are not counted as traffic.
pub fn router(
    state: AppState,
    registry: Option<&MetricRegistry>,
    config: &MetricsConfig,
) -> Result<Router, MetricsError> {
    let service = Router::new()
        .route("/health/live", get(live))
        .route("/topics/{topic}", post(publish))
        .route_layer(HttpMetricsLayer::new(registry)?)
        .with_state(state);

    Ok(service
        .merge(ExpositionHandler::from_config(registry, config).router())
        .layer(TraceLayer::new_for_http()))
}

async fn live() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn publish(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Result<axum::response::Response, ApiError> {
    if !state.topics.contains(&topic) {
        debug!(topic = %topic, "publish to unknown topic rejected");
        return Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "message": format!("unknown topic {topic}") })),
        )
            .into_response());
    }

    let message = Message::new(body);
    let id = message.id.clone();

    let ctx = state.root.child();
    if let Err(err) = state.publisher.publish(&ctx, &topic, message).await {
        warn!(topic = %topic, error = %err, "publish failed");
        return Err(err.into());
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": id, "topic": topic })),
    )
        .into_response())
}
