mod app;
mod consumer;

use std::sync::Arc;

use clap::Parser;
use svcmetrics_common::{CallContext, MetricsConfig};
use svcmetrics_messaging::{InMemoryBroker, instrument_publisher, instrument_subscriber};
use svcmetrics_registry::MetricRegistry;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::AppState;

const DEFAULT_SERVICE: &str = "svcmetrics";

#[derive(Parser)]
#[command(name = "svcmetrics", about = "Metrics-instrumented HTTP and messaging service")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value = "9464")]
    port: u16,

    /// Metric name prefix; overrides SVCMETRICS_SERVICE.
    #[arg(long)]
    service: Option<String>,

    #[arg(long)]
    metrics_path: Option<String>,

    #[arg(long)]
    runtime_metrics: Option<bool>,

    #[arg(long, default_value_t = false)]
    disable_metrics: bool,

    /// Topic consumed by the background subscriber.
    #[arg(long, default_value = "events")]
    topic: String,

    /// Extra topics accepted by `POST /topics/{topic}`; the consumed topic is always accepted.
    #[arg(long = "publish-topic")]
    publish_topics: Vec<String>,
}

impl Cli {
    fn metrics_config(&self) -> MetricsConfig {
        let mut config =
            MetricsConfig::from_env().unwrap_or_else(|| MetricsConfig::new(DEFAULT_SERVICE));

        if let Some(service) = &self.service {
            config.service_identity = service.clone();
        }
        if let Some(path) = &self.metrics_path {
            config.exposition_path = path.clone();
        }
        if let Some(runtime) = self.runtime_metrics {
            config.include_runtime_metrics = runtime;
        }
        if self.disable_metrics {
            config.enabled = false;
        }
        config
    }

    fn publish_topics(&self) -> Vec<String> {
        let mut topics = self.publish_topics.clone();
        topics.push(self.topic.clone());
        topics
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::from_default_env().add_directive("svcmetrics=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let addr = format!("{}:{}", cli.host, cli.port);
    let config = cli.metrics_config();
    let registry = MetricRegistry::from_config(&config)?;

    let broker = Arc::new(InMemoryBroker::new());
    let publisher = instrument_publisher(registry.as_deref(), broker.clone())?;
    let subscriber = instrument_subscriber(registry.as_deref(), broker)?;

    let root = CallContext::new();
    let consumer = consumer::spawn(subscriber.as_ref(), &root, &cli.topic).await?;

    let app = app::router(
        AppState::new(Arc::clone(&publisher), root.clone(), cli.publish_topics()),
        registry.as_deref(),
        &config,
    )?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        path = %config.exposition_path,
        metrics = config.enabled,
        "svcmetrics server listening on {addr}"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(root.clone()))
        .await?;

    publisher.close().await?;
    let handled = consumer.await?;
    info!(handled, "svcmetrics server stopped");

    Ok(())
}

async fn shutdown_signal(root: CallContext) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c, shutdown only on process exit");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    root.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "svcmetrics",
            "--service",
            "checkout",
            "--metrics-path",
            "/internal/metrics",
            "--runtime-metrics",
            "false",
        ]);
        let config = cli.metrics_config();

        assert_eq!(config.service_identity, "checkout");
        assert_eq!(config.exposition_path, "/internal/metrics");
        assert!(!config.include_runtime_metrics);
        assert!(config.enabled);
        assert_eq!(cli.topic, "events");
        assert_eq!(cli.publish_topics(), ["events"]);
    }

    #[test]
    fn publish_topics_include_the_consumed_topic() {
        let cli = Cli::parse_from([
            "svcmetrics",
            "--topic",
            "orders",
            "--publish-topic",
            "audit",
            "--publish-topic",
            "billing",
        ]);
        assert_eq!(cli.publish_topics(), ["audit", "billing", "orders"]);
    }

    #[test]
    fn disable_flag_wins() {
        let cli = Cli::parse_from(["svcmetrics", "--service", "checkout", "--disable-metrics"]);
        assert!(!cli.metrics_config().enabled);
    }
}
