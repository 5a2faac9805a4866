use anyhow::Result;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use feed_ocr_node::config::Config;
use feed_ocr_node::metrics;
use feed_ocr_node::mqtt_bridge::MqttTransport;
use feed_ocr_node::transport::inbound_channel;
use feed_ocr_node::{ChannelCompletionHandler, ImageSource, JobOutcome, OcrHandle, Orchestrator, OrchestratorStats};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Serve health, metrics and orchestrator stats
async fn start_metrics_server(bind_addr: String, handle: OcrHandle<String>) -> Result<()> {
    let addr: std::net::SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics bind address: {}", e))?;

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(handle);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Metrics server error: {}", e))
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Prometheus metrics endpoint
async fn metrics_handler() -> String {
    metrics::export_metrics()
}

async fn stats_handler(
    State(handle): State<OcrHandle<String>>,
) -> std::result::Result<Json<OrchestratorStats>, StatusCode> {
    handle
        .stats()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

/// Parse `<src> <width> <height> [post_id]`. The post id defaults to the source.
fn parse_submission(line: &str) -> Option<(ImageSource, String)> {
    let mut parts = line.split_whitespace();
    let src = parts.next()?;
    let width = parts.next()?.parse().ok()?;
    let height = parts.next()?.parse().ok()?;
    let post_id = parts.next().unwrap_or(src).to_string();
    Some((ImageSource::new(src, width, height), post_id))
}

fn outcome_json(outcome: &JobOutcome<String>) -> serde_json::Value {
    let finished_at = chrono::Utc::now().to_rfc3339();
    match outcome {
        JobOutcome::Completed { job_id, text, context } => serde_json::json!({
            "job_id": job_id,
            "post_id": context,
            "status": "complete",
            "text": text,
            "finished_at": finished_at,
        }),
        JobOutcome::Failed { job_id, reason, context } => serde_json::json!({
            "job_id": job_id,
            "post_id": context,
            "status": "failed",
            "reason": reason,
            "finished_at": finished_at,
        }),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries one JSON outcome per line
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info").add_directive("rumqttc=warn".parse()?),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting feed OCR node...");

    let config = Config::load()?;

    metrics::init_metrics();

    // MQTT link to the OCR backend
    let (transport, pump) = MqttTransport::new(&config.mqtt_config);
    let (inbound_tx, inbound_rx) = inbound_channel();
    tokio::spawn(pump.run(inbound_tx));
    tracing::info!(
        "OCR backend via MQTT {}:{} (requests: {}, events: {})",
        config.mqtt_config.broker_host,
        config.mqtt_config.broker_port,
        config.mqtt_config.request_topic,
        config.mqtt_config.event_topic
    );

    let (handler, mut outcomes) = ChannelCompletionHandler::<String>::channel();
    let orchestrator = Orchestrator::new(config.ocr_config.clone(), Arc::new(transport), handler)?;
    let (handle, orchestrator_task) = orchestrator.start(inbound_rx);

    let metrics_handle = handle.clone();
    let metrics_bind = config.metrics_bind.clone();
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_bind, metrics_handle).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(outcome) = outcomes.recv().await {
            println!("{}", outcome_json(&outcome));
        }
    });

    let submitter = handle.clone();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((image, post_id)) = parse_submission(line) else {
                tracing::warn!("Ignoring malformed submission line: {}", line);
                continue;
            };
            match submitter.submit(image, post_id).await {
                Ok(job_id) => tracing::debug!(job_id = %job_id, "Submitted image"),
                Err(e) if e.is_admission_error() => tracing::warn!("Skipping submission: {}", e),
                Err(e) => {
                    tracing::error!("Submission failed: {}", e);
                    break;
                }
            }
        }
        tracing::info!("Submission input closed");
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    reader.abort();
    let _ = handle.shutdown();
    orchestrator_task.await?;
    drop(handle);
    printer.await?;

    Ok(())
}
