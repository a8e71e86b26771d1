// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

const SERVICE_NAME: &str = "outreach-scheduler";

/// Install the JSON log subscriber. `RUST_LOG` wins over `log_level`; spans are
/// exported over OTLP when `tracing_endpoint` is set.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Flush remaining spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize the Prometheus exporter and describe the outreach metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "outreach_steps_dispatched_total",
        "Total number of sequence steps delivered to the channel"
    );
    describe_counter!(
        "outreach_step_failures_total",
        "Total number of step attempts left pending after a failure"
    );
    describe_counter!(
        "outreach_advance_conflicts_total",
        "Total number of advances lost to a concurrent writer"
    );
    describe_counter!(
        "outreach_enrollments_completed_total",
        "Total number of enrollments that reached the end of their sequence"
    );
    describe_counter!(
        "outreach_generations_total",
        "Total number of generated documents persisted"
    );
    describe_histogram!(
        "outreach_tick_duration_seconds",
        "Duration of scheduler ticks in seconds"
    );
    describe_gauge!(
        "outreach_active_enrollments",
        "Active enrollments seen by the last tick"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_step_dispatched(trigger: &str, kind: &str) {
    counter!(
        "outreach_steps_dispatched_total",
        "trigger" => trigger.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_step_failure(trigger: &str, reason: &str) {
    counter!(
        "outreach_step_failures_total",
        "trigger" => trigger.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_advance_conflict(trigger: &str) {
    counter!("outreach_advance_conflicts_total", "trigger" => trigger.to_string()).increment(1);
}

#[inline]
pub fn record_enrollment_completed(trigger: &str) {
    counter!("outreach_enrollments_completed_total", "trigger" => trigger.to_string()).increment(1);
}

#[inline]
pub fn record_generation() {
    counter!("outreach_generations_total").increment(1);
}

#[inline]
pub fn record_tick_duration(duration_seconds: f64) {
    histogram!("outreach_tick_duration_seconds").record(duration_seconds);
}

#[inline]
pub fn update_active_enrollments(count: usize) {
    gauge!("outreach_active_enrollments").set(count as f64);
}

/// Notified when an enrollment keeps failing tick after tick
#[async_trait::async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn send_alert(
        &self,
        subject_id: &Uuid,
        trigger: &str,
        consecutive_failures: u32,
        last_error: &str,
    ) -> Result<()>;
}

/// Returns true once consecutive_failures reaches 3
#[inline]
pub fn should_trigger_alert(consecutive_failures: u32) -> bool {
    consecutive_failures >= 3
}

/// Log-based alert notifier (default implementation)
pub struct LogAlertNotifier;

#[async_trait::async_trait]
impl AlertNotifier for LogAlertNotifier {
    #[tracing::instrument(skip(self))]
    async fn send_alert(
        &self,
        subject_id: &Uuid,
        trigger: &str,
        consecutive_failures: u32,
        last_error: &str,
    ) -> Result<()> {
        tracing::error!(
            subject_id = %subject_id,
            trigger = trigger,
            consecutive_failures = consecutive_failures,
            last_error = last_error,
            alert_type = "consecutive_failures",
            "ALERT: Enrollment step has failed {} consecutive times",
            consecutive_failures
        );
        Ok(())
    }
}
