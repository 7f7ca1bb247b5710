//! Prometheus metrics for Argus.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `argus_http_requests_total` | Counter | `route`, `status` | Completed HTTP requests |
//! | `argus_active_connections` | Gauge | - | Open TCP connections |
//! | `argus_ws_clients` | Gauge | - | Open WebSocket clients |
//! | `argus_ws_broadcast_delivered_total` | Counter | `topic` | Successful broadcast deliveries |
//! | `argus_pool_jobs_total` | Counter | `outcome` | Worker pool jobs by outcome |
//! | `argus_proxy_rejections_total` | Counter | - | Proxy calls refused by admission |
//!
//! Recording before [`init_metrics`] ran is a no-op.

use std::net::SocketAddr;
use std::sync::OnceLock;

use ::metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};

use crate::error::TelemetryError;
use crate::TelemetryResult;

/// Global metrics handle for rendering.
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Whether the exporter is installed.
    pub enabled: bool,

    /// Address of the scrape listener.
    pub addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: "127.0.0.1:9464".to_string(),
        }
    }
}

/// How a worker pool job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Ran to completion.
    Completed,
    /// Panicked; the worker survived.
    Panicked,
    /// Discarded at shutdown without running.
    Dropped,
    /// Refused because the queue was full.
    Rejected,
}

impl JobOutcome {
    /// Label value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Panicked => "panicked",
            Self::Dropped => "dropped",
            Self::Rejected => "rejected",
        }
    }
}

/// Installs the Prometheus recorder and its HTTP listener.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidAddress`] for a bad listener address
/// and [`TelemetryError::MetricsInit`] if a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .addr
        .parse()
        .map_err(|e| TelemetryError::InvalidAddress(format!("{}: {e}", config.addr)))?;

    // `build` binds the listener and must run inside a runtime context.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (recorder, exporter) = {
        let _context = runtime.enter();
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .build()
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?
    };

    let handle = recorder.handle();
    ::metrics::set_global_recorder(recorder)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    let _ = METRICS_HANDLE.set(handle);

    std::thread::Builder::new()
        .name("argus-metrics".to_string())
        .spawn(move || {
            if let Err(e) = runtime.block_on(exporter) {
                tracing::error!(error = ?e, "prometheus exporter stopped");
            }
        })?;

    describe_metrics();
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}

/// Renders metrics in Prometheus text format, if the recorder is installed.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn describe_metrics() {
    describe_counter!("argus_http_requests_total", "Completed HTTP requests");
    describe_gauge!("argus_active_connections", "Open TCP connections");
    describe_gauge!("argus_ws_clients", "Open WebSocket clients");
    describe_counter!(
        "argus_ws_broadcast_delivered_total",
        "Broadcast messages delivered to subscribers"
    );
    describe_counter!("argus_pool_jobs_total", "Worker pool jobs by outcome");
    describe_counter!(
        "argus_proxy_rejections_total",
        "Companion proxy calls refused by the admission limiter"
    );
}

/// Records a completed HTTP request.
pub fn record_http_request(route: &str, status: u16) {
    counter!(
        "argus_http_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Sets the open-connection gauge.
pub fn set_active_connections(count: usize) {
    gauge!("argus_active_connections").set(count as f64);
}

/// Sets the WebSocket client gauge.
pub fn set_ws_clients(count: usize) {
    gauge!("argus_ws_clients").set(count as f64);
}

/// Records successful deliveries of one broadcast.
pub fn record_broadcast_delivered(topic: &str, delivered: usize) {
    counter!(
        "argus_ws_broadcast_delivered_total",
        "topic" => topic.to_string()
    )
    .increment(delivered as u64);
}

/// Records a worker pool job outcome.
pub fn record_pool_job(outcome: JobOutcome) {
    counter!("argus_pool_jobs_total", "outcome" => outcome.as_str()).increment(1);
}

/// Records a proxy call refused by admission.
pub fn record_proxy_rejection() {
    counter!("argus_proxy_rejections_total").increment(1);
}
