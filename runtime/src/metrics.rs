//! Prometheus metrics for observability and monitoring.
//!
//! Engine components record through the `metrics` facade; this module
//! installs the Prometheus recorder and describes every metric the engine
//! emits:
//! - Chain outcomes and errors
//! - Flow latency, failures and redeliveries
//! - Correlator groups, aggregations, evictions and late arrivals
//! - Dead letter queue size
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use crate::config::ObservabilityConfig;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors from metrics operations
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
    /// The HTTP listener needs a Tokio runtime to run on
    #[error("Metrics server must be started inside a Tokio runtime")]
    NoRuntime,
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
    exporter: Option<JoinHandle<()>>,
}

impl MetricsServer {
    /// Create a server for `addr`
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            handle: None,
            exporter: None,
        }
    }

    /// Server for the configured `metrics_addr`, or `None` when metrics are
    /// not exposed
    #[must_use]
    pub fn from_config(config: &ObservabilityConfig) -> Option<Self> {
        config.metrics_addr.map(Self::new)
    }

    /// Scrape address
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Describe all metrics, install the Prometheus recorder and start
    /// serving `/metrics` on [`addr`](Self::addr).
    ///
    /// If a recorder is already installed (several servers in one test
    /// binary), this logs a warning, serves nothing and leaves
    /// [`handle`](Self::handle) empty.
    ///
    /// # Errors
    ///
    /// Returns an error if called outside a Tokio runtime, or if the exporter
    /// cannot be built (including when the address cannot be bound) or
    /// installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| MetricsError::NoRuntime)?;

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                register_metrics();
                let addr = self.addr;
                self.exporter = Some(runtime.spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!(%addr, "Metrics server stopped");
                    }
                }));
                self.handle = Some(handle);
                tracing::info!("Metrics server started - available at http://{}/metrics", self.addr);
                Ok(())
            },
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            },
        }
    }

    /// Whether this server is serving the HTTP endpoint
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.exporter.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Prometheus handle, once started
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in the Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        if let Some(exporter) = self.exporter.take() {
            exporter.abort();
        }
    }
}

fn register_metrics() {
    describe_counter!(
        "courier_chain_processed_total",
        "Chain runs that completed, by outcome (event, void, stop)"
    );
    describe_counter!("courier_chain_errors_total", "Chain runs aborted by a processor error, by kind");

    describe_histogram!("courier_flow_duration_seconds", "Time spent processing one envelope in a flow");
    describe_counter!("courier_flow_failures_total", "Envelopes handed to a flow's exception strategy");
    describe_counter!("courier_redelivery_attempts_total", "Redelivery attempts after a failure");
    describe_counter!("courier_redelivery_successes_total", "Envelopes that succeeded after redelivery");
    describe_counter!("courier_redelivery_exhausted_total", "Envelopes that failed every redelivery");

    describe_gauge!("courier_correlator_groups_active", "Correlation groups still collecting members");
    describe_counter!("courier_correlator_aggregations_total", "Groups aggregated successfully");
    describe_counter!("courier_correlator_aggregation_failures_total", "Groups whose aggregation failed");
    describe_counter!("courier_correlator_evictions_total", "Groups evicted on timeout, by policy");
    describe_counter!(
        "courier_correlator_late_arrivals_total",
        "Envelopes that arrived after their group was aggregated"
    );

    describe_gauge!("courier_dlq_size", "Entries currently in the dead letter queue");
    describe_counter!("courier_dlq_pushed_total", "Entries added to the dead letter queue");
    describe_counter!("courier_dlq_dropped_total", "Entries dropped because the dead letter queue was full");
}

/// Flow metrics recorder
pub struct FlowMetrics;

impl FlowMetrics {
    /// Record one processed envelope
    pub fn record_duration(flow: &str, strategy: &'static str, duration: Duration) {
        metrics::histogram!(
            "courier_flow_duration_seconds",
            "flow" => flow.to_string(),
            "strategy" => strategy
        )
        .record(duration.as_secs_f64());
    }

    /// Record an envelope handed to the exception strategy
    pub fn record_failure(flow: &str, kind: &'static str) {
        metrics::counter!("courier_flow_failures_total", "flow" => flow.to_string(), "kind" => kind).increment(1);
    }
}
