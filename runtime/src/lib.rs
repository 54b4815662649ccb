//! # Courier Runtime
//!
//! Imperative shell around the pure engine in `courier-core`.
//!
//! The core crate knows how to walk a chain and how to correlate envelopes.
//! This crate decides *where* and *when* that work runs and what happens when
//! it fails:
//!
//! - **Processing strategies**: run a chain on the caller's thread, on a
//!   bounded worker pool, or cooperatively between steps
//! - **Flows**: a chain bound to an exception strategy, a scheduling policy
//!   and an optional redelivery policy
//! - **Dead letters**: bounded storage for envelopes that could not be
//!   processed
//! - **Timeout monitor**: background task that evicts stale correlation groups
//! - **Configuration, tracing and metrics** bootstrap
//!
//! ## Example
//!
//! ```ignore
//! use courier_core::chain::ProcessorChainBuilder;
//! use courier_runtime::{Flow, ProcessingStrategy};
//!
//! let flow = Flow::builder("quotes", ProcessorChainBuilder::new().chain(enrich).chain(bank))
//!     .processing_strategy(ProcessingStrategy::NonBlocking)
//!     .build()?;
//!
//! let response = flow.process(envelope).await?;
//! ```

/// TOML configuration
pub mod config;

/// Bounded storage for envelopes that failed processing
pub mod dead_letter;

/// Flows: chains with scheduling, redelivery and exception handling
pub mod flow;

/// Prometheus metrics for observability
pub mod metrics;

/// Background correlation timeout handling and async replies
pub mod monitor;

/// Bounded pool for blocking chain work
pub mod pool;

/// Retry logic with exponential backoff
pub mod retry;

/// Chain-global scheduling policies
pub mod strategy;

/// Tracing subscriber bootstrap
pub mod telemetry;

pub use config::{EngineConfig, FlowConfig, ObservabilityConfig};
pub use dead_letter::{DeadLetter, DeadLetterExceptionStrategy, DeadLetterQueue};
pub use error::FlowError;
pub use flow::{Flow, FlowBuilder, FlowResponse, FlowStatistics};
pub use monitor::{TimeoutMonitor, await_aggregate, spawn_timeout_monitor};
pub use pool::WorkerPool;
pub use retry::RetryPolicy;
pub use strategy::{ProcessingStrategy, ScheduledChain};

/// Error types for the flow runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur while running flows
    #[derive(Error, Debug)]
    pub enum FlowError {
        /// The flow is shutting down and not accepting new envelopes
        #[error("Flow is shutting down")]
        ShutdownInProgress,

        /// A worker task failed to join
        ///
        /// This typically means a spawned task was cancelled.
        #[error("Worker task failed: {0}")]
        TaskJoin(#[from] tokio::task::JoinError),

        /// Shutdown timed out waiting for in-flight work
        #[error("Shutdown timed out with {0} envelopes still in flight")]
        ShutdownTimeout(usize),

        /// Timeout waiting for an aggregate
        #[error("Timeout waiting for aggregate")]
        Timeout,

        /// The reply channel closed before a result arrived
        ///
        /// The group was discarded, failed, or the correlator was dropped.
        #[error("Reply channel closed")]
        ChannelClosed,

        /// An inbound connector could not be polled
        #[error(transparent)]
        Poll(#[from] courier_core::error::RoutingError),
    }
}

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component works but needs attention (e.g. dead letters piling up)
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is degraded
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// The more severe of two statuses
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one component
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Component name
    pub component: String,

    /// Current status
    pub status: HealthStatus,

    /// Optional human-readable detail
    pub message: Option<String>,

    /// Extra key/value context (sizes, thresholds)
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    fn with_status(component: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message,
            metadata: Vec::new(),
        }
    }

    /// Create a healthy check
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Healthy, None)
    }

    /// Create a degraded check
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Degraded, Some(message.into()))
    }

    /// Create an unhealthy check
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Attach a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Look up a metadata value
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Aggregated health of several components
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// When the report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Create a report from checks
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Check if every component is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Check if the worst component is degraded
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.status.is_degraded()
    }

    /// Check if any component is unhealthy
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.status.is_unhealthy()
    }
}
