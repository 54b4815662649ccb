//! Flows.
//!
//! A [`Flow`] is the unit callers hand envelopes to: a chain bound to a
//! [`ProcessingStrategy`], an [`ExceptionStrategy`], and optionally a
//! redelivery [`RetryPolicy`] and a [`DeadLetterQueue`].
//!
//! # Failure handling
//!
//! A chain error never escapes [`Flow::process`]. After any redeliveries the
//! failure goes to the exception strategy, and:
//!
//! - request-response callers receive whatever the strategy returns, usually
//!   the envelope with an [`ErrorInfo`](courier_core::envelope::ErrorInfo)
//!   attached
//! - one-way callers receive [`FlowResponse::Void`]; the failure is only
//!   visible through the strategy's side channel (logs, dead letters)
//!
//! # Example
//!
//! ```
//! use courier_core::chain::ProcessorChainBuilder;
//! use courier_core::envelope::Envelope;
//! use courier_core::processor::Transformer;
//! use courier_runtime::{Flow, ProcessingStrategy};
//!
//! # tokio_test::block_on(async {
//! let chain = ProcessorChainBuilder::named("greet")
//!     .chain(Transformer::new("hello", |e: Envelope| Ok(e.with_payload("hello"))));
//! let flow = Flow::builder("greetings", chain)
//!     .processing_strategy(ProcessingStrategy::NonBlocking)
//!     .build()
//!     .unwrap();
//!
//! let response = flow.process(Envelope::new("hi")).await.unwrap();
//! assert_eq!(response.envelope().unwrap().payload().as_text(), Some("hello"));
//! # });
//! ```

use crate::config::FlowConfig;
use crate::dead_letter::{DELIVERY_ATTEMPTS_PROPERTY, DeadLetterExceptionStrategy, DeadLetterQueue};
use crate::error::FlowError;
use crate::metrics::FlowMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use crate::strategy::{ProcessingStrategy, ScheduledChain};
use crate::{HealthCheck, HealthReport};
use courier_core::chain::{ChainStatistics, ProcessorChainBuilder, ProcessorLookup};
use courier_core::connector::Connector;
use courier_core::envelope::Envelope;
use courier_core::error::{ChainBuildError, ProcessorError};
use courier_core::exception::{ExceptionStrategy, LoggingExceptionStrategy, handle_safely};
use courier_core::exchange::ExchangePattern;
use courier_core::processor::Outcome;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// What a flow hands back to its caller
#[derive(Debug, Clone, PartialEq)]
pub enum FlowResponse {
    /// The chain's result, or the exception strategy's response
    Reply(Envelope),
    /// No response: one-way exchange, a void chain result, or a suppressed
    /// failure
    Void,
    /// A processor stopped the chain (filter non-match)
    Filtered,
}

impl FlowResponse {
    /// The reply envelope, if any
    #[must_use]
    pub const fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Reply(envelope) => Some(envelope),
            Self::Void | Self::Filtered => None,
        }
    }

    /// Take the reply envelope, if any
    #[must_use]
    pub fn into_envelope(self) -> Option<Envelope> {
        match self {
            Self::Reply(envelope) => Some(envelope),
            Self::Void | Self::Filtered => None,
        }
    }

    /// Check if there is no response
    #[must_use]
    pub const fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Check if the chain was stopped
    #[must_use]
    pub const fn is_filtered(&self) -> bool {
        matches!(self, Self::Filtered)
    }

    /// Check if the reply carries an error description
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.envelope().is_some_and(Envelope::is_failure)
    }
}

/// Flow-level counters
#[derive(Debug, Default)]
pub struct FlowStatistics {
    received: AtomicU64,
    failures: AtomicU64,
    redeliveries: AtomicU64,
}

impl FlowStatistics {
    /// Envelopes accepted by the flow
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Envelopes handed to the exception strategy
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Redelivery attempts made
    #[must_use]
    pub fn redeliveries(&self) -> u64 {
        self.redeliveries.load(Ordering::Relaxed)
    }
}

struct FlowInner {
    name: String,
    chain: ScheduledChain,
    exception_strategy: Arc<dyn ExceptionStrategy>,
    exchange_pattern: Option<ExchangePattern>,
    redelivery: Option<RetryPolicy>,
    dead_letters: Option<DeadLetterQueue>,
    shutdown: AtomicBool,
    in_flight: AtomicUsize,
    stats: FlowStatistics,
}

/// A scheduled chain with failure handling.
///
/// Cheap to clone; clones share the chain, counters and shutdown state.
#[derive(Clone)]
pub struct Flow {
    inner: Arc<FlowInner>,
}

impl Flow {
    /// Start building a flow named `name` around `chain`
    #[must_use]
    pub fn builder(name: impl Into<String>, chain: ProcessorChainBuilder) -> FlowBuilder {
        FlowBuilder::new(name, chain)
    }

    /// Flow name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The scheduled chain
    #[must_use]
    pub fn chain(&self) -> &ScheduledChain {
        &self.inner.chain
    }

    /// Chain counters
    #[must_use]
    pub fn chain_statistics(&self) -> Arc<ChainStatistics> {
        self.inner.chain.chain().statistics()
    }

    /// Flow counters
    #[must_use]
    pub fn statistics(&self) -> &FlowStatistics {
        &self.inner.stats
    }

    /// The dead letter queue, when configured
    #[must_use]
    pub fn dead_letters(&self) -> Option<&DeadLetterQueue> {
        self.inner.dead_letters.as_ref()
    }

    /// Envelopes accepted but not finished
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Check if [`shutdown`](Self::shutdown) was called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Process one envelope.
    ///
    /// One-way envelopes on an asynchronous flow are handed to the worker
    /// pool and `Void` is returned straight away.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::ShutdownInProgress`] once the flow is shutting
    /// down. Processing failures are not errors; see the module docs.
    #[tracing::instrument(skip(self, envelope), name = "flow_process", fields(flow = %self.inner.name, envelope = %envelope.id()))]
    pub async fn process(&self, envelope: Envelope) -> Result<FlowResponse, FlowError> {
        if self.is_shutting_down() {
            tracing::warn!("Rejecting envelope, flow is shutting down");
            return Err(FlowError::ShutdownInProgress);
        }
        self.inner.stats.received.fetch_add(1, Ordering::Relaxed);

        let envelope = match self.inner.exchange_pattern {
            Some(pattern) if pattern != envelope.exchange_pattern() => envelope.with_exchange_pattern(pattern),
            _ => envelope,
        };
        let one_way = !envelope.exchange_pattern().has_response();
        let guard = InFlight::enter(&self.inner);

        if one_way && self.inner.chain.strategy().is_asynchronous() {
            let flow = self.clone();
            tokio::spawn(async move {
                let _guard = guard;
                let response = flow.run(envelope).await;
                tracing::trace!(flow = %flow.name(), ?response, "One-way envelope finished");
            });
            return Ok(FlowResponse::Void);
        }

        let response = self.run(envelope).await;
        drop(guard);

        if one_way {
            return Ok(FlowResponse::Void);
        }
        Ok(response)
    }

    /// Poll `connector` for one envelope and process it.
    ///
    /// Returns `Ok(None)` if nothing arrived within `timeout`.
    ///
    /// # Errors
    ///
    /// - [`FlowError::Poll`] if the connector cannot be polled
    /// - [`FlowError::TaskJoin`] if the polling task failed
    /// - [`FlowError::ShutdownInProgress`] once the flow is shutting down
    #[tracing::instrument(skip(self, connector), name = "flow_poll", fields(flow = %self.inner.name, connector = %connector.name()))]
    pub async fn poll(
        &self,
        connector: Arc<dyn Connector>,
        timeout: Duration,
    ) -> Result<Option<FlowResponse>, FlowError> {
        if self.is_shutting_down() {
            return Err(FlowError::ShutdownInProgress);
        }

        let received = tokio::task::spawn_blocking(move || connector.request(timeout)).await??;
        match received {
            Some(envelope) => Ok(Some(self.process(envelope).await?)),
            None => Ok(None),
        }
    }

    /// Stop accepting envelopes and wait for in-flight ones to finish.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::ShutdownTimeout`] with the number of envelopes
    /// still in flight when `timeout` elapses.
    #[tracing::instrument(skip(self), name = "flow_shutdown", fields(flow = %self.inner.name))]
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), FlowError> {
        tracing::info!("Initiating graceful shutdown");
        self.inner.shutdown.store(true, Ordering::Release);

        let start = Instant::now();
        let poll_interval = Duration::from_millis(100).min(timeout.max(Duration::from_millis(1)));

        loop {
            let pending = self.in_flight();
            if pending == 0 {
                tracing::info!("All envelopes finished, shutdown complete");
                return Ok(());
            }

            if start.elapsed() >= timeout {
                tracing::error!(pending, "Shutdown timed out");
                return Err(FlowError::ShutdownTimeout(pending));
            }

            tracing::debug!(pending, elapsed_ms = start.elapsed().as_millis(), "Waiting for in-flight envelopes");
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Health of the flow.
    ///
    /// The dead letter queue, when configured, is degraded above half full
    /// and unhealthy when full. A flow that is shutting down is unhealthy.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let flow = if self.is_shutting_down() {
            HealthCheck::unhealthy(self.name(), "shutting down")
        } else {
            HealthCheck::healthy(self.name())
        };
        let mut checks = vec![flow.with_metadata("in_flight", self.in_flight().to_string())];

        if let Some(dlq) = &self.inner.dead_letters {
            checks.push(dead_letter_check(&format!("{}.dead_letters", self.name()), dlq));
        }

        HealthReport::new(checks)
    }

    async fn run(&self, envelope: Envelope) -> FlowResponse {
        let start = Instant::now();
        let result = self.execute(&envelope).await;
        FlowMetrics::record_duration(self.name(), self.inner.chain.strategy().name(), start.elapsed());

        match result {
            Ok(Outcome::Event(reply)) => FlowResponse::Reply(reply),
            Ok(Outcome::Void) => FlowResponse::Void,
            Ok(Outcome::Stop) => FlowResponse::Filtered,
            Err((error, attempts)) => self.fail(envelope, &error, attempts),
        }
    }

    async fn execute(&self, envelope: &Envelope) -> Result<Outcome, (ProcessorError, u32)> {
        let chain = &self.inner.chain;
        let Some(policy) = &self.inner.redelivery else {
            return chain.execute(envelope.clone()).await.map_err(|error| (error, 1));
        };

        let attempt = AtomicU64::new(0);
        retry_with_predicate(
            policy,
            move || {
                if attempt.fetch_add(1, Ordering::Relaxed) > 0 {
                    self.inner.stats.redeliveries.fetch_add(1, Ordering::Relaxed);
                }
                chain.execute(envelope.clone())
            },
            is_redeliverable,
        )
        .await
        .map_err(|exhausted| (exhausted.error, exhausted.attempts))
    }

    fn fail(&self, envelope: Envelope, error: &ProcessorError, attempts: u32) -> FlowResponse {
        self.inner.stats.failures.fetch_add(1, Ordering::Relaxed);
        FlowMetrics::record_failure(self.name(), error.kind());
        tracing::debug!(error = %error, attempts, "Handing failure to exception strategy");

        let envelope = if self.inner.redelivery.is_some() {
            envelope.with_property(DELIVERY_ATTEMPTS_PROPERTY, attempts)
        } else {
            envelope
        };

        match handle_safely(self.inner.exception_strategy.as_ref(), envelope, error) {
            Some(response) => FlowResponse::Reply(response),
            None => FlowResponse::Void,
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.inner.name)
            .field("strategy", &self.inner.chain.strategy().name())
            .field("exception_strategy", &self.inner.exception_strategy.name())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Aggregation failures discard their group, so re-running would open a new
/// one; everything else is worth another attempt.
const fn is_redeliverable(error: &ProcessorError) -> bool {
    !matches!(error, ProcessorError::Correlation(_))
}

#[allow(clippy::cast_precision_loss)]
fn dead_letter_check(component: &str, dlq: &DeadLetterQueue) -> HealthCheck {
    let size = dlq.len();
    let capacity = dlq.max_size();
    let usage = if capacity == 0 {
        100.0
    } else {
        size as f64 / capacity as f64 * 100.0
    };

    let check = if size >= capacity {
        HealthCheck::unhealthy(component, format!("dead letter queue full ({size}/{capacity})"))
    } else if usage > 50.0 {
        HealthCheck::degraded(component, format!("dead letter queue above 50% ({size}/{capacity})"))
    } else {
        HealthCheck::healthy(component)
    };

    check
        .with_metadata("dlq_size", size.to_string())
        .with_metadata("dlq_capacity", capacity.to_string())
        .with_metadata("dlq_usage_pct", format!("{usage:.1}"))
}

struct InFlight(Arc<FlowInner>);

impl InFlight {
    fn enter(inner: &Arc<FlowInner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(inner))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Builder for [`Flow`]
pub struct FlowBuilder {
    name: String,
    chain: ProcessorChainBuilder,
    strategy: ProcessingStrategy,
    exception_strategy: Option<Arc<dyn ExceptionStrategy>>,
    exchange_pattern: Option<ExchangePattern>,
    redelivery: Option<RetryPolicy>,
    dead_letters: Option<DeadLetterQueue>,
}

impl FlowBuilder {
    /// Start a builder
    #[must_use]
    pub fn new(name: impl Into<String>, chain: ProcessorChainBuilder) -> Self {
        Self {
            name: name.into(),
            chain,
            strategy: ProcessingStrategy::default(),
            exception_strategy: None,
            exchange_pattern: None,
            redelivery: None,
            dead_letters: None,
        }
    }

    /// Start a builder from configuration
    #[must_use]
    pub fn from_config(name: impl Into<String>, chain: ProcessorChainBuilder, config: &FlowConfig) -> Self {
        let mut builder = Self::new(name, chain).processing_strategy(config.processing_strategy());
        builder.exchange_pattern = config.exchange_pattern;
        builder.redelivery = config.redelivery();
        if let Some(max_size) = config.dlq_max_size {
            builder = builder.dead_letter_queue(DeadLetterQueue::new(max_size));
        }
        builder
    }

    /// Set the scheduling policy
    #[must_use]
    pub fn processing_strategy(mut self, strategy: ProcessingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the exception strategy (default: [`LoggingExceptionStrategy`]).
    ///
    /// Replaces a strategy installed by
    /// [`dead_letter_queue`](Self::dead_letter_queue); the queue is still
    /// reported by [`Flow::health`].
    #[must_use]
    pub fn exception_strategy(mut self, strategy: Arc<dyn ExceptionStrategy>) -> Self {
        self.exception_strategy = Some(strategy);
        self
    }

    /// Stamp every inbound envelope with `pattern`
    #[must_use]
    pub const fn exchange_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.exchange_pattern = Some(pattern);
        self
    }

    /// Re-run failed chains under `policy` before giving up
    #[must_use]
    pub const fn redelivery(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = Some(policy);
        self
    }

    /// Park failures in `queue` using a [`DeadLetterExceptionStrategy`]
    #[must_use]
    pub fn dead_letter_queue(mut self, queue: DeadLetterQueue) -> Self {
        self.exception_strategy = Some(Arc::new(DeadLetterExceptionStrategy::new(self.name.clone(), queue.clone())));
        self.dead_letters = Some(queue);
        self
    }

    /// Build the flow.
    ///
    /// # Errors
    ///
    /// Returns [`ChainBuildError`] if the chain holds unresolved references.
    pub fn build(mut self) -> Result<Flow, ChainBuildError> {
        let chain = std::mem::take(&mut self.chain);
        let scheduled = self.strategy.configure(chain)?;
        Ok(self.finish(scheduled))
    }

    /// Build the flow, resolving processor references through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainBuildError::UnknownProcessor`] for unresolvable names.
    pub fn build_with(mut self, lookup: &dyn ProcessorLookup) -> Result<Flow, ChainBuildError> {
        let chain = std::mem::take(&mut self.chain);
        let scheduled = self.strategy.configure_with(chain, lookup)?;
        Ok(self.finish(scheduled))
    }

    fn finish(self, chain: ScheduledChain) -> Flow {
        let exception_strategy = self
            .exception_strategy
            .unwrap_or_else(|| Arc::new(LoggingExceptionStrategy));

        tracing::info!(
            flow = %self.name,
            strategy = self.strategy.name(),
            exception_strategy = %exception_strategy.name(),
            redelivery = self.redelivery.map_or(0, |p| p.retries()),
            "Flow built"
        );

        Flow {
            inner: Arc::new(FlowInner {
                name: self.name,
                chain,
                exception_strategy,
                exchange_pattern: self.exchange_pattern,
                redelivery: self.redelivery,
                dead_letters: self.dead_letters,
                shutdown: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                stats: FlowStatistics::default(),
            }),
        }
    }
}

impl fmt::Debug for FlowBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowBuilder")
            .field("name", &self.name)
            .field("chain", &self.chain)
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}
