//! Recording exception strategies and instrumented aggregators.

use courier_core::aggregation::AggregationStrategy;
use courier_core::correlation::EventGroup;
use courier_core::envelope::Envelope;
use courier_core::error::{ProcessorError, StrategyError};
use courier_core::exception::{ExceptionStrategy, mark_failed};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Exception strategy that remembers every failure it handled
#[derive(Debug, Default)]
pub struct RecordingExceptionStrategy {
    handled: Mutex<Vec<(Envelope, ProcessorError)>>,
    suppress: bool,
}

impl RecordingExceptionStrategy {
    /// Record failures and return the marked envelope
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record failures and suppress the response
    #[must_use]
    pub fn suppressing() -> Self {
        Self {
            suppress: true,
            ..Self::default()
        }
    }

    /// Failures handled so far
    #[must_use]
    pub fn handled(&self) -> Vec<(Envelope, ProcessorError)> {
        self.handled.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of failures handled so far
    #[must_use]
    pub fn count(&self) -> usize {
        self.handled.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Error categories handled so far, in order
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        self.handled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, error)| error.kind())
            .collect()
    }
}

impl ExceptionStrategy for RecordingExceptionStrategy {
    fn handle(&self, envelope: Envelope, error: &ProcessorError) -> Option<Envelope> {
        let marked = mark_failed(&envelope, error);
        self.handled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((envelope, error.clone()));
        (!self.suppress).then_some(marked)
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Aggregator that always fails
#[derive(Debug, Clone, Default)]
pub struct FailingAggregator {
    reason: String,
}

impl FailingAggregator {
    /// Fail with `reason`
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl AggregationStrategy for FailingAggregator {
    fn aggregate(&self, _group: &EventGroup) -> Result<Envelope, StrategyError> {
        Err(StrategyError::Failed(self.reason.clone()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Wraps a strategy and counts how often it is invoked
#[derive(Debug, Default)]
pub struct CountingAggregator<S> {
    inner: S,
    calls: AtomicUsize,
    sizes: Mutex<Vec<usize>>,
}

impl<S: AggregationStrategy> CountingAggregator<S> {
    /// Count invocations of `inner`
    pub const fn new(inner: S) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            sizes: Mutex::new(Vec::new()),
        }
    }

    /// Number of invocations so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Group sizes seen, in invocation order
    #[must_use]
    pub fn group_sizes(&self) -> Vec<usize> {
        self.sizes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl<S: AggregationStrategy> AggregationStrategy for CountingAggregator<S> {
    fn aggregate(&self, group: &EventGroup) -> Result<Envelope, StrategyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(group.len());
        self.inner.aggregate(group)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
