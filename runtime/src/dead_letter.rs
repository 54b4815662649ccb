//! Dead-letter storage.
//!
//! Envelopes that a flow could not process (after any redelivery attempts)
//! can be parked in a [`DeadLetterQueue`] for inspection or manual replay.
//! [`DeadLetterExceptionStrategy`] is the exception strategy that does the
//! parking.
//!
//! # Example
//!
//! ```
//! use courier_core::envelope::Envelope;
//! use courier_core::error::ProcessorError;
//! use courier_core::exception::ExceptionStrategy;
//! use courier_runtime::dead_letter::{DeadLetterExceptionStrategy, DeadLetterQueue};
//!
//! let dlq = DeadLetterQueue::new(100);
//! let strategy = DeadLetterExceptionStrategy::new("quotes", dlq.clone());
//!
//! let error = ProcessorError::transform("enrich", "bad input");
//! let response = strategy.handle(Envelope::new("q"), &error).unwrap();
//!
//! assert!(response.is_failure());
//! assert_eq!(dlq.len(), 1);
//! assert_eq!(dlq.peek().unwrap().flow, "quotes");
//! ```

use chrono::{DateTime, Utc};
use courier_core::envelope::{Envelope, ErrorInfo};
use courier_core::error::ProcessorError;
use courier_core::exception::{ExceptionStrategy, mark_failed};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Outbound property a flow sets to the number of delivery attempts made
pub const DELIVERY_ATTEMPTS_PROPERTY: &str = "courier.delivery_attempts";

/// Default capacity of a [`DeadLetterQueue`]
pub const DEFAULT_DLQ_CAPACITY: usize = 1000;

/// A failed envelope and what went wrong
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The envelope as it was handed to the exception strategy
    pub envelope: Envelope,

    /// The failure
    pub error: ErrorInfo,

    /// Flow that gave up on the envelope
    pub flow: String,

    /// Delivery attempts made before giving up
    pub attempts: u32,

    /// When the envelope was parked
    pub failed_at: DateTime<Utc>,
}

/// Bounded FIFO of [`DeadLetter`]s.
///
/// When full, the oldest entry is dropped to make room. Clones share the same
/// storage.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    queue: Arc<Mutex<VecDeque<DeadLetter>>>,
    max_size: usize,
}

impl DeadLetterQueue {
    /// Create a queue holding at most `max_size` entries
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Park an entry, dropping the oldest one if the queue is full
    pub fn push(&self, letter: DeadLetter) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if self.max_size == 0 {
            metrics::counter!("courier_dlq_dropped_total", "flow" => letter.flow.clone()).increment(1);
            tracing::warn!(flow = %letter.flow, envelope = %letter.envelope.id(), "DLQ has no capacity, dropping entry");
            return;
        }

        if queue.len() >= self.max_size {
            if let Some(dropped) = queue.pop_front() {
                metrics::counter!("courier_dlq_dropped_total", "flow" => dropped.flow.clone()).increment(1);
                tracing::warn!(
                    max_size = self.max_size,
                    dropped = %dropped.envelope.id(),
                    "DLQ at capacity, dropping oldest entry"
                );
            }
        }

        tracing::warn!(
            flow = %letter.flow,
            envelope = %letter.envelope.id(),
            attempts = letter.attempts,
            error = %letter.error,
            queue_size = queue.len() + 1,
            "Envelope added to dead letter queue"
        );
        metrics::counter!("courier_dlq_pushed_total", "flow" => letter.flow.clone()).increment(1);
        queue.push_back(letter);

        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("courier_dlq_size").set(queue.len() as f64);
    }

    /// Number of parked entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if nothing is parked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the next push will drop an entry
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.max_size
    }

    /// Remove and return every entry, oldest first
    pub fn drain(&self) -> Vec<DeadLetter> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();

        metrics::gauge!("courier_dlq_size").set(0.0);
        tracing::info!(count = entries.len(), "Drained dead letter queue");

        entries
    }

    /// The oldest entry, without removing it
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetter> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .cloned()
    }

    /// Capacity
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(DEFAULT_DLQ_CAPACITY)
    }
}

/// Parks failed envelopes in a [`DeadLetterQueue`].
///
/// The attempt count is read from [`DELIVERY_ATTEMPTS_PROPERTY`] when the
/// flow set it, otherwise it is 1. The response is the failed envelope with
/// its error attached.
#[derive(Debug, Clone)]
pub struct DeadLetterExceptionStrategy {
    flow: String,
    queue: DeadLetterQueue,
}

impl DeadLetterExceptionStrategy {
    /// Park failures of `flow` in `queue`
    #[must_use]
    pub fn new(flow: impl Into<String>, queue: DeadLetterQueue) -> Self {
        Self {
            flow: flow.into(),
            queue,
        }
    }

    /// The backing queue
    #[must_use]
    pub const fn queue(&self) -> &DeadLetterQueue {
        &self.queue
    }
}

impl ExceptionStrategy for DeadLetterExceptionStrategy {
    fn handle(&self, envelope: Envelope, error: &ProcessorError) -> Option<Envelope> {
        let attempts = envelope
            .property(DELIVERY_ATTEMPTS_PROPERTY)
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(1);
        let failed = mark_failed(&envelope, error);

        self.queue.push(DeadLetter {
            envelope: failed.clone(),
            error: ErrorInfo::from_error(error),
            flow: self.flow.clone(),
            attempts,
            failed_at: Utc::now(),
        });

        Some(failed)
    }

    fn name(&self) -> &str {
        "dead-letter"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn letter(id: &str) -> DeadLetter {
        DeadLetter {
            envelope: Envelope::with_id(id, "x"),
            error: ErrorInfo::new("transform", "boom"),
            flow: "f".to_string(),
            attempts: 1,
            failed_at: Utc::now(),
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let dlq = DeadLetterQueue::new(2);
        dlq.push(letter("a"));
        dlq.push(letter("b"));
        assert!(dlq.is_full());

        dlq.push(letter("c"));

        let ids: Vec<_> = dlq.drain().into_iter().map(|l| l.envelope.id().to_string()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(dlq.is_empty());
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let dlq = DeadLetterQueue::new(0);
        dlq.push(letter("a"));
        assert!(dlq.is_empty());
    }

    #[test]
    fn clones_share_storage() {
        let dlq = DeadLetterQueue::default();
        let other = dlq.clone();
        other.push(letter("a"));
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq.max_size(), DEFAULT_DLQ_CAPACITY);
    }

    #[test]
    fn strategy_reads_attempt_count() {
        let dlq = DeadLetterQueue::new(10);
        let strategy = DeadLetterExceptionStrategy::new("quotes", dlq.clone());
        let envelope = Envelope::new("q").with_property(DELIVERY_ATTEMPTS_PROPERTY, 4);

        let response = strategy
            .handle(envelope, &ProcessorError::transform("enrich", "bad"))
            .unwrap();

        assert!(response.is_failure());
        let parked = dlq.peek().unwrap();
        assert_eq!(parked.attempts, 4);
        assert_eq!(parked.error.kind, "transform");
        assert!(parked.envelope.is_failure());
    }
}
