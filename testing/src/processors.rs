//! Mock processors.
//!
//! All mocks keep their bookkeeping behind atomics or mutexes so they can be
//! shared across concurrent chain invocations.

use courier_core::envelope::{Envelope, Payload};
use courier_core::error::{ProcessorError, RoutingError, RoutingErrorKind};
use courier_core::processor::{Outcome, Processor, ProcessorKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Shared, ordered log of processor invocations
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call
    pub fn record(&self, name: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
    }

    /// Names recorded so far, in call order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Forget all recorded calls
    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Appends a suffix to the payload's text form
#[derive(Debug)]
pub struct AppendingProcessor {
    suffix: String,
    calls: AtomicUsize,
    log: Option<CallLog>,
}

impl AppendingProcessor {
    /// Append `suffix` on every call
    #[must_use]
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            calls: AtomicUsize::new(0),
            log: None,
        }
    }

    /// Record calls into a shared log
    #[must_use]
    pub fn logging_to(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Number of invocations so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Processor for AppendingProcessor {
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.record(&self.suffix);
        }
        let text = format!("{}{}", envelope.payload(), self.suffix);
        Ok(Outcome::Event(envelope.with_payload(text)))
    }

    fn name(&self) -> &str {
        &self.suffix
    }
}

/// Records every envelope it sees and passes it on unchanged
#[derive(Debug, Default)]
pub struct RecordingProcessor {
    name: String,
    seen: Mutex<Vec<Envelope>>,
}

impl RecordingProcessor {
    /// Create a named recorder
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Envelopes received so far
    #[must_use]
    pub fn seen(&self) -> Vec<Envelope> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of envelopes received so far
    #[must_use]
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Processor for RecordingProcessor {
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope.clone());
        Ok(Outcome::Event(envelope))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Always returns `Void`
#[derive(Debug, Default)]
pub struct VoidProcessor {
    calls: AtomicUsize,
}

impl VoidProcessor {
    /// Number of invocations so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Processor for VoidProcessor {
    fn process(&self, _envelope: Envelope) -> Result<Outcome, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Outcome::Void)
    }

    fn name(&self) -> &str {
        "void"
    }
}

/// Always returns `Stop`
#[derive(Debug, Clone, Copy, Default)]
pub struct StopProcessor;

impl Processor for StopProcessor {
    fn process(&self, _envelope: Envelope) -> Result<Outcome, ProcessorError> {
        Ok(Outcome::Stop)
    }

    fn name(&self) -> &str {
        "stop"
    }
}

/// Fails a configurable number of times, then passes envelopes through
#[derive(Debug)]
pub struct FailingProcessor {
    name: String,
    remaining_failures: AtomicUsize,
    calls: AtomicUsize,
    routing: bool,
}

impl FailingProcessor {
    /// Fail every call with a transform error
    #[must_use]
    pub fn always(name: impl Into<String>) -> Self {
        Self::times(name, usize::MAX)
    }

    /// Fail the first `failures` calls with a transform error
    #[must_use]
    pub fn times(name: impl Into<String>, failures: usize) -> Self {
        Self {
            name: name.into(),
            remaining_failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
            routing: false,
        }
    }

    /// Report failures as routing errors instead
    #[must_use]
    pub const fn as_routing(mut self) -> Self {
        self.routing = true;
        self
    }

    /// Number of invocations so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Processor for FailingProcessor {
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !failing {
            return Ok(Outcome::Event(envelope));
        }
        if self.routing {
            Err(RoutingError::new(&self.name, RoutingErrorKind::Dispatch)
                .with_cause("simulated failure")
                .into())
        } else {
            Err(ProcessorError::transform(&self.name, "simulated failure"))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Panics on every call
#[derive(Debug, Clone, Copy, Default)]
pub struct PanickingProcessor;

impl Processor for PanickingProcessor {
    #[allow(clippy::panic)]
    fn process(&self, _envelope: Envelope) -> Result<Outcome, ProcessorError> {
        panic!("processor exploded");
    }

    fn name(&self) -> &str {
        "panicking"
    }
}

/// Blocks the calling thread before passing the envelope on
#[derive(Debug)]
pub struct DelayProcessor {
    delay: Duration,
}

impl DelayProcessor {
    /// Sleep for `delay` on every call
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Processor for DelayProcessor {
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        std::thread::sleep(self.delay);
        Ok(Outcome::Event(envelope))
    }

    fn name(&self) -> &str {
        "delay"
    }
}

/// Replaces the payload with a fixed value and reports itself as a connector
#[derive(Debug)]
pub struct ReplyingConnectorProcessor {
    reply: Payload,
}

impl ReplyingConnectorProcessor {
    /// Reply with `payload`
    #[must_use]
    pub fn new(reply: impl Into<Payload>) -> Self {
        Self { reply: reply.into() }
    }
}

impl Processor for ReplyingConnectorProcessor {
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        Ok(Outcome::Event(envelope.with_payload(self.reply.clone())))
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Connector {
            exchange_pattern: None,
            may_return_void: true,
        }
    }

    fn name(&self) -> &str {
        "replying-connector"
    }
}
