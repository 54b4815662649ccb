//! Mock connectors.

use courier_core::connector::Connector;
use courier_core::envelope::{Envelope, Payload};
use courier_core::error::{RoutingError, RoutingErrorKind};
use courier_core::exchange::ExchangePattern;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// What a [`MockConnector`] answers to a request-response send
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Return the sent envelope unchanged
    Echo,
    /// Return the sent envelope carrying this payload
    Payload(Payload),
    /// Return nothing
    Nothing,
}

/// In-memory connector that records what it was given.
///
/// # Example
///
/// ```
/// use courier_core::connector::OutboundEndpoint;
/// use courier_core::envelope::Envelope;
/// use courier_core::processor::Processor;
/// use courier_testing::connectors::MockConnector;
///
/// let endpoint = OutboundEndpoint::new(MockConnector::one_way("audit"));
/// assert!(endpoint.process(Envelope::new("x")).unwrap().is_void());
/// assert_eq!(endpoint.connector().dispatched().len(), 1);
/// ```
#[derive(Debug)]
pub struct MockConnector {
    name: String,
    pattern: Option<ExchangePattern>,
    may_return_void: bool,
    reply: Reply,
    failing: AtomicBool,
    dispatched: Mutex<Vec<Envelope>>,
    sent: Mutex<Vec<Envelope>>,
    inbox: Mutex<VecDeque<Envelope>>,
}

impl MockConnector {
    fn with_pattern(name: impl Into<String>, pattern: Option<ExchangePattern>) -> Self {
        Self {
            name: name.into(),
            pattern,
            may_return_void: true,
            reply: Reply::Echo,
            failing: AtomicBool::new(false),
            dispatched: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            inbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Connector declaring a one-way pattern
    #[must_use]
    pub fn one_way(name: impl Into<String>) -> Self {
        Self::with_pattern(name, Some(ExchangePattern::OneWay))
    }

    /// Connector declaring a request-response pattern
    #[must_use]
    pub fn request_response(name: impl Into<String>) -> Self {
        Self::with_pattern(name, Some(ExchangePattern::RequestResponse))
    }

    /// Connector that follows the envelope's pattern
    #[must_use]
    pub fn inheriting(name: impl Into<String>) -> Self {
        Self::with_pattern(name, None)
    }

    /// Change the request-response answer
    #[must_use]
    pub fn replying(mut self, reply: Reply) -> Self {
        self.reply = reply;
        self
    }

    /// Declare that the connector never returns void
    #[must_use]
    pub const fn never_void(mut self) -> Self {
        self.may_return_void = false;
        self
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Queue an envelope for [`Connector::request`]
    pub fn push_inbound(&self, envelope: Envelope) {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(envelope);
    }

    /// Envelopes dispatched one-way
    #[must_use]
    pub fn dispatched(&self) -> Vec<Envelope> {
        self.dispatched.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Envelopes sent request-response
    #[must_use]
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn check(&self, kind: RoutingErrorKind) -> Result<(), RoutingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RoutingError::new(&self.name, kind).with_cause("mock connector failure"));
        }
        Ok(())
    }
}

impl Connector for MockConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, envelope: &Envelope) -> Result<(), RoutingError> {
        self.check(RoutingErrorKind::Dispatch)?;
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope.clone());
        Ok(())
    }

    fn send(&self, envelope: &Envelope) -> Result<Option<Envelope>, RoutingError> {
        self.check(RoutingErrorKind::Send)?;
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope.clone());
        Ok(match &self.reply {
            Reply::Echo => Some(envelope.clone()),
            Reply::Payload(payload) => Some(envelope.with_payload(payload.clone())),
            Reply::Nothing => None,
        })
    }

    fn request(&self, _timeout: Duration) -> Result<Option<Envelope>, RoutingError> {
        self.check(RoutingErrorKind::Request)?;
        Ok(self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front())
    }

    fn exchange_pattern(&self) -> Option<ExchangePattern> {
        self.pattern
    }

    fn may_return_void(&self) -> bool {
        self.may_return_void
    }
}
