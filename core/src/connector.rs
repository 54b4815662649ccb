//! Connector boundary.
//!
//! The engine never talks to a transport directly. A [`Connector`] is the
//! capability an outbound (or polled inbound) transport exposes, and
//! [`OutboundEndpoint`] adapts it into a chain [`Processor`].

use crate::chain::ChainStatistics;
use crate::envelope::Envelope;
use crate::error::{ProcessorError, RoutingError, RoutingErrorKind};
use crate::exchange::{ExchangePattern, resolve};
use crate::processor::{Outcome, Processor, ProcessorKind};
use std::sync::Arc;
use std::time::Duration;

/// Transport capability consumed by the engine
pub trait Connector: Send + Sync {
    /// Connector name, used as the routing target in errors
    fn name(&self) -> &str;

    /// Fire-and-forget delivery
    ///
    /// # Errors
    ///
    /// Returns a [`RoutingError`] if the transport rejects the envelope.
    fn dispatch(&self, envelope: &Envelope) -> Result<(), RoutingError>;

    /// Request-response delivery.
    ///
    /// `Ok(None)` means the remote end legitimately answered with nothing.
    /// The default implementation dispatches and returns no response.
    ///
    /// # Errors
    ///
    /// Returns a [`RoutingError`] if the send fails or times out.
    fn send(&self, envelope: &Envelope) -> Result<Option<Envelope>, RoutingError> {
        self.dispatch(envelope)?;
        Ok(None)
    }

    /// Poll the transport for one envelope, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a [`RoutingError`] if the transport cannot be polled.
    fn request(&self, timeout: Duration) -> Result<Option<Envelope>, RoutingError> {
        let _ = timeout;
        Err(RoutingError::new(self.name(), RoutingErrorKind::Request)
            .with_cause("connector does not support polling"))
    }

    /// Exchange pattern declared on the connector, if any
    fn exchange_pattern(&self) -> Option<ExchangePattern> {
        None
    }

    /// Whether the connector may return no response
    fn may_return_void(&self) -> bool {
        true
    }
}

impl<C: Connector + ?Sized> Connector for Arc<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn dispatch(&self, envelope: &Envelope) -> Result<(), RoutingError> {
        (**self).dispatch(envelope)
    }

    fn send(&self, envelope: &Envelope) -> Result<Option<Envelope>, RoutingError> {
        (**self).send(envelope)
    }

    fn request(&self, timeout: Duration) -> Result<Option<Envelope>, RoutingError> {
        (**self).request(timeout)
    }

    fn exchange_pattern(&self) -> Option<ExchangePattern> {
        (**self).exchange_pattern()
    }

    fn may_return_void(&self) -> bool {
        (**self).may_return_void()
    }
}

/// Chain step that hands envelopes to a [`Connector`].
///
/// The effective pattern is the connector's declared pattern, falling back to
/// the envelope's. One-way dispatches and yields [`Outcome::Void`];
/// request-response yields the connector's reply unchanged.
pub struct OutboundEndpoint<C> {
    connector: C,
    stats: Arc<ChainStatistics>,
}

impl<C: Connector> OutboundEndpoint<C> {
    /// Wrap a connector
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            stats: Arc::new(ChainStatistics::default()),
        }
    }

    /// Borrow the wrapped connector
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Delivery statistics for this endpoint
    #[must_use]
    pub fn statistics(&self) -> Arc<ChainStatistics> {
        Arc::clone(&self.stats)
    }

    fn deliver(&self, envelope: &Envelope) -> Result<Outcome, RoutingError> {
        let effective = resolve(envelope.exchange_pattern(), self.connector.exchange_pattern());
        if !effective.has_response() {
            self.connector.dispatch(envelope)?;
            tracing::debug!(endpoint = %self.connector.name(), envelope = %envelope.id(), "Dispatched one-way");
            return Ok(Outcome::Void);
        }

        match self.connector.send(envelope)? {
            Some(reply) => Ok(Outcome::Event(reply)),
            None if self.connector.may_return_void() => Ok(Outcome::Void),
            None => Err(RoutingError::new(self.connector.name(), RoutingErrorKind::Send)
                .with_cause("no response received")),
        }
    }
}

impl<C: Connector> Processor for OutboundEndpoint<C> {
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        match self.deliver(&envelope) {
            Ok(outcome) => {
                self.stats.record_outcome(&outcome);
                Ok(outcome)
            },
            Err(error) => {
                self.stats.record_error();
                tracing::warn!(endpoint = %self.connector.name(), error = %error, "Outbound delivery failed");
                Err(error.into())
            },
        }
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Connector {
            exchange_pattern: self.connector.exchange_pattern(),
            may_return_void: self.connector.may_return_void(),
        }
    }

    fn name(&self) -> &str {
        self.connector.name()
    }
}
