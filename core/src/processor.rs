//! Processors: single transform, filter, route or dispatch steps.
//!
//! A [`Processor`] turns one [`Envelope`] into an [`Outcome`]:
//!
//! - [`Outcome::Event`]: continue with this envelope
//! - [`Outcome::Void`]: nothing to return; the chain continues with the envelope
//!   this processor received
//! - [`Outcome::Stop`]: the envelope was absorbed (filter non-match, pending
//!   aggregation); the chain ends here
//!
//! Processors are shared between concurrent invocations and take `&self`.
//! Any mutable state they keep (counters, caches) must be synchronized
//! internally.
//!
//! Each processor also reports a [`ProcessorKind`] capability tag. Chains use
//! it instead of runtime type inspection to decide whether a trailing void
//! result must be suppressed.

use crate::envelope::Envelope;
use crate::error::ProcessorError;
use crate::exchange::ExchangePattern;
use std::fmt;
use std::sync::Arc;

/// Result of a single processing step
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// An envelope to hand to the next step
    Event(Envelope),
    /// No response; the previous envelope flows on
    Void,
    /// Processing of this envelope ends here
    Stop,
}

impl Outcome {
    /// Extract the envelope, if any
    #[must_use]
    pub fn into_envelope(self) -> Option<Envelope> {
        match self {
            Self::Event(envelope) => Some(envelope),
            Self::Void | Self::Stop => None,
        }
    }

    /// Borrow the envelope, if any
    #[must_use]
    pub const fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Event(envelope) => Some(envelope),
            Self::Void | Self::Stop => None,
        }
    }

    /// Check for a void result
    #[must_use]
    pub const fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Check for a stop result
    #[must_use]
    pub const fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }
}

impl From<Envelope> for Outcome {
    fn from(envelope: Envelope) -> Self {
        Self::Event(envelope)
    }
}

impl From<Option<Envelope>> for Outcome {
    fn from(envelope: Option<Envelope>) -> Self {
        envelope.map_or(Self::Stop, Self::Event)
    }
}

/// Capability tag carried by every processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessorKind {
    /// Transforms, filters and plain steps
    #[default]
    Transformer,
    /// Routes envelopes elsewhere (e.g. an aggregating router)
    Router,
    /// Outbound connector endpoint
    Connector {
        /// Pattern declared on the endpoint, overriding the envelope's
        exchange_pattern: Option<ExchangePattern>,
        /// Whether the endpoint may legitimately return nothing
        may_return_void: bool,
    },
}

impl ProcessorKind {
    /// Whether a trailing void from a processor of this kind suppresses the chain result.
    ///
    /// True only for connectors that may return void and whose effective
    /// pattern (given the envelope's requested pattern) has no response leg.
    #[must_use]
    pub const fn suppresses_response(self, requested: ExchangePattern) -> bool {
        match self {
            Self::Connector {
                exchange_pattern,
                may_return_void,
            } => may_return_void && !crate::exchange::resolve(requested, exchange_pattern).has_response(),
            Self::Transformer | Self::Router => false,
        }
    }
}

/// A single step of a processor chain.
///
/// # Example
///
/// ```
/// use courier_core::envelope::Envelope;
/// use courier_core::error::ProcessorError;
/// use courier_core::processor::{Outcome, Processor};
///
/// struct Stamp;
///
/// impl Processor for Stamp {
///     fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
///         Ok(Outcome::Event(envelope.with_property("stamped", true)))
///     }
/// }
///
/// let out = Stamp.process(Envelope::new("x")).unwrap();
/// assert!(out.envelope().unwrap().property("stamped").is_some());
/// ```
pub trait Processor: Send + Sync {
    /// Handle one envelope
    ///
    /// # Errors
    ///
    /// Returns a [`ProcessorError`] if the step fails. The owning chain aborts
    /// and hands the error to its exception strategy.
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError>;

    /// Capability tag used by chains for void suppression
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Transformer
    }

    /// Name used in logs, metrics and errors
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<P: Processor + ?Sized> Processor for Arc<P> {
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        (**self).process(envelope)
    }

    fn kind(&self) -> ProcessorKind {
        (**self).kind()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<P: Processor + ?Sized> Processor for Box<P> {
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        (**self).process(envelope)
    }

    fn kind(&self) -> ProcessorKind {
        (**self).kind()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Processor backed by a closure returning a full [`Outcome`]
pub struct FnProcessor<F> {
    name: String,
    kind: ProcessorKind,
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(Envelope) -> Result<Outcome, ProcessorError> + Send + Sync,
{
    /// Wrap a closure
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            kind: ProcessorKind::Transformer,
            f,
        }
    }

    /// Override the capability tag
    #[must_use]
    pub fn with_kind(mut self, kind: ProcessorKind) -> Self {
        self.kind = kind;
        self
    }
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(Envelope) -> Result<Outcome, ProcessorError> + Send + Sync,
{
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        (self.f)(envelope)
    }

    fn kind(&self) -> ProcessorKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcessor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Envelope-to-envelope transformation step
pub struct Transformer<F> {
    name: String,
    f: F,
}

impl<F> Transformer<F>
where
    F: Fn(Envelope) -> Result<Envelope, ProcessorError> + Send + Sync,
{
    /// Wrap a transformation closure
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Processor for Transformer<F>
where
    F: Fn(Envelope) -> Result<Envelope, ProcessorError> + Send + Sync,
{
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        (self.f)(envelope).map(Outcome::Event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for Transformer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Filter step: matching envelopes pass through unchanged, others stop the chain.
///
/// A non-match is a normal outcome, not an error.
///
/// # Example
///
/// ```
/// use courier_core::envelope::Envelope;
/// use courier_core::processor::{MessageFilter, Processor};
///
/// let numbers_only = MessageFilter::new("numbers", |e: &Envelope| e.payload().as_number().is_some());
///
/// assert!(numbers_only.process(Envelope::new("12")).unwrap().envelope().is_some());
/// assert!(numbers_only.process(Envelope::new("abc")).unwrap().is_stop());
/// ```
pub struct MessageFilter<F> {
    name: String,
    predicate: F,
}

impl<F> MessageFilter<F>
where
    F: Fn(&Envelope) -> bool + Send + Sync,
{
    /// Create a filter from a predicate
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<F> Processor for MessageFilter<F>
where
    F: Fn(&Envelope) -> bool + Send + Sync,
{
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        if (self.predicate)(&envelope) {
            Ok(Outcome::Event(envelope))
        } else {
            tracing::trace!(filter = %self.name, envelope = %envelope.id(), "Envelope filtered");
            Ok(Outcome::Stop)
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for MessageFilter<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFilter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::envelope::Payload;

    #[test]
    fn transformer_emits_event() {
        let upper = Transformer::new("upper", |e: Envelope| {
            let text = e.payload().as_text().unwrap_or_default().to_uppercase();
            Ok(e.with_payload(text))
        });

        let outcome = upper.process(Envelope::new("abc")).unwrap();
        assert_eq!(outcome.envelope().unwrap().payload(), &Payload::from("ABC"));
        assert_eq!(upper.name(), "upper");
        assert_eq!(upper.kind(), ProcessorKind::Transformer);
    }

    #[test]
    fn filter_non_match_is_not_an_error() {
        let filter = MessageFilter::new("never", |_: &Envelope| false);
        assert!(filter.process(Envelope::new("x")).unwrap().is_stop());
    }

    #[test]
    fn suppression_follows_effective_pattern() {
        let one_way = ProcessorKind::Connector {
            exchange_pattern: Some(ExchangePattern::OneWay),
            may_return_void: true,
        };
        let inherits = ProcessorKind::Connector {
            exchange_pattern: None,
            may_return_void: true,
        };
        let never_void = ProcessorKind::Connector {
            exchange_pattern: Some(ExchangePattern::OneWay),
            may_return_void: false,
        };

        assert!(one_way.suppresses_response(ExchangePattern::RequestResponse));
        assert!(inherits.suppresses_response(ExchangePattern::OneWay));
        assert!(!inherits.suppresses_response(ExchangePattern::RequestResponse));
        assert!(!never_void.suppresses_response(ExchangePattern::OneWay));
        assert!(!ProcessorKind::Router.suppresses_response(ExchangePattern::OneWay));
    }

    #[test]
    fn option_into_outcome() {
        assert!(Outcome::from(None::<Envelope>).is_stop());
        assert!(Outcome::from(Some(Envelope::new("x"))).envelope().is_some());
    }
}
