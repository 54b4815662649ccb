//! Error taxonomy of the engine.
//!
//! - [`ProcessorError`]: a single processor failed; aborts the remaining chain
//! - [`RoutingError`]: a connector-level dispatch or request failed
//! - [`AggregationError`]: a strategy could not reduce a complete group
//! - [`CorrelationError`]: the correlator rejected an envelope or evicted a group
//! - [`ChainBuildError`]: a chain could not be assembled
//!
//! Filter non-matches are not errors; they surface as
//! [`Outcome::Stop`](crate::processor::Outcome::Stop).

use crate::correlation::EventGroup;
use crate::envelope::Envelope;
use thiserror::Error;

/// A processor failed while handling an envelope
#[derive(Error, Debug, Clone)]
pub enum ProcessorError {
    /// A transformation step failed
    #[error("Processor '{processor}' failed: {reason}")]
    Transform {
        /// Name of the failing processor
        processor: String,
        /// Why it failed
        reason: String,
    },

    /// A connector could not deliver the envelope
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// The correlator rejected the envelope or an aggregation failed
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// A processor panicked on a worker thread
    #[error("Processor '{processor}' panicked: {message}")]
    Panicked {
        /// Name of the processor (or chain) that panicked
        processor: String,
        /// Panic payload, when it was a string
        message: String,
    },
}

impl ProcessorError {
    /// Create a transform failure
    #[must_use]
    pub fn transform(processor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transform {
            processor: processor.into(),
            reason: reason.into(),
        }
    }

    /// Error category, used for metrics labels and error envelopes
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transform { .. } => "transform",
            Self::Routing(_) => "routing",
            Self::Correlation(CorrelationError::Aggregation(_)) => "aggregation",
            Self::Correlation(CorrelationError::Timeout { .. }) => "timeout",
            Self::Correlation(_) => "correlation",
            Self::Panicked { .. } => "panic",
        }
    }

    /// Name of the processor the error is attributed to, if known
    #[must_use]
    pub fn processor(&self) -> Option<&str> {
        match self {
            Self::Transform { processor, .. } | Self::Panicked { processor, .. } => Some(processor),
            Self::Routing(error) => Some(&error.target),
            Self::Correlation(_) => None,
        }
    }
}

/// Which connector operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingErrorKind {
    /// One-way dispatch
    Dispatch,
    /// Request-response send
    Send,
    /// Polling request
    Request,
    /// The remote end did not answer in time
    Timeout,
}

impl std::fmt::Display for RoutingErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Dispatch => "dispatch",
            Self::Send => "send",
            Self::Request => "request",
            Self::Timeout => "timeout",
        })
    }
}

/// A connector-level send failed.
///
/// Always names the target; the underlying cause is optional.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Routing {kind} to '{target}' failed{}", describe_cause(.cause.as_deref()))]
pub struct RoutingError {
    /// Name of the target processor or connector
    pub target: String,
    /// Operation that failed
    pub kind: RoutingErrorKind,
    /// Underlying cause, if any
    pub cause: Option<String>,
}

fn describe_cause(cause: Option<&str>) -> String {
    cause.map_or_else(String::new, |cause| format!(": {cause}"))
}

impl RoutingError {
    /// Create a routing error without a cause
    #[must_use]
    pub fn new(target: impl Into<String>, kind: RoutingErrorKind) -> Self {
        Self {
            target: target.into(),
            kind,
            cause: None,
        }
    }

    /// Attach a cause
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// Failure of an aggregation strategy itself
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
    /// The strategy was handed an empty group
    #[error("Event group is empty")]
    EmptyGroup,

    /// A member carried a payload the strategy cannot interpret
    #[error("Member {index} has unexpected payload: expected {expected}, found {found}")]
    UnexpectedPayload {
        /// Arrival index of the offending member
        index: usize,
        /// Payload kind the strategy needs
        expected: &'static str,
        /// Payload kind actually found
        found: &'static str,
    },

    /// Any other strategy-specific failure
    #[error("{0}")]
    Failed(String),
}

/// A complete group could not be reduced.
///
/// Terminal for the correlation id: the group has already been removed from
/// the correlator and is carried here only for diagnostics.
#[derive(Error, Debug, Clone)]
#[error(
    "Aggregation of group '{correlation_id}' ({} members) failed: {source}",
    .group.len()
)]
pub struct AggregationError {
    /// Correlation id of the consumed group
    pub correlation_id: String,
    /// Snapshot of the group at removal time
    pub group: Box<EventGroup>,
    /// Last envelope processed before the failure
    pub last: Envelope,
    /// What the strategy reported
    #[source]
    pub source: StrategyError,
}

/// The correlator could not accept an envelope or closed a group unsuccessfully
#[derive(Error, Debug, Clone)]
pub enum CorrelationError {
    /// The envelope carries no correlation id and none was supplied
    #[error("Envelope '{envelope_id}' has no correlation id")]
    MissingCorrelationId {
        /// Id of the offending envelope
        envelope_id: String,
    },

    /// The aggregation strategy failed
    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    /// A group was evicted before it completed
    #[error(
        "Group '{correlation_id}' timed out with {received} of {} members",
        .expected.map_or_else(|| "an unknown number of".to_string(), |n| n.to_string())
    )]
    Timeout {
        /// Correlation id of the evicted group
        correlation_id: String,
        /// Members received before eviction
        received: usize,
        /// Expected size, if it was known
        expected: Option<usize>,
        /// Partial group snapshot
        group: Box<EventGroup>,
    },
}

impl CorrelationError {
    /// Correlation id involved, if any
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::MissingCorrelationId { .. } => None,
            Self::Aggregation(error) => Some(&error.correlation_id),
            Self::Timeout { correlation_id, .. } => Some(correlation_id),
        }
    }

    /// Group snapshot carried by the error, if any
    #[must_use]
    pub fn group(&self) -> Option<&EventGroup> {
        match self {
            Self::MissingCorrelationId { .. } => None,
            Self::Aggregation(error) => Some(&error.group),
            Self::Timeout { group, .. } => Some(group),
        }
    }
}

/// A chain could not be assembled
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainBuildError {
    /// The lookup has no processor registered under this name
    #[error("Unknown processor reference: '{name}'")]
    UnknownProcessor {
        /// Name that failed to resolve
        name: String,
    },

    /// A named reference was used but the chain was built without a lookup
    #[error("Processor reference '{name}' requires a lookup; use build_with")]
    UnresolvedReference {
        /// Name of the reference
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_error_display() {
        let bare = RoutingError::new("quotes", RoutingErrorKind::Dispatch);
        assert_eq!(bare.to_string(), "Routing dispatch to 'quotes' failed");

        let caused = bare.with_cause("connection refused");
        assert_eq!(
            caused.to_string(),
            "Routing dispatch to 'quotes' failed: connection refused"
        );
    }

    #[test]
    fn processor_error_kind_and_target() {
        let routing: ProcessorError = RoutingError::new("bank", RoutingErrorKind::Send).into();
        assert_eq!(routing.kind(), "routing");
        assert_eq!(routing.processor(), Some("bank"));

        let transform = ProcessorError::transform("upper", "bad input");
        assert_eq!(transform.kind(), "transform");
        assert_eq!(transform.to_string(), "Processor 'upper' failed: bad input");
    }

    #[test]
    fn timeout_display_with_unknown_size() {
        let error = CorrelationError::Timeout {
            correlation_id: "g1".to_string(),
            received: 2,
            expected: None,
            group: Box::new(EventGroup::new("g1", None, chrono::Utc::now())),
        };
        assert_eq!(
            error.to_string(),
            "Group 'g1' timed out with 2 of an unknown number of members"
        );
        assert_eq!(error.correlation_id(), Some("g1"));
    }
}
