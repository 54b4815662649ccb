//! Event correlation.
//!
//! Related envelopes (quotes from several banks, the parts of a split message)
//! share a correlation id. The [`EventCorrelator`] collects them into
//! [`EventGroup`]s, decides when a group is complete using its
//! [`CompletionPolicy`], and reduces complete groups with an
//! [`AggregationStrategy`](crate::aggregation::AggregationStrategy).
//!
//! # Group lifecycle
//!
//! ```text
//!  first arrival          more arrivals            should_aggregate
//! ──────────────▶ ACTIVE ───────────────▶ ACTIVE ───────────────────▶ removed ─▶ aggregated
//!                   │                                                    │
//!                   │ timeout                                            └─ strategy fails ─▶ AggregationError
//!                   ▼
//!                removed ─▶ Discard | Fail (exception strategy) | ForwardPartial (listener)
//! ```
//!
//! Removal from the index is atomic per correlation id, so at most one
//! aggregation happens for any id.

mod correlator;
mod group;
mod policy;
mod router;

pub use correlator::{CorrelatorStatistics, EventCorrelator, EventCorrelatorBuilder};
pub use group::EventGroup;
pub use policy::{
    CompletionMode, CompletionPolicy, CorrelatorConfig, DEFAULT_MAX_PROCESSED_GROUPS,
    EvictionPolicy,
};
pub use router::AggregatingRouter;

use crate::envelope::Envelope;
use serde_json::Value;

/// Per-call overrides for [`EventCorrelator::correlate`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationContext {
    /// Correlation id to use instead of the one the mapping extracts
    pub correlation_id: Option<String>,
    /// Expected group size to use instead of the envelope's
    pub expected_size: Option<usize>,
}

impl CorrelationContext {
    /// Empty context: everything comes from the envelope
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the correlation id
    #[must_use]
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Override the expected group size
    #[must_use]
    pub const fn expected_size(mut self, expected_size: usize) -> Self {
        self.expected_size = Some(expected_size);
        self
    }
}

/// Extracts correlation information from envelopes
pub trait MessageInfoMapping: Send + Sync {
    /// Correlation id of the envelope, if any
    fn correlation_id(&self, envelope: &Envelope) -> Option<String>;

    /// Expected size of the envelope's group, if declared
    fn group_size(&self, envelope: &Envelope) -> Option<usize> {
        envelope.group_size()
    }
}

/// Reads the envelope's own correlation id and group size
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeInfoMapping;

impl MessageInfoMapping for EnvelopeInfoMapping {
    fn correlation_id(&self, envelope: &Envelope) -> Option<String> {
        envelope.correlation_id().map(str::to_string)
    }
}

/// Reads correlation information from envelope properties
#[derive(Debug, Clone)]
pub struct PropertyInfoMapping {
    id_key: String,
    size_key: Option<String>,
}

impl PropertyInfoMapping {
    /// Take the correlation id from property `id_key`
    #[must_use]
    pub fn new(id_key: impl Into<String>) -> Self {
        Self {
            id_key: id_key.into(),
            size_key: None,
        }
    }

    /// Take the expected group size from property `size_key`
    #[must_use]
    pub fn size_key(mut self, size_key: impl Into<String>) -> Self {
        self.size_key = Some(size_key.into());
        self
    }
}

impl MessageInfoMapping for PropertyInfoMapping {
    fn correlation_id(&self, envelope: &Envelope) -> Option<String> {
        match envelope.property(&self.id_key)? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    fn group_size(&self, envelope: &Envelope) -> Option<usize> {
        let Some(key) = &self.size_key else {
            return envelope.group_size();
        };
        match envelope.property(key)? {
            Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_mapping_reads_id_and_size() {
        let mapping = PropertyInfoMapping::new("order").size_key("parts");
        let envelope = Envelope::new("x")
            .with_property("order", 42)
            .with_property("parts", "3");

        assert_eq!(mapping.correlation_id(&envelope).as_deref(), Some("42"));
        assert_eq!(mapping.group_size(&envelope), Some(3));
    }

    #[test]
    fn envelope_mapping_uses_metadata() {
        let envelope = Envelope::new("x").with_correlation_id("c").with_group_size(2);
        assert_eq!(EnvelopeInfoMapping.correlation_id(&envelope).as_deref(), Some("c"));
        assert_eq!(EnvelopeInfoMapping.group_size(&envelope), Some(2));
    }
}
