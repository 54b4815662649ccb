//! Correlation-aware router step.

use super::{CorrelationContext, EventCorrelator};
use crate::envelope::Envelope;
use crate::error::ProcessorError;
use crate::processor::{Outcome, Processor, ProcessorKind};
use std::sync::Arc;

/// Chain step that feeds envelopes to an [`EventCorrelator`].
///
/// Envelopes that do not complete their group stop the chain; the arrival
/// that completes a group continues with the aggregate. Aggregation failures
/// abort the chain like any other processor error.
#[derive(Debug, Clone)]
pub struct AggregatingRouter {
    name: String,
    correlator: Arc<EventCorrelator>,
    context: CorrelationContext,
}

impl AggregatingRouter {
    /// Route envelopes into `correlator`
    #[must_use]
    pub fn new(correlator: Arc<EventCorrelator>) -> Self {
        Self {
            name: format!("{}-router", correlator.name()),
            correlator,
            context: CorrelationContext::default(),
        }
    }

    /// Apply the same overrides to every envelope
    #[must_use]
    pub fn with_context(mut self, context: CorrelationContext) -> Self {
        self.context = context;
        self
    }

    /// The underlying correlator
    #[must_use]
    pub const fn correlator(&self) -> &Arc<EventCorrelator> {
        &self.correlator
    }
}

impl Processor for AggregatingRouter {
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        Ok(self.correlator.correlate(envelope, &self.context)?.into())
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Router
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregation::LowestValueAggregator;
    use crate::chain::ProcessorChainBuilder;
    use crate::envelope::Payload;
    use crate::processor::Transformer;

    #[test]
    fn router_stops_until_group_completes() {
        let correlator = Arc::new(EventCorrelator::builder(LowestValueAggregator).name("quotes").build());
        let chain = ProcessorChainBuilder::new()
            .chain(AggregatingRouter::new(correlator))
            .chain(Transformer::new("tag", |e: Envelope| Ok(e.with_property("best", true))))
            .build()
            .unwrap();

        let quote = |v: f64| Envelope::new(v).with_correlation_id("c").with_group_size(2);

        assert!(chain.process(quote(0.3)).unwrap().is_stop());
        let best = chain.process(quote(0.2)).unwrap().into_envelope().unwrap();
        assert_eq!(best.payload(), &Payload::Number(0.2));
        assert!(best.property("best").is_some());
    }

    #[test]
    fn missing_id_aborts_chain() {
        let correlator = Arc::new(EventCorrelator::builder(LowestValueAggregator).build());
        let router = AggregatingRouter::new(correlator);

        let error = router.process(Envelope::new(1.0)).unwrap_err();
        assert_eq!(error.kind(), "correlation");
    }
}
