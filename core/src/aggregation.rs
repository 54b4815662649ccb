//! Aggregation strategies.
//!
//! An [`AggregationStrategy`] reduces a complete [`EventGroup`] to a single
//! envelope. Strategies are pure with respect to the group: they read the
//! members and build a new envelope, usually from a representative member
//! (by default the last to arrive) so that correlation id and headers carry
//! over, with a payload the strategy computes.

use crate::correlation::EventGroup;
use crate::envelope::{Envelope, Payload};
use crate::error::StrategyError;
use std::fmt;

/// Reduces a complete event group to one envelope
pub trait AggregationStrategy: Send + Sync {
    /// Combine the group's members.
    ///
    /// The group is never empty when called by the correlator and members are
    /// in arrival order.
    ///
    /// # Errors
    ///
    /// Returns a [`StrategyError`] if the members cannot be combined. The
    /// correlator then discards the group.
    fn aggregate(&self, group: &EventGroup) -> Result<Envelope, StrategyError>;

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<S: AggregationStrategy + ?Sized> AggregationStrategy for std::sync::Arc<S> {
    fn aggregate(&self, group: &EventGroup) -> Result<Envelope, StrategyError> {
        (**self).aggregate(group)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

fn representative(group: &EventGroup) -> Result<&Envelope, StrategyError> {
    group.last().ok_or(StrategyError::EmptyGroup)
}

/// Picks the member with the lowest numeric payload.
///
/// Every member must carry a finite number (a numeric payload, numeric text or a JSON
/// number); the first one that does not fails the aggregation. The result is
/// the last member's envelope carrying the minimum.
///
/// # Example
///
/// ```
/// use courier_core::aggregation::{AggregationStrategy, LowestValueAggregator};
/// use courier_core::correlation::EventGroup;
/// use courier_core::envelope::{Envelope, Payload};
///
/// let group = EventGroup::with_members(
///     "loan",
///     [0.07, 0.05, 0.09].map(|rate| Envelope::new(rate).with_correlation_id("loan")),
/// );
/// let best = LowestValueAggregator.aggregate(&group).unwrap();
/// assert_eq!(best.payload(), &Payload::Number(0.05));
/// assert_eq!(best.correlation_id(), Some("loan"));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestValueAggregator;

impl AggregationStrategy for LowestValueAggregator {
    fn aggregate(&self, group: &EventGroup) -> Result<Envelope, StrategyError> {
        let last = representative(group)?;
        let mut lowest = f64::INFINITY;
        for (index, member) in group.iter().enumerate() {
            let value = member
                .payload()
                .as_number()
                .ok_or_else(|| StrategyError::UnexpectedPayload {
                    index,
                    expected: "number",
                    found: member.payload().type_name(),
                })?;
            if !value.is_finite() {
                return Err(StrategyError::UnexpectedPayload {
                    index,
                    expected: "finite number",
                    found: "non-finite number",
                });
            }
            lowest = lowest.min(value);
        }
        Ok(last.with_payload(Payload::Number(lowest)))
    }

    fn name(&self) -> &str {
        "lowest-value"
    }
}

/// Member ordering used by [`CollectionAggregator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemberOrder {
    /// Keep arrival order
    #[default]
    Arrival,
    /// Re-sort by declared sequence index; members without one go last, in
    /// arrival order
    Sequence,
}

/// Collects member payloads into a list payload
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionAggregator {
    order: MemberOrder,
}

impl CollectionAggregator {
    /// Collect in the given order
    #[must_use]
    pub const fn new(order: MemberOrder) -> Self {
        Self { order }
    }

    fn ordered<'a>(&self, group: &'a EventGroup) -> Vec<&'a Envelope> {
        let mut members: Vec<&Envelope> = group.iter().collect();
        if self.order == MemberOrder::Sequence {
            members.sort_by_key(|member| member.sequence().map_or(usize::MAX, |s| s.index));
        }
        members
    }
}

impl AggregationStrategy for CollectionAggregator {
    fn aggregate(&self, group: &EventGroup) -> Result<Envelope, StrategyError> {
        let last = representative(group)?;
        let payloads = self
            .ordered(group)
            .into_iter()
            .map(|member| member.payload().clone())
            .collect();
        Ok(last.with_payload(Payload::List(payloads)))
    }

    fn name(&self) -> &str {
        "collection"
    }
}

/// Joins member payloads into one text payload
#[derive(Debug, Clone)]
pub struct ConcatenatingAggregator {
    separator: String,
    order: MemberOrder,
}

impl ConcatenatingAggregator {
    /// Join with `separator`, in arrival order
    #[must_use]
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            order: MemberOrder::Arrival,
        }
    }

    /// Change the member order
    #[must_use]
    pub const fn order(mut self, order: MemberOrder) -> Self {
        self.order = order;
        self
    }
}

impl AggregationStrategy for ConcatenatingAggregator {
    fn aggregate(&self, group: &EventGroup) -> Result<Envelope, StrategyError> {
        let last = representative(group)?;
        let members = CollectionAggregator::new(self.order).ordered(group);
        let mut text = String::new();
        for (index, member) in members.into_iter().enumerate() {
            if index > 0 {
                text.push_str(&self.separator);
            }
            match member.payload() {
                Payload::Bytes(bytes) => text.push_str(&String::from_utf8_lossy(bytes)),
                other => text.push_str(&other.to_string()),
            }
        }
        Ok(last.with_payload(Payload::Text(text)))
    }

    fn name(&self) -> &str {
        "concatenating"
    }
}

/// Strategy backed by a closure
pub struct FnAggregator<F> {
    name: String,
    f: F,
}

impl<F> FnAggregator<F>
where
    F: Fn(&EventGroup) -> Result<Envelope, StrategyError> + Send + Sync,
{
    /// Wrap a closure
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> AggregationStrategy for FnAggregator<F>
where
    F: Fn(&EventGroup) -> Result<Envelope, StrategyError> + Send + Sync,
{
    fn aggregate(&self, group: &EventGroup) -> Result<Envelope, StrategyError> {
        (self.f)(group)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnAggregator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAggregator")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn group_of(payloads: Vec<Payload>) -> EventGroup {
        EventGroup::with_members(
            "g",
            payloads
                .into_iter()
                .map(|p| Envelope::new(p).with_correlation_id("g")),
        )
    }

    #[test]
    fn lowest_value_uses_last_member_metadata() {
        let group = EventGroup::with_members(
            "g",
            [
                Envelope::new(0.07).with_property("bank", "a"),
                Envelope::new(0.05).with_property("bank", "b"),
                Envelope::new(0.09).with_property("bank", "c"),
            ],
        );

        let result = LowestValueAggregator.aggregate(&group).unwrap();

        assert_eq!(result.payload(), &Payload::Number(0.05));
        assert_eq!(result.property("bank").and_then(|v| v.as_str()), Some("c"));
    }

    #[test]
    fn lowest_value_fails_fast_on_wrong_type() {
        let group = group_of(vec![Payload::Number(1.0), Payload::Bytes(vec![0]), Payload::Number(0.5)]);

        let error = LowestValueAggregator.aggregate(&group).unwrap_err();
        assert_eq!(
            error,
            StrategyError::UnexpectedPayload {
                index: 1,
                expected: "number",
                found: "bytes"
            }
        );
    }

    #[test]
    fn lowest_value_rejects_non_finite_members() {
        let group = group_of(vec![Payload::Number(0.4), Payload::Number(f64::NAN)]);
        assert_eq!(
            LowestValueAggregator.aggregate(&group).unwrap_err(),
            StrategyError::UnexpectedPayload {
                index: 1,
                expected: "finite number",
                found: "non-finite number"
            }
        );

        let parsed = group_of(vec![Payload::from("NaN"), Payload::from("inf")]);
        assert!(matches!(
            LowestValueAggregator.aggregate(&parsed).unwrap_err(),
            StrategyError::UnexpectedPayload { index: 0, .. }
        ));
    }

    #[test]
    fn empty_group_is_rejected() {
        let group = group_of(Vec::new());
        assert_eq!(LowestValueAggregator.aggregate(&group).unwrap_err(), StrategyError::EmptyGroup);
        assert_eq!(
            CollectionAggregator::default().aggregate(&group).unwrap_err(),
            StrategyError::EmptyGroup
        );
    }

    #[test]
    fn collection_can_resort_by_sequence() {
        let group = EventGroup::with_members(
            "g",
            [
                Envelope::new("b").with_sequence(1, Some(3)),
                Envelope::new("c"),
                Envelope::new("a").with_sequence(0, Some(3)),
            ],
        );

        let arrival = CollectionAggregator::default().aggregate(&group).unwrap();
        let sorted = CollectionAggregator::new(MemberOrder::Sequence)
            .aggregate(&group)
            .unwrap();

        assert_eq!(arrival.payload().to_string(), "[b, c, a]");
        assert_eq!(sorted.payload().to_string(), "[a, b, c]");
    }

    #[test]
    fn concatenation_joins_payloads() {
        let group = group_of(vec![Payload::from("x"), Payload::Bytes(b"y".to_vec()), Payload::Number(3.0)]);
        let result = ConcatenatingAggregator::new("|").aggregate(&group).unwrap();
        assert_eq!(result.payload(), &Payload::from("x|y|3"));
    }

    proptest! {
        #[test]
        fn lowest_value_selects_minimum(values in proptest::collection::vec(-1.0e6f64..1.0e6, 1..40)) {
            let group = group_of(values.iter().copied().map(Payload::Number).collect());
            let expected = values.iter().copied().fold(f64::INFINITY, f64::min);

            let result = LowestValueAggregator.aggregate(&group).unwrap();
            prop_assert_eq!(result.payload(), &Payload::Number(expected));
        }
    }
}
