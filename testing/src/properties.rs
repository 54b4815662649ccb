//! proptest strategies for engine types.

use courier_core::envelope::{Envelope, Payload};
use proptest::prelude::*;

/// Arbitrary scalar payloads
pub fn payload() -> impl Strategy<Value = Payload> {
    prop_oneof![
        Just(Payload::Empty),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Payload::Text),
        proptest::collection::vec(any::<u8>(), 0..16).prop_map(Payload::Bytes),
        (-1.0e9f64..1.0e9).prop_map(Payload::Number),
    ]
}

/// Interest-rate-like quotes in `(0, 1)`
pub fn quote_values(max: usize) -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(0.0001f64..0.9999, 1..=max.max(1))
}

/// A complete group of quote envelopes sharing `correlation_id`, each
/// declaring its position and the group size
pub fn quote_group(correlation_id: &str, max: usize) -> impl Strategy<Value = Vec<Envelope>> {
    let correlation_id = correlation_id.to_string();
    quote_values(max).prop_map(move |values| {
        let total = values.len();
        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                Envelope::new(value)
                    .with_correlation_id(correlation_id.clone())
                    .with_sequence(index, Some(total))
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn quote_groups_are_consistent(group in quote_group("g", 8)) {
            let total = group.len();
            for (index, envelope) in group.iter().enumerate() {
                prop_assert_eq!(envelope.correlation_id(), Some("g"));
                prop_assert_eq!(envelope.sequence().map(|s| s.index), Some(index));
                prop_assert_eq!(envelope.group_size(), Some(total));
            }
        }

        #[test]
        fn payload_display_never_panics(p in payload()) {
            let _ = p.to_string();
        }
    }
}
