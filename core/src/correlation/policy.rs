//! Completion and eviction policies.
//!
//! Whether a group is complete, and what happens to a group that times out,
//! are both explicit configuration. Nothing is inferred from the envelopes
//! beyond the expected group size.

use super::EventGroup;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding when a group is ready to aggregate
type CompletionFn = dyn Fn(&EventGroup) -> bool + Send + Sync;

/// Decides when a group is complete
#[derive(Clone, Default)]
pub enum CompletionPolicy {
    /// Complete once the member count reaches the expected size.
    ///
    /// A group whose size is unknown never completes this way and only
    /// closes on timeout.
    #[default]
    ExpectedSize,
    /// Complete on the first arrival
    FirstArrival,
    /// Never complete on arrival; the group is aggregated when it times out
    TimeoutOnly,
    /// Caller-supplied predicate
    Custom(Arc<CompletionFn>),
}

impl CompletionPolicy {
    /// Wrap a custom predicate
    pub fn custom(predicate: impl Fn(&EventGroup) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(predicate))
    }

    /// Check whether `group` should be aggregated now
    #[must_use]
    pub fn should_aggregate(&self, group: &EventGroup) -> bool {
        match self {
            Self::ExpectedSize => group.has_expected_members(),
            Self::FirstArrival => !group.is_empty(),
            Self::TimeoutOnly => false,
            Self::Custom(predicate) => predicate(group),
        }
    }

    /// Whether a timed-out group counts as complete rather than evicted
    #[must_use]
    pub const fn completes_on_timeout(&self) -> bool {
        matches!(self, Self::TimeoutOnly)
    }
}

impl fmt::Debug for CompletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpectedSize => f.write_str("ExpectedSize"),
            Self::FirstArrival => f.write_str("FirstArrival"),
            Self::TimeoutOnly => f.write_str("TimeoutOnly"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Configurable subset of [`CompletionPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// See [`CompletionPolicy::ExpectedSize`]
    #[default]
    ExpectedSize,
    /// See [`CompletionPolicy::FirstArrival`]
    FirstArrival,
    /// See [`CompletionPolicy::TimeoutOnly`]
    TimeoutOnly,
}

impl From<CompletionMode> for CompletionPolicy {
    fn from(mode: CompletionMode) -> Self {
        match mode {
            CompletionMode::ExpectedSize => Self::ExpectedSize,
            CompletionMode::FirstArrival => Self::FirstArrival,
            CompletionMode::TimeoutOnly => Self::TimeoutOnly,
        }
    }
}

/// What happens to a group that times out before completing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Drop the group silently (a warning is logged)
    Discard,
    /// Route a timeout failure to the exception strategy
    #[default]
    Fail,
    /// Aggregate whatever arrived and forward it to the expiry listener
    ForwardPartial,
}

/// Serializable correlator settings.
///
/// ```
/// use courier_core::correlation::{CorrelatorConfig, EvictionPolicy};
///
/// let config: CorrelatorConfig = serde_json::from_str(
///     r#"{ "timeout_ms": 3000, "eviction": "forward_partial" }"#,
/// ).unwrap();
/// assert_eq!(config.eviction, EvictionPolicy::ForwardPartial);
/// assert_eq!(config.max_processed_groups, 50_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Group timeout in milliseconds; `None` means groups never expire
    pub timeout_ms: Option<u64>,
    /// When groups complete
    pub completion: CompletionMode,
    /// What happens to groups that time out
    pub eviction: EvictionPolicy,
    /// Sweep expired groups on every arrival
    pub lazy_expiry: bool,
    /// How many completed correlation ids to remember for late-arrival detection
    pub max_processed_groups: usize,
}

/// Default size of the processed-groups memory
pub const DEFAULT_MAX_PROCESSED_GROUPS: usize = 50_000;

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            completion: CompletionMode::default(),
            eviction: EvictionPolicy::default(),
            lazy_expiry: false,
            max_processed_groups: DEFAULT_MAX_PROCESSED_GROUPS,
        }
    }
}

impl CorrelatorConfig {
    /// Group timeout as a [`Duration`]
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    #[test]
    fn policies_evaluate_groups() {
        let mut group = EventGroup::new("g", Some(2), chrono::Utc::now());
        group.push(Envelope::new(1.0));

        assert!(!CompletionPolicy::ExpectedSize.should_aggregate(&group));
        assert!(CompletionPolicy::FirstArrival.should_aggregate(&group));
        assert!(!CompletionPolicy::TimeoutOnly.should_aggregate(&group));
        assert!(CompletionPolicy::custom(|g| g.correlation_id() == "g").should_aggregate(&group));
    }

    #[test]
    fn only_timeout_only_completes_on_timeout() {
        assert!(CompletionPolicy::TimeoutOnly.completes_on_timeout());
        assert!(!CompletionPolicy::ExpectedSize.completes_on_timeout());
    }

    #[test]
    fn config_defaults() {
        let config = CorrelatorConfig::default();
        assert_eq!(config.timeout(), None);
        assert_eq!(config.completion, CompletionMode::ExpectedSize);
        assert_eq!(config.eviction, EvictionPolicy::Fail);
    }
}
