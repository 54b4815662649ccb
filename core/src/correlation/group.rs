//! Event groups: envelopes sharing a correlation id, pending aggregation.

use crate::envelope::Envelope;
use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use std::time::Duration;

/// Accumulator of correlated envelopes.
///
/// Owned by the [`EventCorrelator`](super::EventCorrelator) while active and only
/// mutated under the lock guarding its correlation id. Strategies receive the
/// group by shared reference after it has been removed from the index, so
/// the member list they see never changes underneath them.
#[derive(Debug, Clone)]
pub struct EventGroup {
    correlation_id: String,
    members: SmallVec<[Envelope; 4]>,
    created_at: DateTime<Utc>,
    expected_size: Option<usize>,
    completed: bool,
}

impl EventGroup {
    /// Create an empty group
    #[must_use]
    pub fn new(
        correlation_id: impl Into<String>,
        expected_size: Option<usize>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            members: SmallVec::new(),
            created_at,
            expected_size,
            completed: false,
        }
    }

    /// Create a group from existing members, e.g. in tests or custom routers
    #[must_use]
    pub fn with_members(
        correlation_id: impl Into<String>,
        members: impl IntoIterator<Item = Envelope>,
    ) -> Self {
        let mut group = Self::new(correlation_id, None, Utc::now());
        group.members.extend(members);
        group
    }

    /// Correlation id shared by all members
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Members in arrival order
    #[must_use]
    pub fn members(&self) -> &[Envelope] {
        &self.members
    }

    /// Iterate over members in arrival order
    pub fn iter(&self) -> std::slice::Iter<'_, Envelope> {
        self.members.iter()
    }

    /// Number of members received
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if the group has no members
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Most recently arrived member
    #[must_use]
    pub fn last(&self) -> Option<&Envelope> {
        self.members.last()
    }

    /// Expected number of members (`None` = unknown)
    #[must_use]
    pub const fn expected_size(&self) -> Option<usize> {
        self.expected_size
    }

    /// When the first member arrived
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the group was closed by completion
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.completed
    }

    /// Whether the member count reached the expected size
    #[must_use]
    pub fn has_expected_members(&self) -> bool {
        self.expected_size.is_some_and(|expected| self.members.len() >= expected)
    }

    /// Whether the group is older than `timeout` at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        chrono::Duration::from_std(timeout)
            .is_ok_and(|timeout| now.signed_duration_since(self.created_at) >= timeout)
    }

    pub(crate) fn push(&mut self, envelope: Envelope) {
        self.members.push(envelope);
    }

    pub(crate) fn learn_expected_size(&mut self, expected_size: Option<usize>) {
        if self.expected_size.is_none() {
            self.expected_size = expected_size;
        }
    }

    pub(crate) fn mark_completed(&mut self) {
        self.completed = true;
    }
}

impl<'a> IntoIterator for &'a EventGroup {
    type Item = &'a Envelope;
    type IntoIter = std::slice::Iter<'a, Envelope>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}
