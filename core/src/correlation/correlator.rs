//! The event correlator.

use super::{
    CompletionPolicy, CorrelationContext, CorrelatorConfig, DEFAULT_MAX_PROCESSED_GROUPS,
    EnvelopeInfoMapping, EventGroup, EvictionPolicy, MessageInfoMapping,
};
use crate::aggregation::AggregationStrategy;
use crate::envelope::Envelope;
use crate::environment::{Clock, SystemClock};
use crate::error::{AggregationError, CorrelationError, ProcessorError, StrategyError};
use crate::exception::{ExceptionStrategy, LoggingExceptionStrategy, handle_safely, panic_message};
use crate::processor::Processor;
use std::collections::hash_map::{Entry, RandomState};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::BuildHasher;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

const SHARDS: usize = 16;

type GroupIndex = HashMap<String, EventGroup>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded FIFO of recently completed correlation ids
#[derive(Debug)]
struct ProcessedGroups {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl ProcessedGroups {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn remember(&mut self, id: &str) {
        if self.capacity == 0 || self.ids.contains(id) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
    }

    fn forget(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|remembered| remembered != id);
        }
    }
}

/// Counters describing a correlator's activity
#[derive(Debug, Default)]
pub struct CorrelatorStatistics {
    received: AtomicU64,
    aggregations: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
    late_arrivals: AtomicU64,
    active: AtomicU64,
}

impl CorrelatorStatistics {
    /// Envelopes accepted for correlation
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Successful aggregations
    #[must_use]
    pub fn aggregations(&self) -> u64 {
        self.aggregations.load(Ordering::Relaxed)
    }

    /// Failed aggregations
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Groups evicted by timeout
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Envelopes dropped because their group was already aggregated
    #[must_use]
    pub fn late_arrivals(&self) -> u64 {
        self.late_arrivals.load(Ordering::Relaxed)
    }

    /// Groups currently collecting members
    #[must_use]
    pub fn active_groups(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Collects correlated envelopes into groups and aggregates complete groups.
///
/// Each flow owns its own correlator; there is no process-wide index.
///
/// # Example
///
/// ```
/// use courier_core::aggregation::LowestValueAggregator;
/// use courier_core::correlation::{CorrelationContext, EventCorrelator};
/// use courier_core::envelope::{Envelope, Payload};
///
/// let correlator = EventCorrelator::builder(LowestValueAggregator).build();
/// let ctx = CorrelationContext::new();
///
/// for (i, quote) in [0.07, 0.05].into_iter().enumerate() {
///     let envelope = Envelope::new(quote).with_correlation_id("loan-1").with_sequence(i, Some(3));
///     assert!(correlator.correlate(envelope, &ctx).unwrap().is_none());
/// }
///
/// let last = Envelope::new(0.09).with_correlation_id("loan-1").with_sequence(2, Some(3));
/// let best = correlator.correlate(last, &ctx).unwrap().unwrap();
/// assert_eq!(best.payload(), &Payload::Number(0.05));
/// ```
pub struct EventCorrelator {
    name: String,
    shards: Box<[Mutex<GroupIndex>]>,
    hasher: RandomState,
    processed: Mutex<ProcessedGroups>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<Envelope>>>>,
    strategy: Arc<dyn AggregationStrategy>,
    completion: CompletionPolicy,
    eviction: EvictionPolicy,
    timeout: Option<Duration>,
    lazy_expiry: bool,
    mapping: Arc<dyn MessageInfoMapping>,
    clock: Arc<dyn Clock>,
    exception_strategy: Arc<dyn ExceptionStrategy>,
    expiry_listener: Option<Arc<dyn Processor>>,
    stats: CorrelatorStatistics,
}

impl EventCorrelator {
    /// Start building a correlator around an aggregation strategy
    pub fn builder(strategy: impl AggregationStrategy + 'static) -> EventCorrelatorBuilder {
        EventCorrelatorBuilder::new(Arc::new(strategy))
    }

    /// Start building a correlator around a shared aggregation strategy
    #[must_use]
    pub fn builder_shared(strategy: Arc<dyn AggregationStrategy>) -> EventCorrelatorBuilder {
        EventCorrelatorBuilder::new(strategy)
    }

    /// Correlator name, used in logs and metrics
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured group timeout
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Activity counters
    #[must_use]
    pub const fn statistics(&self) -> &CorrelatorStatistics {
        &self.stats
    }

    /// Number of groups currently collecting members
    #[must_use]
    pub fn active_groups(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    /// Copy of an active group, if present
    #[must_use]
    pub fn group_snapshot(&self, correlation_id: &str) -> Option<EventGroup> {
        lock(self.shard(correlation_id)).get(correlation_id).cloned()
    }

    /// Whether `correlation_id` was recently aggregated
    #[must_use]
    pub fn is_processed(&self, correlation_id: &str) -> bool {
        lock(&self.processed).contains(correlation_id)
    }

    /// Register interest in the aggregate of `correlation_id`.
    ///
    /// The receiver resolves when the group is aggregated, including
    /// aggregation of a partial group on timeout. It is closed without a value
    /// if the group fails or is evicted. Subscribe before the group completes.
    ///
    /// Senders whose receiver was dropped (a caller that stopped waiting) are
    /// pruned on every subscription.
    pub fn subscribe(&self, correlation_id: impl Into<String>) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = lock(&self.waiters);
        waiters.retain(|_, senders| {
            senders.retain(|sender| !sender.is_closed());
            !senders.is_empty()
        });
        waiters.entry(correlation_id.into()).or_default().push(tx);
        rx
    }

    /// Number of correlation ids with at least one pending subscriber
    #[must_use]
    pub fn pending_subscriptions(&self) -> usize {
        lock(&self.waiters).len()
    }

    /// Add an envelope to its group.
    ///
    /// Returns `Ok(Some(aggregate))` if this arrival completed the group,
    /// `Ok(None)` if the group is still collecting or the envelope arrived
    /// after its group was already aggregated.
    ///
    /// # Errors
    ///
    /// - [`CorrelationError::MissingCorrelationId`] if no correlation id is
    ///   available from the context or the envelope
    /// - [`CorrelationError::Aggregation`] if the strategy failed or panicked;
    ///   the group is discarded, the failure is also handed to the exception
    ///   strategy, and a later envelope with the same id starts a new one
    pub fn correlate(
        &self,
        envelope: Envelope,
        context: &CorrelationContext,
    ) -> Result<Option<Envelope>, CorrelationError> {
        if self.lazy_expiry {
            self.expire_groups();
        }

        let Some(correlation_id) = context
            .correlation_id
            .clone()
            .or_else(|| self.mapping.correlation_id(&envelope))
        else {
            return Err(CorrelationError::MissingCorrelationId {
                envelope_id: envelope.id().to_string(),
            });
        };
        let expected = context
            .expected_size
            .or_else(|| self.mapping.group_size(&envelope));
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let Some(group) = self.append(&correlation_id, expected, envelope.clone()) else {
            return Ok(None);
        };

        match self.aggregate(&group) {
            Ok(aggregate) => {
                self.record_aggregation(&group, &aggregate);
                Ok(Some(aggregate))
            },
            Err(source) => {
                let error = CorrelationError::from(self.record_failure(group, envelope.clone(), source));
                handle_safely(&*self.exception_strategy, envelope, &ProcessorError::Correlation(error.clone()));
                Err(error)
            },
        }
    }

    /// Run the strategy, turning a panic into a [`StrategyError`]
    fn aggregate(&self, group: &EventGroup) -> Result<Envelope, StrategyError> {
        catch_unwind(AssertUnwindSafe(|| self.strategy.aggregate(group))).unwrap_or_else(|panic| {
            Err(StrategyError::Failed(format!(
                "strategy panicked: {}",
                panic_message(panic.as_ref())
            )))
        })
    }

    /// Add the envelope under the group's lock. Returns the removed group if
    /// this arrival completed it.
    fn append(&self, correlation_id: &str, expected: Option<usize>, envelope: Envelope) -> Option<EventGroup> {
        let mut groups = lock(self.shard(correlation_id));

        if lock(&self.processed).contains(correlation_id) {
            self.stats.late_arrivals.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("courier_correlator_late_arrivals_total", "correlator" => self.name.clone())
                .increment(1);
            tracing::warn!(
                correlator = %self.name,
                correlation_id,
                envelope = %envelope.id(),
                "Envelope arrived for an already aggregated group; dropping it"
            );
            return None;
        }

        let group = match groups.entry(correlation_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.stats.active.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(correlator = %self.name, correlation_id, expected = ?expected, "Event group created");
                entry.insert(EventGroup::new(correlation_id, expected, self.clock.now()))
            },
        };
        group.learn_expected_size(expected);
        group.push(envelope);
        tracing::trace!(
            correlator = %self.name,
            correlation_id,
            members = group.len(),
            expected = ?group.expected_size(),
            "Envelope added to group"
        );

        if !self.completion.should_aggregate(group) {
            return None;
        }

        let mut completed = groups.remove(correlation_id)?;
        completed.mark_completed();
        lock(&self.processed).remember(correlation_id);
        drop(groups);

        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.publish_active_gauge();
        Some(completed)
    }

    /// Evict every group older than the configured timeout.
    ///
    /// With [`CompletionPolicy::TimeoutOnly`] the expired groups are
    /// aggregated and handed to the expiry listener. Otherwise the
    /// [`EvictionPolicy`] decides: discard, route a timeout failure to the
    /// exception strategy, or aggregate the partial group for the listener.
    ///
    /// Returns the number of groups removed. Does nothing without a timeout.
    pub fn expire_groups(&self) -> usize {
        let Some(timeout) = self.timeout else {
            return 0;
        };
        let now = self.clock.now();
        let completes = self.completion.completes_on_timeout();

        let mut expired = Vec::new();
        for shard in &self.shards {
            let mut groups = lock(shard);
            let ids: Vec<String> = groups
                .iter()
                .filter(|(_, group)| group.is_expired(now, timeout))
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                if let Some(mut group) = groups.remove(&id) {
                    if completes {
                        group.mark_completed();
                        lock(&self.processed).remember(&id);
                    }
                    expired.push(group);
                }
            }
        }

        let count = expired.len();
        if count == 0 {
            return 0;
        }
        self.stats.active.fetch_sub(count as u64, Ordering::Relaxed);
        self.publish_active_gauge();

        for group in expired {
            self.handle_expired(group);
        }
        count
    }

    fn handle_expired(&self, group: EventGroup) {
        if self.completion.completes_on_timeout() {
            tracing::debug!(correlator = %self.name, correlation_id = %group.correlation_id(), members = group.len(), "Group closed by timeout");
            self.forward(group);
            return;
        }

        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        let policy = match self.eviction {
            EvictionPolicy::Discard => "discard",
            EvictionPolicy::Fail => "fail",
            EvictionPolicy::ForwardPartial => "forward_partial",
        };
        metrics::counter!("courier_correlator_evictions_total", "correlator" => self.name.clone(), "policy" => policy)
            .increment(1);
        tracing::warn!(
            correlator = %self.name,
            correlation_id = %group.correlation_id(),
            received = group.len(),
            expected = ?group.expected_size(),
            policy,
            "Event group timed out"
        );

        match self.eviction {
            EvictionPolicy::Discard => self.close_waiters(group.correlation_id()),
            EvictionPolicy::Fail => {
                self.close_waiters(group.correlation_id());
                let Some(last) = group.last().cloned() else {
                    return;
                };
                let error = CorrelationError::Timeout {
                    correlation_id: group.correlation_id().to_string(),
                    received: group.len(),
                    expected: group.expected_size(),
                    group: Box::new(group),
                };
                handle_safely(&*self.exception_strategy, last, &ProcessorError::Correlation(error));
            },
            EvictionPolicy::ForwardPartial => self.forward(group),
        }
    }

    /// Aggregate an expired group and hand the result to the expiry listener
    fn forward(&self, group: EventGroup) {
        let Some(last) = group.last().cloned() else {
            self.close_waiters(group.correlation_id());
            return;
        };

        let aggregate = match self.aggregate(&group) {
            Ok(aggregate) => aggregate,
            Err(source) => {
                let error = self.record_failure(group, last.clone(), source);
                handle_safely(&*self.exception_strategy, last, &ProcessorError::Correlation(error.into()));
                return;
            },
        };
        self.record_aggregation(&group, &aggregate);

        let Some(listener) = &self.expiry_listener else {
            tracing::debug!(correlator = %self.name, correlation_id = %group.correlation_id(), "No expiry listener; aggregate only delivered to subscribers");
            return;
        };
        if let Err(error) = listener.process(aggregate.clone()) {
            handle_safely(&*self.exception_strategy, aggregate, &error);
        }
    }

    fn record_aggregation(&self, group: &EventGroup, aggregate: &Envelope) {
        self.stats.aggregations.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_correlator_aggregations_total", "correlator" => self.name.clone())
            .increment(1);
        tracing::info!(
            correlator = %self.name,
            correlation_id = %group.correlation_id(),
            members = group.len(),
            strategy = %self.strategy.name(),
            "Event group aggregated"
        );

        let waiters = lock(&self.waiters).remove(group.correlation_id());
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(aggregate.clone());
        }
    }

    fn record_failure(&self, group: EventGroup, last: Envelope, source: StrategyError) -> AggregationError {
        let correlation_id = group.correlation_id().to_string();
        lock(&self.processed).forget(&correlation_id);
        self.close_waiters(&correlation_id);
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_correlator_aggregation_failures_total", "correlator" => self.name.clone())
            .increment(1);
        tracing::error!(
            correlator = %self.name,
            correlation_id = %correlation_id,
            members = group.len(),
            strategy = %self.strategy.name(),
            error = %source,
            "Aggregation failed; group discarded"
        );
        AggregationError {
            correlation_id,
            group: Box::new(group),
            last,
            source,
        }
    }

    fn close_waiters(&self, correlation_id: &str) {
        lock(&self.waiters).remove(correlation_id);
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_active_gauge(&self) {
        metrics::gauge!("courier_correlator_groups_active", "correlator" => self.name.clone())
            .set(self.stats.active_groups() as f64);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shard(&self, correlation_id: &str) -> &Mutex<GroupIndex> {
        let index = (self.hasher.hash_one(correlation_id) % self.shards.len() as u64) as usize;
        &self.shards[index]
    }
}

impl fmt::Debug for EventCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCorrelator")
            .field("name", &self.name)
            .field("strategy", &self.strategy.name())
            .field("completion", &self.completion)
            .field("eviction", &self.eviction)
            .field("timeout", &self.timeout)
            .field("active_groups", &self.stats.active_groups())
            .finish_non_exhaustive()
    }
}

/// Builder for [`EventCorrelator`]
pub struct EventCorrelatorBuilder {
    name: String,
    strategy: Arc<dyn AggregationStrategy>,
    completion: CompletionPolicy,
    eviction: EvictionPolicy,
    timeout: Option<Duration>,
    lazy_expiry: bool,
    max_processed_groups: usize,
    mapping: Arc<dyn MessageInfoMapping>,
    clock: Arc<dyn Clock>,
    exception_strategy: Arc<dyn ExceptionStrategy>,
    expiry_listener: Option<Arc<dyn Processor>>,
}

impl EventCorrelatorBuilder {
    fn new(strategy: Arc<dyn AggregationStrategy>) -> Self {
        Self {
            name: "correlator".to_string(),
            strategy,
            completion: CompletionPolicy::default(),
            eviction: EvictionPolicy::default(),
            timeout: None,
            lazy_expiry: false,
            max_processed_groups: DEFAULT_MAX_PROCESSED_GROUPS,
            mapping: Arc::new(EnvelopeInfoMapping),
            clock: Arc::new(SystemClock),
            exception_strategy: Arc::new(LoggingExceptionStrategy),
            expiry_listener: None,
        }
    }

    /// Name for logs and metrics
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Completion policy (default: expected size)
    #[must_use]
    pub fn completion(mut self, completion: CompletionPolicy) -> Self {
        self.completion = completion;
        self
    }

    /// Eviction policy for timed-out groups (default: fail)
    #[must_use]
    pub const fn eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    /// Group timeout (default: none, groups never expire)
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sweep expired groups on every arrival
    #[must_use]
    pub const fn lazy_expiry(mut self, lazy_expiry: bool) -> Self {
        self.lazy_expiry = lazy_expiry;
        self
    }

    /// Size of the processed-groups memory
    #[must_use]
    pub const fn max_processed_groups(mut self, max: usize) -> Self {
        self.max_processed_groups = max;
        self
    }

    /// How correlation ids and sizes are extracted
    #[must_use]
    pub fn mapping(mut self, mapping: impl MessageInfoMapping + 'static) -> Self {
        self.mapping = Arc::new(mapping);
        self
    }

    /// Clock used for group ages
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Strategy receiving aggregation, timeout and expiry failures
    /// (default: logging)
    #[must_use]
    pub fn exception_strategy(mut self, strategy: Arc<dyn ExceptionStrategy>) -> Self {
        self.exception_strategy = strategy;
        self
    }

    /// Processor receiving aggregates produced on timeout
    #[must_use]
    pub fn expiry_listener(mut self, listener: Arc<dyn Processor>) -> Self {
        self.expiry_listener = Some(listener);
        self
    }

    /// Apply serialized settings
    #[must_use]
    pub fn config(mut self, config: &CorrelatorConfig) -> Self {
        self.completion = config.completion.into();
        self.eviction = config.eviction;
        self.timeout = config.timeout();
        self.lazy_expiry = config.lazy_expiry;
        self.max_processed_groups = config.max_processed_groups;
        self
    }

    /// Build the correlator
    #[must_use]
    pub fn build(self) -> EventCorrelator {
        EventCorrelator {
            name: self.name,
            shards: (0..SHARDS).map(|_| Mutex::new(GroupIndex::new())).collect(),
            hasher: RandomState::new(),
            processed: Mutex::new(ProcessedGroups::new(self.max_processed_groups)),
            waiters: Mutex::new(HashMap::new()),
            strategy: self.strategy,
            completion: self.completion,
            eviction: self.eviction,
            timeout: self.timeout,
            lazy_expiry: self.lazy_expiry,
            mapping: self.mapping,
            clock: self.clock,
            exception_strategy: self.exception_strategy,
            expiry_listener: self.expiry_listener,
            stats: CorrelatorStatistics::default(),
        }
    }
}

impl fmt::Debug for EventCorrelatorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCorrelatorBuilder")
            .field("name", &self.name)
            .field("completion", &self.completion)
            .field("eviction", &self.eviction)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
