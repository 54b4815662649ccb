//! Processor chains and the chain builder.
//!
//! A [`ProcessorChain`] is an ordered, immutable list of processors. Every
//! invocation walks the list strictly in declaration order on the calling
//! thread; nothing is reordered or fanned out by the chain itself.
//!
//! # Execution
//!
//! Each invocation is a small state machine, exposed as [`ChainRun`]:
//!
//! ```text
//! READY ──step──▶ RUNNING ──step──▶ ... ──▶ COMPLETED (Event | Void | Stop)
//!                    │
//!                    └── processor error ──▶ FAILED
//! ```
//!
//! - `Event` replaces the current envelope.
//! - `Void` keeps the current envelope; the next processor receives the same
//!   envelope the void-returning one did.
//! - `Stop` ends the run immediately with `Stop`.
//! - An error aborts the run; remaining processors are skipped.
//!
//! When the run reaches the end, the result is the current envelope, unless the
//! last processor returned `Void`, is a connector that may return void, and its
//! effective exchange pattern has no response leg. In that case the result is
//! `Void`: the connector's own pattern wins over whatever upstream computed.
//!
//! # Example
//!
//! ```
//! use courier_core::chain::ProcessorChainBuilder;
//! use courier_core::envelope::Envelope;
//! use courier_core::processor::{MessageFilter, Processor, Transformer};
//!
//! let chain = ProcessorChainBuilder::named("quotes")
//!     .chain(MessageFilter::new("has-bank", |e: &Envelope| e.property("bank").is_some()))
//!     .chain(Transformer::new("stamp", |e: Envelope| Ok(e.with_property("seen", true))))
//!     .build()
//!     .unwrap();
//!
//! assert!(chain.process(Envelope::new("q")).unwrap().is_stop());
//! let out = chain.process(Envelope::new("q").with_property("bank", "acme")).unwrap();
//! assert!(out.envelope().unwrap().property("seen").is_some());
//! ```

use crate::envelope::Envelope;
use crate::error::{ChainBuildError, ProcessorError};
use crate::processor::{Outcome, Processor, ProcessorKind};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by all invocations of a chain or endpoint.
///
/// All updates are single atomic increments.
#[derive(Debug, Default)]
pub struct ChainStatistics {
    processed: AtomicU64,
    errors: AtomicU64,
    filtered: AtomicU64,
    voided: AtomicU64,
}

impl ChainStatistics {
    /// Record a completed invocation
    pub fn record_outcome(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Event(_) => &self.processed,
            Outcome::Void => &self.voided,
            Outcome::Stop => &self.filtered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed invocation
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Invocations that produced an envelope
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Invocations that failed
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Invocations that ended in `Stop`
    #[must_use]
    pub fn filtered_count(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    /// Invocations that ended in `Void`
    #[must_use]
    pub fn void_count(&self) -> u64 {
        self.voided.load(Ordering::Relaxed)
    }

    /// Total invocations, successful or not
    #[must_use]
    pub fn total(&self) -> u64 {
        self.processed() + self.error_count() + self.filtered_count() + self.void_count()
    }
}

/// Resolves named processor references at build time
pub trait ProcessorLookup {
    /// Find a processor by name
    fn lookup(&self, name: &str) -> Option<Arc<dyn Processor>>;
}

impl<S: std::hash::BuildHasher> ProcessorLookup for HashMap<String, Arc<dyn Processor>, S> {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Processor>> {
        self.get(name).cloned()
    }
}

/// Immutable ordered composition of processors
#[derive(Clone)]
pub struct ProcessorChain {
    name: Arc<str>,
    processors: Arc<[Arc<dyn Processor>]>,
    stats: Arc<ChainStatistics>,
}

impl ProcessorChain {
    /// Chain name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of processors
    #[must_use]
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Check if the chain has no processors
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Names of the member processors, in order
    pub fn processor_names(&self) -> impl Iterator<Item = &str> {
        self.processors.iter().map(|p| p.name())
    }

    /// Shared statistics for this chain
    #[must_use]
    pub fn statistics(&self) -> Arc<ChainStatistics> {
        Arc::clone(&self.stats)
    }

    /// Start a stepwise run over `envelope`.
    ///
    /// The run owns everything it needs, so it can be moved across tasks
    /// between steps.
    #[must_use]
    pub fn start(&self, envelope: Envelope) -> ChainRun {
        ChainRun {
            name: Arc::clone(&self.name),
            processors: Arc::clone(&self.processors),
            stats: Arc::clone(&self.stats),
            next: 0,
            current: envelope,
            state: ChainState::Ready,
            terminal: None,
        }
    }
}

impl Processor for ProcessorChain {
    fn process(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        let mut run = self.start(envelope);
        loop {
            if let Some(outcome) = run.step()? {
                return Ok(outcome);
            }
        }
    }

    /// A nested chain behaves like its last member for void suppression.
    fn kind(&self) -> ProcessorKind {
        self.processors
            .last()
            .map_or(ProcessorKind::Transformer, |p| p.kind())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ProcessorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorChain")
            .field("name", &self.name)
            .field("processors", &self.processor_names().collect::<Vec<_>>())
            .finish()
    }
}

/// Lifecycle of a single chain invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// No processor has run yet
    Ready,
    /// At least one processor has run
    Running,
    /// The run produced an outcome
    Completed,
    /// A processor failed
    Failed,
}

/// One invocation of a [`ProcessorChain`], advanced one processor at a time
pub struct ChainRun {
    name: Arc<str>,
    processors: Arc<[Arc<dyn Processor>]>,
    stats: Arc<ChainStatistics>,
    next: usize,
    current: Envelope,
    state: ChainState,
    terminal: Option<Result<Outcome, ProcessorError>>,
}

impl ChainRun {
    /// Current state
    #[must_use]
    pub const fn state(&self) -> ChainState {
        self.state
    }

    /// Envelope the next processor will receive
    #[must_use]
    pub const fn current(&self) -> &Envelope {
        &self.current
    }

    /// Check if the run reached a terminal state
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self.state, ChainState::Completed | ChainState::Failed)
    }

    /// Run the next processor.
    ///
    /// Returns `Ok(None)` while processors remain, `Ok(Some(outcome))` once the
    /// run completes. Once finished, further calls return the same result
    /// without running anything.
    ///
    /// # Errors
    ///
    /// Returns the [`ProcessorError`] of the failing processor; the run is then
    /// `Failed`.
    pub fn step(&mut self) -> Result<Option<Outcome>, ProcessorError> {
        if let Some(terminal) = &self.terminal {
            return terminal.clone().map(Some);
        }

        let Some(processor) = self.processors.get(self.next).cloned() else {
            return Ok(Some(self.complete()));
        };
        self.state = ChainState::Running;
        self.next += 1;

        tracing::trace!(chain = %self.name, processor = %processor.name(), step = self.next, "Invoking processor");

        match processor.process(self.current.clone()) {
            Ok(Outcome::Event(envelope)) => self.current = envelope,
            Ok(Outcome::Void) => {},
            Ok(Outcome::Stop) => return Ok(Some(self.finish(Outcome::Stop))),
            Err(error) => return Err(self.fail(error)),
        }

        if self.next == self.processors.len() {
            Ok(Some(self.complete()))
        } else {
            Ok(None)
        }
    }

    fn complete(&mut self) -> Outcome {
        // A one-way tail never answers, whatever it returned
        let suppressed = self
            .processors
            .last()
            .is_some_and(|last| last.kind().suppresses_response(self.current.exchange_pattern()));

        let outcome = if suppressed {
            Outcome::Void
        } else {
            Outcome::Event(self.current.clone())
        };
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: Outcome) -> Outcome {
        self.state = ChainState::Completed;
        self.stats.record_outcome(&outcome);
        let label = match outcome {
            Outcome::Event(_) => "event",
            Outcome::Void => "void",
            Outcome::Stop => "stop",
        };
        metrics::counter!("courier_chain_processed_total", "chain" => self.name.to_string(), "outcome" => label)
            .increment(1);
        self.terminal = Some(Ok(outcome.clone()));
        outcome
    }

    fn fail(&mut self, error: ProcessorError) -> ProcessorError {
        self.state = ChainState::Failed;
        self.stats.record_error();
        metrics::counter!("courier_chain_errors_total", "chain" => self.name.to_string(), "kind" => error.kind())
            .increment(1);
        tracing::debug!(chain = %self.name, step = self.next, error = %error, "Chain aborted");
        self.terminal = Some(Err(error.clone()));
        error
    }
}

impl fmt::Debug for ChainRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainRun")
            .field("chain", &self.name)
            .field("next", &self.next)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

enum Entry {
    Resolved(Arc<dyn Processor>),
    Reference(String),
}

/// Builder for [`ProcessorChain`]
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use std::sync::Arc;
/// use courier_core::chain::ProcessorChainBuilder;
/// use courier_core::envelope::Envelope;
/// use courier_core::processor::{Processor, Transformer};
///
/// let mut registry: HashMap<String, Arc<dyn Processor>> = HashMap::new();
/// registry.insert(
///     "upper".to_string(),
///     Arc::new(Transformer::new("upper", |e: Envelope| {
///         let text = e.payload().to_string().to_uppercase();
///         Ok(e.with_payload(text))
///     })),
/// );
///
/// let chain = ProcessorChainBuilder::named("by-ref")
///     .chain_ref("upper")
///     .build_with(&registry)
///     .unwrap();
/// assert_eq!(chain.len(), 1);
/// ```
#[derive(Default)]
pub struct ProcessorChainBuilder {
    name: Option<String>,
    entries: Vec<Entry>,
}

impl ProcessorChainBuilder {
    /// Create an unnamed builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for a named chain
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            entries: Vec::new(),
        }
    }

    /// Name the chain will carry
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("chain")
    }

    /// Number of entries added so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no processor was added yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a processor
    #[must_use]
    pub fn chain(self, processor: impl Processor + 'static) -> Self {
        self.chain_arc(Arc::new(processor))
    }

    /// Append a shared processor
    #[must_use]
    pub fn chain_arc(mut self, processor: Arc<dyn Processor>) -> Self {
        self.entries.push(Entry::Resolved(processor));
        self
    }

    /// Append several shared processors
    #[must_use]
    pub fn chain_all(mut self, processors: impl IntoIterator<Item = Arc<dyn Processor>>) -> Self {
        self.entries
            .extend(processors.into_iter().map(Entry::Resolved));
        self
    }

    /// Append a named reference, resolved by [`build_with`](Self::build_with)
    #[must_use]
    pub fn chain_ref(mut self, name: impl Into<String>) -> Self {
        self.entries.push(Entry::Reference(name.into()));
        self
    }

    /// Build a chain that contains no references
    ///
    /// # Errors
    ///
    /// Returns [`ChainBuildError::UnresolvedReference`] if a reference was added.
    pub fn build(self) -> Result<ProcessorChain, ChainBuildError> {
        let name = self.name().to_string();
        let processors = self
            .entries
            .into_iter()
            .map(|entry| match entry {
                Entry::Resolved(processor) => Ok(processor),
                Entry::Reference(name) => Err(ChainBuildError::UnresolvedReference { name }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::assemble(name, processors))
    }

    /// Build a chain, resolving references through `lookup`
    ///
    /// # Errors
    ///
    /// Returns [`ChainBuildError::UnknownProcessor`] for the first reference
    /// the lookup cannot resolve.
    pub fn build_with(self, lookup: &dyn ProcessorLookup) -> Result<ProcessorChain, ChainBuildError> {
        let name = self.name().to_string();
        let processors = self
            .entries
            .into_iter()
            .map(|entry| match entry {
                Entry::Resolved(processor) => Ok(processor),
                Entry::Reference(name) => lookup
                    .lookup(&name)
                    .ok_or(ChainBuildError::UnknownProcessor { name }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::assemble(name, processors))
    }

    fn assemble(name: String, processors: Vec<Arc<dyn Processor>>) -> ProcessorChain {
        tracing::debug!(chain = %name, processors = processors.len(), "Chain built");
        ProcessorChain {
            name: name.into(),
            processors: processors.into(),
            stats: Arc::new(ChainStatistics::default()),
        }
    }
}

impl fmt::Debug for ProcessorChainBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorChainBuilder")
            .field("name", &self.name())
            .field("entries", &self.entries.len())
            .finish()
    }
}
