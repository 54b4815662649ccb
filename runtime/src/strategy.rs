//! Processing strategies.
//!
//! A [`ProcessingStrategy`] decides where a chain's processors run. It applies
//! to the whole chain: [`ProcessingStrategy::configure`] turns a builder into a
//! [`ScheduledChain`] and every member processor then runs under the same
//! policy.
//!
//! | Strategy | Where the chain runs |
//! |---|---|
//! | `Synchronous` | On the calling task, start to finish |
//! | `Asynchronous` | On a [`WorkerPool`] blocking worker |
//! | `NonBlocking` | On the calling task, yielding to the executor between processors |
//!
//! Whatever the strategy, a panicking processor is contained and surfaces as
//! [`ProcessorError::Panicked`].

use crate::error::FlowError;
use crate::pool::WorkerPool;
use courier_core::chain::{ProcessorChain, ProcessorChainBuilder, ProcessorLookup};
use courier_core::envelope::Envelope;
use courier_core::error::{ChainBuildError, ProcessorError};
use courier_core::exception::panic_message;
use courier_core::processor::{Outcome, Processor};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Chain-global scheduling policy
#[derive(Debug, Clone, Default)]
pub enum ProcessingStrategy {
    /// Run on the caller's task
    #[default]
    Synchronous,
    /// Run on a worker pool; one-way callers return immediately
    Asynchronous(WorkerPool),
    /// Run on the caller's task, yielding between processors
    NonBlocking,
}

/// Serializable strategy selector used in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// See [`ProcessingStrategy::Synchronous`]
    #[default]
    Synchronous,
    /// See [`ProcessingStrategy::Asynchronous`]
    Asynchronous,
    /// See [`ProcessingStrategy::NonBlocking`]
    NonBlocking,
}

impl ProcessingStrategy {
    /// Asynchronous strategy with a dedicated pool of `workers`
    #[must_use]
    pub fn asynchronous(workers: usize) -> Self {
        Self::Asynchronous(WorkerPool::new(workers))
    }

    /// Build a strategy from its configured kind
    #[must_use]
    pub fn from_kind(kind: StrategyKind, workers: usize) -> Self {
        match kind {
            StrategyKind::Synchronous => Self::Synchronous,
            StrategyKind::Asynchronous => Self::asynchronous(workers),
            StrategyKind::NonBlocking => Self::NonBlocking,
        }
    }

    /// Strategy name for logs and metrics labels
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous",
            Self::Asynchronous(_) => "asynchronous",
            Self::NonBlocking => "non_blocking",
        }
    }

    /// Check if one-way callers are released before the chain runs
    #[must_use]
    pub const fn is_asynchronous(&self) -> bool {
        matches!(self, Self::Asynchronous(_))
    }

    /// Build the chain and bind it to this strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ChainBuildError`] if the builder holds unresolved references.
    pub fn configure(&self, builder: ProcessorChainBuilder) -> Result<ScheduledChain, ChainBuildError> {
        Ok(self.schedule(builder.build()?))
    }

    /// Like [`configure`](Self::configure), resolving references through
    /// `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainBuildError::UnknownProcessor`] for names `lookup`
    /// cannot resolve.
    pub fn configure_with(
        &self,
        builder: ProcessorChainBuilder,
        lookup: &dyn ProcessorLookup,
    ) -> Result<ScheduledChain, ChainBuildError> {
        Ok(self.schedule(builder.build_with(lookup)?))
    }

    /// Bind an already built chain to this strategy
    #[must_use]
    pub fn schedule(&self, chain: ProcessorChain) -> ScheduledChain {
        tracing::debug!(chain = %chain.name(), strategy = self.name(), processors = chain.len(), "Chain scheduled");
        ScheduledChain {
            chain,
            strategy: self.clone(),
        }
    }
}

/// A chain bound to a [`ProcessingStrategy`]
#[derive(Debug, Clone)]
pub struct ScheduledChain {
    chain: ProcessorChain,
    strategy: ProcessingStrategy,
}

impl ScheduledChain {
    /// The underlying chain
    #[must_use]
    pub const fn chain(&self) -> &ProcessorChain {
        &self.chain
    }

    /// The bound strategy
    #[must_use]
    pub const fn strategy(&self) -> &ProcessingStrategy {
        &self.strategy
    }

    /// Run the chain over `envelope` under the bound strategy.
    ///
    /// # Errors
    ///
    /// Returns the failing processor's [`ProcessorError`], or
    /// [`ProcessorError::Panicked`] if a processor panicked.
    pub async fn execute(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        match &self.strategy {
            ProcessingStrategy::Synchronous => self.execute_inline(envelope),
            ProcessingStrategy::Asynchronous(pool) => self.execute_on(pool, envelope).await,
            ProcessingStrategy::NonBlocking => self.execute_stepwise(envelope).await,
        }
    }

    fn execute_inline(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        catch_unwind(AssertUnwindSafe(|| self.chain.process(envelope)))
            .unwrap_or_else(|panic| Err(self.panicked(&panic_message(panic.as_ref()))))
    }

    async fn execute_on(&self, pool: &WorkerPool, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        let chain = self.chain.clone();
        match pool.run(move || chain.process(envelope)).await {
            Ok(result) => result,
            Err(FlowError::TaskJoin(error)) if error.is_panic() => {
                Err(self.panicked(&panic_message(error.into_panic().as_ref())))
            },
            Err(other) => Err(ProcessorError::transform(self.chain.name(), other.to_string())),
        }
    }

    async fn execute_stepwise(&self, envelope: Envelope) -> Result<Outcome, ProcessorError> {
        let mut run = self.chain.start(envelope);
        loop {
            let step = catch_unwind(AssertUnwindSafe(|| run.step()))
                .unwrap_or_else(|panic| Err(self.panicked(&panic_message(panic.as_ref()))))?;
            if let Some(outcome) = step {
                return Ok(outcome);
            }
            tokio::task::yield_now().await;
        }
    }

    fn panicked(&self, message: &str) -> ProcessorError {
        tracing::error!(chain = %self.chain.name(), panic = %message, "Processor panicked");
        self.chain.statistics().record_error();
        ProcessorError::Panicked {
            processor: self.chain.name().to_string(),
            message: message.to_string(),
        }
    }
}
