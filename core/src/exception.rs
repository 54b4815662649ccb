//! Exception (catch-all) strategies.
//!
//! When a chain or correlator fails, the owning flow hands the envelope and the
//! error to an [`ExceptionStrategy`]. Strategies may log, forward the failure
//! to an error destination, or run a dedicated error chain. Whatever they do,
//! the caller always regains control: use [`handle_safely`] to invoke one.

use crate::chain::ProcessorChain;
use crate::connector::Connector;
use crate::envelope::{Envelope, ErrorInfo};
use crate::error::ProcessorError;
use crate::processor::{Outcome, Processor};
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Fallback handler for failed envelopes
pub trait ExceptionStrategy: Send + Sync {
    /// Handle a failure.
    ///
    /// Returns the envelope to hand back to a request-response caller, usually
    /// the failed envelope with an [`ErrorInfo`] attached, or `None` to
    /// suppress the response.
    fn handle(&self, envelope: Envelope, error: &ProcessorError) -> Option<Envelope>;

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<S: ExceptionStrategy + ?Sized> ExceptionStrategy for std::sync::Arc<S> {
    fn handle(&self, envelope: Envelope, error: &ProcessorError) -> Option<Envelope> {
        (**self).handle(envelope, error)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Attach the error description to the envelope
#[must_use]
pub fn mark_failed(envelope: &Envelope, error: &ProcessorError) -> Envelope {
    envelope.with_error(ErrorInfo::from_error(error))
}

/// Invoke a strategy, containing any panic it raises.
///
/// A panicking strategy is logged and the failed envelope is returned with the
/// original error attached.
pub fn handle_safely(
    strategy: &dyn ExceptionStrategy,
    envelope: Envelope,
    error: &ProcessorError,
) -> Option<Envelope> {
    let fallback = mark_failed(&envelope, error);
    match catch_unwind(AssertUnwindSafe(|| strategy.handle(envelope, error))) {
        Ok(result) => result,
        Err(panic) => {
            tracing::error!(
                strategy = %strategy.name(),
                panic = %panic_message(panic.as_ref()),
                original = %error,
                "Exception strategy panicked"
            );
            Some(fallback)
        },
    }
}

/// Best-effort text of a panic payload
#[must_use]
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Logs the failure and returns the envelope marked as failed
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExceptionStrategy;

impl ExceptionStrategy for LoggingExceptionStrategy {
    fn handle(&self, envelope: Envelope, error: &ProcessorError) -> Option<Envelope> {
        tracing::error!(
            envelope = %envelope.id(),
            correlation_id = ?envelope.correlation_id(),
            kind = error.kind(),
            error = %error,
            "Processing failed"
        );
        Some(mark_failed(&envelope, error))
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Dispatches the failed envelope to an error destination.
///
/// A failing dispatch is logged and swallowed.
pub struct ForwardingExceptionStrategy<C> {
    target: C,
}

impl<C: Connector> ForwardingExceptionStrategy<C> {
    /// Forward failures to `target`
    pub const fn new(target: C) -> Self {
        Self { target }
    }
}

impl<C: Connector> ExceptionStrategy for ForwardingExceptionStrategy<C> {
    fn handle(&self, envelope: Envelope, error: &ProcessorError) -> Option<Envelope> {
        let failed = mark_failed(&envelope, error);
        match self.target.dispatch(&failed) {
            Ok(()) => tracing::warn!(
                envelope = %envelope.id(),
                target = %self.target.name(),
                error = %error,
                "Failed envelope forwarded"
            ),
            Err(dispatch_error) => tracing::error!(
                envelope = %envelope.id(),
                target = %self.target.name(),
                error = %error,
                dispatch_error = %dispatch_error,
                "Could not forward failed envelope"
            ),
        }
        Some(failed)
    }

    fn name(&self) -> &str {
        "forwarding"
    }
}

/// Runs failed envelopes through a dedicated error chain.
///
/// The chain receives the envelope with its [`ErrorInfo`] attached. Its
/// result becomes the response; a `Void` result returns the marked envelope
/// and a `Stop` result suppresses the response.
#[derive(Debug)]
pub struct ChainExceptionStrategy {
    chain: ProcessorChain,
}

impl ChainExceptionStrategy {
    /// Handle failures with `chain`
    #[must_use]
    pub const fn new(chain: ProcessorChain) -> Self {
        Self { chain }
    }
}

impl ExceptionStrategy for ChainExceptionStrategy {
    fn handle(&self, envelope: Envelope, error: &ProcessorError) -> Option<Envelope> {
        let failed = mark_failed(&envelope, error);
        match self.chain.process(failed.clone()) {
            Ok(Outcome::Event(result)) => Some(result),
            Ok(Outcome::Void) => Some(failed),
            Ok(Outcome::Stop) => None,
            Err(chain_error) => {
                tracing::error!(
                    chain = %self.chain.name(),
                    error = %error,
                    chain_error = %chain_error,
                    "Error chain failed"
                );
                Some(failed)
            },
        }
    }

    fn name(&self) -> &str {
        self.chain.name()
    }
}
