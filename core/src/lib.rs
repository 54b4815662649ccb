//! # Courier Core
//!
//! Core types for the Courier integration engine.
//!
//! This crate provides the message-processing engine that routes, transforms and
//! aggregates in-flight messages. It is payload-agnostic and transport-agnostic:
//! connectors are consumed through the [`connector::Connector`] capability and
//! results are emitted to processors that act as sinks.
//!
//! ## Core Concepts
//!
//! - **Envelope**: Immutable payload + metadata flowing through the engine
//! - **Processor**: A single transform/filter/route/dispatch step
//! - **Processor Chain**: An ordered, immutable composition of processors
//! - **Exchange Pattern**: One-way vs. request-response, resolved per connector
//! - **Event Correlator**: Groups related envelopes and aggregates them
//! - **Aggregation Strategy**: Reduces a complete event group into one envelope
//! - **Exception Strategy**: Fallback handler that never lets a failure escape
//!
//! ## Example
//!
//! ```
//! use courier_core::chain::ProcessorChainBuilder;
//! use courier_core::envelope::{Envelope, Payload};
//! use courier_core::processor::{Outcome, Transformer};
//! use courier_core::processor::Processor;
//!
//! let chain = ProcessorChainBuilder::named("greeting")
//!     .chain(Transformer::new("upper", |envelope: Envelope| {
//!         let text = envelope.payload().as_text().unwrap_or_default().to_uppercase();
//!         Ok(envelope.with_payload(Payload::Text(text)))
//!     }))
//!     .build()
//!     .unwrap();
//!
//! let outcome = chain.process(Envelope::new("hello")).unwrap();
//! assert_eq!(
//!     outcome.into_envelope().unwrap().payload(),
//!     &Payload::Text("HELLO".to_string())
//! );
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

pub mod aggregation;
pub mod chain;
pub mod connector;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod exception;
pub mod exchange;
pub mod processor;

pub use aggregation::AggregationStrategy;
pub use chain::{ProcessorChain, ProcessorChainBuilder, ProcessorLookup};
pub use connector::{Connector, OutboundEndpoint};
pub use correlation::{CorrelationContext, EventCorrelator, EventGroup};
pub use envelope::{Envelope, ErrorInfo, Payload, PropertyScope, Sequence};
pub use error::{
    AggregationError, ChainBuildError, CorrelationError, ProcessorError, RoutingError,
    StrategyError,
};
pub use exception::ExceptionStrategy;
pub use exchange::ExchangePattern;
pub use processor::{Outcome, Processor, ProcessorKind};

/// Environment module - Dependency injection traits
///
/// Ambient dependencies such as time are abstracted behind traits and
/// injected into the components that need them, so correlation timeouts can
/// be tested deterministically.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - uses system clock
    /// let clock = SystemClock;
    ///
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time from the operating system
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
