//! # Courier Testing
//!
//! Testing utilities for the Courier integration engine.
//!
//! This crate provides:
//! - Deterministic clocks for correlation timeouts
//! - Mock processors (appending, recording, void, stop, failing, panicking)
//! - Mock connectors for one-way and request-response endpoints
//! - Recording exception strategies and instrumented aggregators
//! - A fluent [`ChainTest`] harness
//! - proptest strategies for envelopes and quotes
//!
//! ## Example
//!
//! ```
//! use courier_core::chain::ProcessorChainBuilder;
//! use courier_core::envelope::Envelope;
//! use courier_testing::ChainTest;
//! use courier_testing::processors::AppendingProcessor;
//!
//! let chain = ProcessorChainBuilder::new()
//!     .chain(AppendingProcessor::new("1"))
//!     .chain(AppendingProcessor::new("2"))
//!     .build()
//!     .unwrap();
//!
//! ChainTest::new(chain)
//!     .given(Envelope::new("0"))
//!     .then_text("012")
//!     .run();
//! ```

pub mod connectors;
pub mod processors;
pub mod properties;
pub mod strategies;

/// Mock implementations of Environment traits
pub mod mocks {
    use chrono::{DateTime, Utc};
    use courier_core::environment::Clock;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::mocks::FixedClock;
    /// use courier_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Used to drive correlation timeouts without sleeping.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward
        ///
        /// # Panics
        ///
        /// Panics if `by` does not fit a chrono duration.
        #[allow(clippy::expect_used)]
        pub fn advance(&self, by: Duration) {
            let by = chrono::Duration::from_std(by).expect("duration out of range");
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    /// A manual clock starting at 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn manual_clock() -> ManualClock {
        ManualClock::new(epoch())
    }

    #[allow(clippy::expect_used)]
    fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }
}

/// Install a tracing subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use chain_test::ChainTest;
pub use mocks::{FixedClock, ManualClock, manual_clock, test_clock};
