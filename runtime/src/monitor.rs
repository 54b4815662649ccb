//! Correlation timeouts and asynchronous replies.
//!
//! [`EventCorrelator::expire_groups`] is a plain synchronous sweep. The
//! monitor runs it on an interval so groups that never complete are evicted
//! even when no further envelopes arrive. [`await_aggregate`] lets a caller
//! wait for a group's aggregate with a deadline.

use crate::error::FlowError;
use courier_core::correlation::EventCorrelator;
use courier_core::envelope::Envelope;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default sweep interval
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// Handle to a running timeout monitor.
///
/// The task stops when the handle is dropped, when [`stop`](Self::stop) is
/// called, or when the correlator itself is dropped.
#[derive(Debug)]
pub struct TimeoutMonitor {
    handle: JoinHandle<()>,
}

impl TimeoutMonitor {
    /// Stop the monitor
    pub fn stop(self) {
        drop(self);
    }

    /// Check if the monitor task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TimeoutMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Sweep `correlator` for expired groups every `interval`.
///
/// Must be called from within a tokio runtime.
#[must_use = "the monitor stops when its handle is dropped"]
pub fn spawn_timeout_monitor(correlator: &Arc<EventCorrelator>, interval: Duration) -> TimeoutMonitor {
    let correlator: Weak<EventCorrelator> = Arc::downgrade(correlator);
    let interval = interval.max(Duration::from_millis(1));

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let Some(correlator) = correlator.upgrade() else {
                tracing::debug!("Correlator dropped, stopping timeout monitor");
                break;
            };
            let evicted = correlator.expire_groups();
            if evicted > 0 {
                tracing::debug!(correlator = %correlator.name(), evicted, "Expired correlation groups");
            }
        }
    });

    TimeoutMonitor { handle }
}

/// Wait for the aggregate of `correlation_id`, at most `timeout`.
///
/// The subscription is registered when this function is called, before the
/// returned future is first polled, so call it before the completing
/// envelope is correlated.
///
/// # Errors
///
/// - [`FlowError::Timeout`] if the deadline passes first
/// - [`FlowError::ChannelClosed`] if the group failed or was discarded
pub fn await_aggregate(
    correlator: &EventCorrelator,
    correlation_id: &str,
    timeout: Duration,
) -> impl Future<Output = Result<Envelope, FlowError>> + Send + use<> {
    let correlation_id = correlation_id.to_string();
    let receiver = correlator.subscribe(correlation_id.clone());

    async move {
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(aggregate)) => Ok(aggregate),
            Ok(Err(_)) => Err(FlowError::ChannelClosed),
            Err(_) => {
                tracing::debug!(correlation_id = %correlation_id, ?timeout, "Gave up waiting for aggregate");
                Err(FlowError::Timeout)
            },
        }
    }
}
