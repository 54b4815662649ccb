//! Correlation running inside flows, with background eviction and
//! asynchronous replies.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use courier_core::aggregation::LowestValueAggregator;
use courier_core::chain::ProcessorChainBuilder;
use courier_core::correlation::{AggregatingRouter, CorrelationContext, EventCorrelator, EvictionPolicy};
use courier_core::envelope::{Envelope, Payload};
use courier_runtime::{
    Flow, FlowError, FlowResponse, ProcessingStrategy, RetryPolicy, await_aggregate, spawn_timeout_monitor,
};
use courier_testing::init_test_tracing;
use courier_testing::manual_clock;
use courier_testing::processors::RecordingProcessor;
use courier_testing::strategies::{CountingAggregator, FailingAggregator, RecordingExceptionStrategy};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn quote(loan: &str, rate: f64, banks: usize) -> Envelope {
    Envelope::new(rate).with_correlation_id(loan).with_group_size(banks)
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn loan_broker_picks_the_best_quote() {
    init_test_tracing();

    let correlator = Arc::new(EventCorrelator::builder(LowestValueAggregator).name("quotes").build());
    let flow = Flow::builder(
        "loan-broker",
        ProcessorChainBuilder::new().chain(AggregatingRouter::new(Arc::clone(&correlator))),
    )
    .processing_strategy(ProcessingStrategy::asynchronous(4))
    .build()
    .unwrap();

    let best = await_aggregate(&correlator, "loan-1", Duration::from_secs(2));

    let mut handles = Vec::new();
    for rate in [0.07, 0.05, 0.09] {
        let flow = flow.clone();
        handles.push(tokio::spawn(async move { flow.process(quote("loan-1", rate, 3)).await }));
    }

    let mut replies = Vec::new();
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            FlowResponse::Reply(reply) => replies.push(reply),
            FlowResponse::Filtered => {},
            other => panic!("unexpected response {other:?}"),
        }
    }

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].payload(), &Payload::Number(0.05));
    assert_eq!(replies[0].correlation_id(), Some("loan-1"));

    let best = best.await.unwrap();
    assert_eq!(best.payload(), &Payload::Number(0.05));
    assert_eq!(correlator.active_groups(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_arrivals_aggregate_each_group_once() {
    const GROUPS: usize = 25;
    const MEMBERS: usize = 8;

    let counting = Arc::new(CountingAggregator::new(LowestValueAggregator));
    let correlator = Arc::new(EventCorrelator::builder_shared(counting.clone()).name("race").build());

    let mut handles = Vec::new();
    for member in 0..MEMBERS {
        let correlator = Arc::clone(&correlator);
        handles.push(tokio::spawn(async move {
            let mut aggregates = 0;
            for group in 0..GROUPS {
                #[allow(clippy::cast_precision_loss)]
                let rate = member as f64;
                let envelope = quote(&format!("group-{group}"), rate, MEMBERS);
                if correlator.correlate(envelope, &CorrelationContext::new()).unwrap().is_some() {
                    aggregates += 1;
                }
                tokio::task::yield_now().await;
            }
            aggregates
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }

    assert_eq!(total, GROUPS);
    assert_eq!(counting.calls(), GROUPS);
    assert!(counting.group_sizes().iter().all(|size| *size == MEMBERS));
    assert_eq!(correlator.statistics().aggregations(), GROUPS as u64);
    assert_eq!(correlator.active_groups(), 0);
}

#[tokio::test]
async fn late_arrivals_are_filtered() {
    let correlator = Arc::new(EventCorrelator::builder(LowestValueAggregator).name("late").build());
    let flow = Flow::builder(
        "late",
        ProcessorChainBuilder::new().chain(AggregatingRouter::new(Arc::clone(&correlator))),
    )
    .build()
    .unwrap();

    assert!(flow.process(quote("loan", 0.2, 2)).await.unwrap().is_filtered());
    assert!(flow.process(quote("loan", 0.1, 2)).await.unwrap().envelope().is_some());
    assert!(flow.process(quote("loan", 0.01, 2)).await.unwrap().is_filtered());

    assert_eq!(correlator.statistics().late_arrivals(), 1);
    assert!(correlator.is_processed("loan"));
    assert_eq!(correlator.active_groups(), 0);
}

#[tokio::test]
async fn aggregation_failure_is_not_redelivered() {
    let counting = Arc::new(CountingAggregator::new(FailingAggregator::new("no quotes usable")));
    let correlator = Arc::new(EventCorrelator::builder_shared(counting.clone()).name("broken").build());
    let exceptions = Arc::new(RecordingExceptionStrategy::new());
    let flow = Flow::builder(
        "broken",
        ProcessorChainBuilder::new().chain(AggregatingRouter::new(Arc::clone(&correlator))),
    )
    .redelivery(RetryPolicy::new().max_retries(3).initial_delay(Duration::from_millis(1)))
    .exception_strategy(exceptions.clone())
    .build()
    .unwrap();

    flow.process(quote("loan", 0.3, 2)).await.unwrap();
    let response = flow.process(quote("loan", 0.4, 2)).await.unwrap();

    assert!(response.is_failure());
    assert_eq!(response.envelope().unwrap().error().unwrap().kind, "aggregation");
    assert_eq!(counting.calls(), 1);
    assert_eq!(exceptions.kinds(), vec!["aggregation"]);
    assert_eq!(flow.statistics().redeliveries(), 0);

    // The failed group was discarded, so the id starts over
    assert!(!correlator.is_processed("loan"));
    assert!(flow.process(quote("loan", 0.5, 2)).await.unwrap().is_filtered());
    assert_eq!(correlator.active_groups(), 1);
}

#[tokio::test]
async fn monitor_fails_stale_groups() {
    let clock = Arc::new(manual_clock());
    let exceptions = Arc::new(RecordingExceptionStrategy::new());
    let correlator = Arc::new(
        EventCorrelator::builder(LowestValueAggregator)
            .name("stale")
            .timeout(Duration::from_secs(30))
            .eviction(EvictionPolicy::Fail)
            .clock(clock.clone())
            .exception_strategy(exceptions.clone())
            .build(),
    );
    let monitor = spawn_timeout_monitor(&correlator, Duration::from_millis(10));

    let waiting = await_aggregate(&correlator, "loan", Duration::from_secs(2));
    correlator
        .correlate(quote("loan", 0.06, 3), &CorrelationContext::new())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(correlator.active_groups(), 1, "group must survive until it times out");

    clock.advance(Duration::from_secs(31));
    assert!(eventually(|| exceptions.count() == 1).await);
    assert_eq!(exceptions.kinds(), vec!["timeout"]);
    assert_eq!(correlator.active_groups(), 0);
    assert_eq!(correlator.statistics().evictions(), 1);

    assert!(matches!(waiting.await, Err(FlowError::ChannelClosed)));
    monitor.stop();
}

#[tokio::test]
async fn monitor_forwards_partial_groups() {
    let clock = Arc::new(manual_clock());
    let listener = Arc::new(RecordingProcessor::new("partial-quotes"));
    let correlator = Arc::new(
        EventCorrelator::builder(LowestValueAggregator)
            .name("partial")
            .timeout(Duration::from_secs(5))
            .eviction(EvictionPolicy::ForwardPartial)
            .clock(clock.clone())
            .expiry_listener(listener.clone())
            .build(),
    );
    let _monitor = spawn_timeout_monitor(&correlator, Duration::from_millis(10));

    let waiting = await_aggregate(&correlator, "loan", Duration::from_secs(2));
    for rate in [0.08, 0.04] {
        correlator
            .correlate(quote("loan", rate, 3), &CorrelationContext::new())
            .unwrap();
    }

    clock.advance(Duration::from_secs(6));
    assert!(eventually(|| listener.count() == 1).await);
    assert_eq!(listener.seen()[0].payload(), &Payload::Number(0.04));

    let partial = waiting.await.unwrap();
    assert_eq!(partial.payload(), &Payload::Number(0.04));
}

#[tokio::test]
async fn discarded_groups_close_waiters() {
    let clock = Arc::new(manual_clock());
    let exceptions = Arc::new(RecordingExceptionStrategy::new());
    let correlator = EventCorrelator::builder(LowestValueAggregator)
        .timeout(Duration::from_secs(1))
        .eviction(EvictionPolicy::Discard)
        .clock(clock.clone())
        .exception_strategy(exceptions.clone())
        .build();

    let waiting = await_aggregate(&correlator, "loan", Duration::from_secs(2));
    correlator
        .correlate(quote("loan", 0.1, 2), &CorrelationContext::new())
        .unwrap();

    clock.advance(Duration::from_secs(2));
    assert_eq!(correlator.expire_groups(), 1);

    assert!(matches!(waiting.await, Err(FlowError::ChannelClosed)));
    assert_eq!(exceptions.count(), 0);
}

#[tokio::test]
async fn await_aggregate_times_out() {
    let correlator = EventCorrelator::builder(LowestValueAggregator).build();
    correlator
        .correlate(quote("loan", 0.1, 2), &CorrelationContext::new())
        .unwrap();

    let result = await_aggregate(&correlator, "loan", Duration::from_millis(20)).await;
    assert!(matches!(result, Err(FlowError::Timeout)));
    assert_eq!(correlator.active_groups(), 1);
}

#[tokio::test]
async fn monitor_exits_when_the_correlator_is_dropped() {
    let correlator = Arc::new(
        EventCorrelator::builder(LowestValueAggregator)
            .timeout(Duration::from_secs(1))
            .build(),
    );
    let monitor = spawn_timeout_monitor(&correlator, Duration::from_millis(5));
    assert!(!monitor.is_finished());

    drop(correlator);
    assert!(eventually(|| monitor.is_finished()).await);
}
