//! Flow behaviour across processing strategies.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use courier_core::chain::ProcessorChainBuilder;
use courier_core::connector::OutboundEndpoint;
use courier_core::envelope::{Envelope, Payload};
use courier_core::exchange::ExchangePattern;
use courier_runtime::config::EngineConfig;
use courier_runtime::dead_letter::DELIVERY_ATTEMPTS_PROPERTY;
use courier_runtime::{
    DeadLetterQueue, Flow, FlowBuilder, FlowError, FlowResponse, HealthStatus, ProcessingStrategy, RetryPolicy,
};
use courier_testing::connectors::MockConnector;
use courier_testing::init_test_tracing;
use courier_testing::processors::{
    AppendingProcessor, CallLog, DelayProcessor, FailingProcessor, PanickingProcessor, RecordingProcessor,
    StopProcessor,
};
use courier_testing::strategies::RecordingExceptionStrategy;
use std::sync::Arc;
use std::time::Duration;

fn strategies() -> Vec<ProcessingStrategy> {
    vec![
        ProcessingStrategy::Synchronous,
        ProcessingStrategy::asynchronous(2),
        ProcessingStrategy::NonBlocking,
    ]
}

fn fast_redelivery(retries: u32) -> RetryPolicy {
    RetryPolicy::new()
        .max_retries(retries)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(false)
}

#[tokio::test]
async fn every_strategy_produces_the_same_reply() {
    init_test_tracing();

    for strategy in strategies() {
        let name = strategy.name();
        let log = CallLog::new();
        let flow = Flow::builder(
            "greeting",
            ProcessorChainBuilder::new()
                .chain(AppendingProcessor::new("-a").logging_to(log.clone()))
                .chain(AppendingProcessor::new("-b").logging_to(log.clone())),
        )
        .processing_strategy(strategy)
        .build()
        .unwrap();

        let response = flow.process(Envelope::new("x")).await.unwrap();
        assert_eq!(
            response.envelope().unwrap().payload(),
            &Payload::from("x-a-b"),
            "strategy {name}"
        );
        assert_eq!(log.names(), vec!["-a", "-b"], "strategy {name}");
        assert_eq!(flow.statistics().received(), 1);
        assert_eq!(flow.in_flight(), 0);
    }
}

#[tokio::test]
async fn one_way_envelopes_get_no_response() {
    for strategy in strategies() {
        let connector = Arc::new(MockConnector::inheriting("audit"));
        let flow = Flow::builder(
            "audit",
            ProcessorChainBuilder::new().chain(OutboundEndpoint::new(Arc::clone(&connector))),
        )
        .processing_strategy(strategy)
        .exchange_pattern(ExchangePattern::OneWay)
        .build()
        .unwrap();

        let response = flow.process(Envelope::new("event")).await.unwrap();
        assert!(response.is_void());

        flow.shutdown(Duration::from_secs(2)).await.unwrap();
        assert_eq!(connector.dispatched().len(), 1);
        assert!(connector.sent().is_empty());
    }
}

#[tokio::test]
async fn asynchronous_one_way_returns_before_the_chain_finishes() {
    let recorder = Arc::new(RecordingProcessor::new("tail"));
    let flow = Flow::builder(
        "slow",
        ProcessorChainBuilder::new()
            .chain(DelayProcessor::new(Duration::from_millis(200)))
            .chain(Arc::clone(&recorder)),
    )
    .processing_strategy(ProcessingStrategy::asynchronous(1))
    .exchange_pattern(ExchangePattern::OneWay)
    .build()
    .unwrap();

    let response = flow.process(Envelope::new("later")).await.unwrap();
    assert!(response.is_void());
    assert_eq!(recorder.count(), 0);
    assert_eq!(flow.in_flight(), 1);

    flow.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(recorder.count(), 1);
    assert_eq!(flow.in_flight(), 0);
}

#[tokio::test]
async fn filtered_envelopes_are_reported() {
    let flow = Flow::builder("filter", ProcessorChainBuilder::new().chain(StopProcessor))
        .build()
        .unwrap();

    let response = flow.process(Envelope::new("dropped")).await.unwrap();
    assert!(response.is_filtered());
    assert!(response.into_envelope().is_none());
}

#[tokio::test]
async fn request_response_failure_returns_failed_envelope() {
    for strategy in strategies() {
        let exceptions = Arc::new(RecordingExceptionStrategy::new());
        let flow = Flow::builder(
            "quotes",
            ProcessorChainBuilder::new()
                .chain(AppendingProcessor::new("-enriched"))
                .chain(FailingProcessor::always("bank").as_routing()),
        )
        .processing_strategy(strategy)
        .exception_strategy(exceptions.clone())
        .build()
        .unwrap();

        let response = flow.process(Envelope::new("loan")).await.unwrap();
        assert!(response.is_failure());

        let failed = response.into_envelope().unwrap();
        let error = failed.error().unwrap();
        assert_eq!(error.kind, "routing");
        // The strategy sees the envelope as it entered the flow
        assert_eq!(failed.payload(), &Payload::from("loan"));

        assert_eq!(exceptions.kinds(), vec!["routing"]);
        assert_eq!(flow.statistics().failures(), 1);
    }
}

#[tokio::test]
async fn suppressing_exception_strategy_yields_void() {
    let flow = Flow::builder("quiet", ProcessorChainBuilder::new().chain(FailingProcessor::always("step")))
        .exception_strategy(Arc::new(RecordingExceptionStrategy::suppressing()))
        .build()
        .unwrap();

    assert!(flow.process(Envelope::new("x")).await.unwrap().is_void());
}

#[tokio::test]
async fn panics_are_contained_by_every_strategy() {
    for strategy in strategies() {
        let exceptions = Arc::new(RecordingExceptionStrategy::new());
        let flow = Flow::builder("boom", ProcessorChainBuilder::new().chain(PanickingProcessor))
            .processing_strategy(strategy)
            .exception_strategy(exceptions.clone())
            .build()
            .unwrap();

        let response = flow.process(Envelope::new("x")).await.unwrap();
        assert!(response.is_failure());
        assert_eq!(exceptions.kinds(), vec!["panic"]);
    }
}

#[tokio::test]
async fn redelivery_recovers_from_transient_failures() {
    let failing = Arc::new(FailingProcessor::times("flaky", 2));
    let exceptions = Arc::new(RecordingExceptionStrategy::new());
    let flow = Flow::builder("retrying", ProcessorChainBuilder::new().chain(Arc::clone(&failing)))
        .redelivery(fast_redelivery(3))
        .exception_strategy(exceptions.clone())
        .build()
        .unwrap();

    let response = flow.process(Envelope::new("x")).await.unwrap();
    assert!(!response.is_failure());
    assert_eq!(failing.calls(), 3);
    assert_eq!(flow.statistics().redeliveries(), 2);
    assert_eq!(exceptions.count(), 0);
}

#[tokio::test]
async fn exhausted_redelivery_parks_the_envelope() {
    let failing = Arc::new(FailingProcessor::always("down"));
    let queue = DeadLetterQueue::new(10);
    let flow = Flow::builder("parking", ProcessorChainBuilder::new().chain(Arc::clone(&failing)))
        .redelivery(fast_redelivery(2))
        .dead_letter_queue(queue.clone())
        .build()
        .unwrap();

    let response = flow.process(Envelope::new("x")).await.unwrap();
    assert!(response.is_failure());
    assert_eq!(failing.calls(), 3);

    let letters = queue.drain();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].flow, "parking");
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].error.kind, "transform");
    assert!(letters[0].envelope.property(DELIVERY_ATTEMPTS_PROPERTY).is_some());
}

#[tokio::test]
async fn dead_letter_pressure_shows_in_health() {
    let queue = DeadLetterQueue::new(2);
    let flow = Flow::builder("dlq", ProcessorChainBuilder::new().chain(FailingProcessor::always("step")))
        .dead_letter_queue(queue.clone())
        .build()
        .unwrap();

    assert!(flow.health().is_healthy());

    flow.process(Envelope::new("1")).await.unwrap();
    let report = flow.health();
    assert_eq!(report.status, HealthStatus::Healthy);

    flow.process(Envelope::new("2")).await.unwrap();
    let report = flow.health();
    assert!(report.is_unhealthy());
    let dlq = report
        .checks
        .iter()
        .find(|check| check.component == "dlq.dead_letters")
        .unwrap();
    assert_eq!(dlq.metadata_value("dlq_size"), Some("2"));
    assert_eq!(dlq.metadata_value("dlq_capacity"), Some("2"));

    // Full queue drops the oldest entry
    flow.process(Envelope::new("3")).await.unwrap();
    let payloads: Vec<String> = queue
        .drain()
        .iter()
        .map(|letter| letter.envelope.payload().to_string())
        .collect();
    assert_eq!(payloads, vec!["2", "3"]);
    assert!(flow.health().is_healthy());
}

#[tokio::test]
async fn shutdown_rejects_new_envelopes() {
    let flow = Flow::builder("closing", ProcessorChainBuilder::new().chain(AppendingProcessor::new("!")))
        .build()
        .unwrap();

    flow.shutdown(Duration::from_millis(100)).await.unwrap();
    assert!(flow.is_shutting_down());
    assert!(flow.health().is_unhealthy());

    let result = flow.process(Envelope::new("late")).await;
    assert!(matches!(result, Err(FlowError::ShutdownInProgress)));
}

#[tokio::test]
async fn shutdown_times_out_with_work_in_flight() {
    let flow = Flow::builder(
        "stuck",
        ProcessorChainBuilder::new().chain(DelayProcessor::new(Duration::from_millis(500))),
    )
    .processing_strategy(ProcessingStrategy::asynchronous(1))
    .exchange_pattern(ExchangePattern::OneWay)
    .build()
    .unwrap();

    flow.process(Envelope::new("slow")).await.unwrap();

    let result = flow.shutdown(Duration::from_millis(50)).await;
    assert!(matches!(result, Err(FlowError::ShutdownTimeout(1))));

    flow.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn poll_processes_inbound_envelopes() {
    let inbound = Arc::new(MockConnector::request_response("queue"));
    inbound.push_inbound(Envelope::new("polled"));

    let flow = Flow::builder("consumer", ProcessorChainBuilder::new().chain(AppendingProcessor::new("-seen")))
        .build()
        .unwrap();

    let response = flow
        .poll(inbound.clone(), Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.envelope().unwrap().payload(), &Payload::from("polled-seen"));

    let empty = flow.poll(inbound.clone(), Duration::from_millis(10)).await.unwrap();
    assert!(empty.is_none());

    inbound.set_failing(true);
    let failed = flow.poll(inbound, Duration::from_millis(10)).await;
    assert!(matches!(failed, Err(FlowError::Poll(_))));
}

#[tokio::test]
async fn flow_built_from_configuration() {
    let config = EngineConfig::from_toml_str(
        r#"
        [flows.orders]
        processing_strategy = "non_blocking"
        exchange_pattern = "one_way"
        max_redeliveries = 1
        redelivery_delay_ms = 1
        dlq_max_size = 4
        "#,
    )
    .unwrap();

    let failing = Arc::new(FailingProcessor::always("warehouse"));
    let flow = FlowBuilder::from_config(
        "orders",
        ProcessorChainBuilder::new().chain(Arc::clone(&failing)),
        &config.flow("orders"),
    )
    .build()
    .unwrap();

    assert_eq!(flow.chain().strategy().name(), "non_blocking");
    let response = flow.process(Envelope::new("order-1")).await.unwrap();
    assert!(matches!(response, FlowResponse::Void));
    assert_eq!(failing.calls(), 2);

    let queue = flow.dead_letters().unwrap();
    assert_eq!(queue.max_size(), 4);
    assert_eq!(queue.len(), 1);
}
