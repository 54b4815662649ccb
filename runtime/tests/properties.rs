//! Engine properties checked through scheduled chains and flows.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use courier_core::chain::ProcessorChainBuilder;
use courier_core::connector::OutboundEndpoint;
use courier_core::envelope::{Envelope, Payload};
use courier_core::exchange::ExchangePattern;
use courier_core::processor::Transformer;
use courier_runtime::{Flow, ProcessingStrategy};
use courier_testing::connectors::{MockConnector, Reply};
use courier_testing::processors::{AppendingProcessor, CallLog};
use courier_testing::properties::payload;
use proptest::prelude::*;
use std::sync::Arc;

fn strategy(index: usize) -> ProcessingStrategy {
    match index % 3 {
        0 => ProcessingStrategy::Synchronous,
        1 => ProcessingStrategy::asynchronous(2),
        _ => ProcessingStrategy::NonBlocking,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn chain_order_is_preserved(steps in 1usize..8, runs in 1usize..4, which in 0usize..3) {
        let log = CallLog::new();
        let builder = (0..steps).fold(ProcessorChainBuilder::new(), |builder, step| {
            builder.chain(AppendingProcessor::new(format!("-{step}")).logging_to(log.clone()))
        });
        let chain = strategy(which).configure(builder).unwrap();

        let expected: Vec<String> = (0..steps).map(|step| format!("-{step}")).collect();
        let rt = runtime();
        for _ in 0..runs {
            log.clear();
            let outcome = rt.block_on(chain.execute(Envelope::new("x"))).unwrap();
            prop_assert_eq!(log.names(), expected.clone());
            prop_assert_eq!(
                outcome.into_envelope().unwrap().payload().to_string(),
                format!("x{}", expected.concat())
            );
        }
    }

    #[test]
    fn one_way_connector_result_is_void(p in payload(), which in 0usize..3) {
        let connector = Arc::new(MockConnector::one_way("sink").replying(Reply::Payload(Payload::from("ignored"))));
        let chain = strategy(which)
            .configure(ProcessorChainBuilder::new().chain(OutboundEndpoint::new(Arc::clone(&connector))))
            .unwrap();

        let envelope = Envelope::new(p).with_exchange_pattern(ExchangePattern::OneWay);
        let outcome = runtime().block_on(chain.execute(envelope)).unwrap();
        prop_assert!(outcome.is_void());
        prop_assert_eq!(connector.dispatched().len(), 1);
    }

    #[test]
    fn request_response_reply_passes_through(p in payload(), reply in payload(), which in 0usize..3) {
        let connector = Arc::new(MockConnector::request_response("bank").replying(Reply::Payload(reply.clone())));
        let chain = strategy(which)
            .configure(ProcessorChainBuilder::new().chain(OutboundEndpoint::new(Arc::clone(&connector))))
            .unwrap();

        let outcome = runtime().block_on(chain.execute(Envelope::new(p))).unwrap();
        let envelope = outcome.into_envelope().unwrap();
        prop_assert_eq!(envelope.payload(), &reply);
    }

    #[test]
    fn processing_never_mutates_the_callers_envelope(p in payload(), which in 0usize..3) {
        let flow = Flow::builder(
            "stamping",
            ProcessorChainBuilder::new().chain(Transformer::new("stamp", |envelope: Envelope| {
                Ok(envelope.with_property("k", "v").with_payload("changed"))
            })),
        )
        .processing_strategy(strategy(which))
        .build()
        .unwrap();

        let original = Envelope::new(p.clone());
        let response = runtime().block_on(flow.process(original.clone())).unwrap();

        prop_assert!(original.property("k").is_none());
        prop_assert_eq!(original.payload(), &p);
        let reply = response.into_envelope().unwrap();
        prop_assert_eq!(reply.property("k"), Some(&serde_json::Value::from("v")));
    }
}

#[test]
fn with_property_returns_a_new_envelope() {
    let original = Envelope::new("payload");
    let updated = original.with_property("k", "v");

    assert!(original.property("k").is_none());
    assert!(updated.property("k").is_some());
    assert_eq!(original.id(), updated.id());
}
