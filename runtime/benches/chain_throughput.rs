//! Chain and correlation throughput benchmarks
//!
//! - Chain overhead per processing strategy
//! - Flow overhead on top of a bare chain
//! - Correlation of complete groups
//!
//! Run with: `cargo bench -p courier-runtime`

#![allow(missing_docs)]
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use courier_core::aggregation::LowestValueAggregator;
use courier_core::chain::ProcessorChainBuilder;
use courier_core::correlation::{CorrelationContext, EventCorrelator};
use courier_core::envelope::Envelope;
use courier_core::processor::Transformer;
use courier_runtime::{Flow, ProcessingStrategy};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

fn transformer_chain(steps: usize) -> ProcessorChainBuilder {
    (0..steps).fold(ProcessorChainBuilder::named("bench"), |builder, step| {
        builder.chain(Transformer::new(format!("step-{step}"), |envelope: Envelope| {
            Ok(envelope.with_property("step", 1))
        }))
    })
}

fn benchmark_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_strategies");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    for strategy in [
        ProcessingStrategy::Synchronous,
        ProcessingStrategy::asynchronous(4),
        ProcessingStrategy::NonBlocking,
    ] {
        for steps in [1, 8] {
            let chain = strategy
                .configure(transformer_chain(steps))
                .expect("chain should build");

            group.bench_with_input(BenchmarkId::new(strategy.name(), steps), &steps, |b, _| {
                b.to_async(&runtime).iter(|| async {
                    let _ = chain.execute(black_box(Envelope::new("payload"))).await;
                });
            });
        }
    }

    group.finish();
}

fn benchmark_flow_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_overhead");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    let flow = Flow::builder("bench", transformer_chain(4))
        .build()
        .expect("flow should build");
    let chain = flow.chain().clone();

    group.bench_function("scheduled_chain", |b| {
        b.to_async(&runtime).iter(|| async {
            let _ = chain.execute(black_box(Envelope::new("payload"))).await;
        });
    });

    group.bench_function("flow_process", |b| {
        b.to_async(&runtime).iter(|| async {
            let _ = flow.process(black_box(Envelope::new("payload"))).await;
        });
    });

    group.finish();
}

fn benchmark_correlation(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlation");

    for size in [2usize, 16] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("complete_group", size), &size, |b, &size| {
            let correlator = EventCorrelator::builder(LowestValueAggregator).build();
            let context = CorrelationContext::new();
            let mut next_group = 0u64;

            b.iter(|| {
                next_group += 1;
                let id = format!("group-{next_group}");
                for member in 0..size {
                    #[allow(clippy::cast_precision_loss)]
                    let envelope = Envelope::new(member as f64)
                        .with_correlation_id(id.as_str())
                        .with_group_size(size);
                    let _ = black_box(correlator.correlate(envelope, &context));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_strategies,
    benchmark_flow_overhead,
    benchmark_correlation,
);
criterion_main!(benches);
