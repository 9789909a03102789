use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use digestscope::broker::channel::{ChannelHandle, ChannelId};
use digestscope::broker::Broker;
use digestscope::clock::ManualClock;
use digestscope::collector::dispatch::PanelDispatcher;
use digestscope::collector::series::Window;
use digestscope::collector::Collector;
use digestscope::protocol::sample::{DigestTiming, Sample};
use digestscope::protocol::{self, PageId, Role};

const T: u64 = 1_700_000_000_000;

fn digest_message(i: u64) -> Value {
    json!({
        "task": "registerDigestTiming",
        "data": { "timestamp": T + i, "time": (i % 13) as f64 }
    })
}

fn full_collector() -> Collector {
    let mut collector = Collector::new(300, Arc::new(ManualClock::new(T + 30_000)));
    for i in 0..300u64 {
        collector.record(Sample::DigestTiming(DigestTiming {
            timestamp: T + i * 100,
            duration_ms: (i % 13) as f64,
        }));
    }
    collector
}

fn bench_series(c: &mut Criterion) {
    let collector = full_collector();

    c.bench_function("collector/digest_timing_series_300x100ms", |b| {
        b.iter(|| collector.digest_timing_series(black_box(Window::new(300, 100))))
    });

    c.bench_function("collector/digest_rate_series_300x1s", |b| {
        b.iter(|| collector.digest_rate_series(black_box(Window::new(300, 1_000))))
    });

    c.bench_function("collector/digests_in_last_second", |b| {
        b.iter(|| black_box(collector.digests_in_last_second()))
    });
}

fn bench_record(c: &mut Criterion) {
    let mut collector = full_collector();
    let mut i = 0u64;

    c.bench_function("collector/record_digest_at_capacity", |b| {
        b.iter(|| {
            i += 1;
            collector.record(black_box(Sample::DigestTiming(DigestTiming {
                timestamp: T + i,
                duration_ms: 4.0,
            })));
        })
    });
}

fn bench_route(c: &mut Criterion) {
    let mut broker = Broker::new();
    let (producer_tx, _producer_rx) = mpsc::unbounded_channel();
    let (inspector_tx, mut inspector_rx) = mpsc::unbounded_channel();
    let producer = ChannelId(1);
    let inspector = ChannelId(2);
    broker.handle_connect(ChannelHandle::new(producer, Role::ProducerRelay, None, producer_tx));
    broker.handle_connect(ChannelHandle::new(inspector, Role::PanelInspector, None, inspector_tx));
    broker.on_message(producer, protocol::init_message(PageId(1)));
    broker.on_message(inspector, protocol::init_message(PageId(1)));

    let message = digest_message(1);
    c.bench_function("broker/route_producer_sample", |b| {
        b.iter(|| {
            broker.on_message(producer, black_box(message.clone()));
            black_box(inspector_rx.try_recv().ok())
        })
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let collector = Arc::new(parking_lot::Mutex::new(full_collector()));
    let dispatcher = PanelDispatcher::new(collector);
    let message = digest_message(7);

    c.bench_function("dispatch/register_digest_timing", |b| {
        b.iter(|| dispatcher.handle(black_box(&message)))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_series(c);
    bench_record(c);
    bench_route(c);
    bench_dispatch(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
