use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use digestscope::broker::channel::{event_channel, BrokerHandle, Endpoint};
use digestscope::broker::Broker;
use digestscope::clock::ManualClock;
use digestscope::collector::series::Point;
use digestscope::config::Config;
use digestscope::protocol::{self, PageId, Role};
use digestscope::session::Session;

const T: u64 = 1_700_000_000_000;

fn digest(timestamp: u64, time: f64) -> Value {
    json!({ "task": "registerDigestTiming", "data": { "timestamp": timestamp, "time": time } })
}

fn user_event(timestamp: u64, kind: &str, path: &str) -> Value {
    json!({
        "task": "registerEvent",
        "data": { "timestamp": timestamp, "event": { "type": kind, "targetDOMPath": path } }
    })
}

fn watcher(timestamp: u64, count: u64, location: &str) -> Value {
    json!({
        "task": "registerRootWatcherCount",
        "data": { "timestamp": timestamp, "watcher": { "watcherCount": count, "location": location } }
    })
}

fn service_call(task: &str, func: &str, time: f64) -> Value {
    json!({
        "task": task,
        "data": { "module": "app", "service": "Api", "func": func, "time": time }
    })
}

fn config(page: u64) -> Config {
    let mut cfg = Config::default();
    cfg.page_id = page;
    cfg.collector.digest_timing.buckets = 5;
    cfg.collector.digest_timing.bucket_width = std::time::Duration::from_millis(100);
    cfg.collector.digest_rate.buckets = 5;
    cfg.collector.digest_rate.bucket_width = std::time::Duration::from_millis(100);
    cfg
}

async fn drain(ep: &mut Endpoint, broker: &BrokerHandle) -> Vec<Value> {
    broker.barrier().await.expect("barrier");
    let mut out = Vec::new();
    while let Some(v) = ep.try_recv() {
        out.push(v);
    }
    out
}

#[tokio::test]
async fn pipeline_blackbox_producer_to_series() {
    let clock = ManualClock::new(T + 400);
    let mut session = Session::new(config(7), Arc::new(clock.clone())).expect("session");
    session.start().await.expect("start");

    let mut producer = session.connect_producer().expect("producer");
    let notice = producer.recv().await.expect("panel attached notice");
    assert_eq!(notice["task"], "initDevToolPanel");

    for (dt, time) in [(0, 2.0), (50, 3.0), (120, 1.0), (260, 4.0), (400, 2.0)] {
        producer.send(digest(T + dt, time)).expect("send digest");
    }
    producer.send(user_event(T - 1_000, "click", "old")).expect("send");
    producer.send(user_event(T + 300, "click", "id(\"save\")")).expect("send");
    producer.send(watcher(T + 10, 120, "/home")).expect("send");
    producer.send(watcher(T + 20, 80, "/home")).expect("send");
    producer.send(watcher(T + 30, 15, "/about")).expect("send");
    producer
        .send(json!({ "task": "reportModuleExistence", "data": { "moduleName": "app", "services": ["Api"] } }))
        .expect("send");
    producer
        .send(service_call("registerSyncServiceFunctionCall", "load", 10.0))
        .expect("send");
    producer
        .send(service_call("registerASyncServiceFunctionCall", "load", 20.0))
        .expect("send");
    producer
        .send(service_call("registerSyncServiceFunctionCall", "save", 90.0))
        .expect("send");
    // Noise the relay must survive.
    producer.send(json!({ "task": "somethingNew" })).expect("send");
    producer.send(json!({ "task": "log", "text": "instrumented" })).expect("send");

    session.settle().await.expect("settle");
    let snap = session.snapshot();

    assert_eq!(
        snap.digest_timing,
        vec![
            Point::new(T - 100, 0.0),
            Point::new(T, 1.75),
            Point::new(T + 100, 1.375),
            Point::new(T + 200, 2.6875),
            Point::new(T + 300, 2.34375),
        ]
    );
    let rate: Vec<f64> = snap.digest_rate.iter().map(|p| p.y).collect();
    assert_eq!(rate, vec![0.0, 2.0, 1.0, 1.0, 1.0]);

    assert_eq!(
        snap.digest_time_distribution,
        vec![Point::new(1, 1.0), Point::new(2, 2.0), Point::new(3, 1.0), Point::new(4, 1.0)]
    );
    assert_eq!(snap.digests_last_second, 5);
    assert_eq!(snap.last_digest.map(|d| d.timestamp), Some(T + 400));

    assert_eq!(snap.events.len(), 1);
    assert_eq!(snap.events[0].message, "Event: click on id(\"save\")");

    assert_eq!(
        snap.watcher_count_distribution,
        vec![Point::new(0, 100.0), Point::new(1, 15.0)]
    );
    assert_eq!(snap.location_map.get("/about"), Some(&1));
    assert_eq!(snap.watcher_count.len(), 3);

    let ranking = snap.modules.get("app").expect("module ranked");
    let funcs: Vec<&str> = ranking.iter().map(|r| r.func.as_str()).collect();
    assert_eq!(funcs, vec!["save", "load"]);
    assert!((ranking[1].impact_score - 0.3).abs() < 1e-9);
    assert_eq!(
        snap.module_check.as_ref().and_then(|m| m.services.clone()),
        Some(vec!["Api".to_string()])
    );

    // Time moves on; the same buffers yield an empty window.
    clock.set(T + 60_000);
    let later = session.snapshot();
    assert!(later.digest_timing.iter().all(|p| p.y == 0.0));
    assert_eq!(later.digests_last_second, 0);

    let metrics = session.health().render().expect("render");
    assert!(metrics.contains("digestscope_samples_recorded_total{kind=\"digest_timing\"} 5"));
    assert!(metrics.contains("digestscope_unknown_tasks_total 1"));

    session.stop().await.expect("stop");
    let cleanup = producer.recv().await.expect("cleanup after panel left");
    assert_eq!(cleanup["task"], "cleanUpInspectedApp");
}

#[tokio::test]
async fn relay_blackbox_routes_and_lifecycle() {
    let (handle, events) = event_channel();
    let cancel = CancellationToken::new();
    let relay = tokio::spawn(Broker::new().run(events, cancel.clone()));

    // Two pages share every role.
    let mut producer7 = handle.connect_named("content-script", None).expect("connect");
    let mut producer8 = handle.connect_named("content-script", None).expect("connect");
    let mut control7 = handle.connect_named("devtools-page", None).expect("connect");
    producer7.send(protocol::init_message(PageId(7))).expect("init");
    producer8.send(protocol::init_message(PageId(8))).expect("init");
    control7.send(protocol::init_message(PageId(7))).expect("init");

    // Control task reaches the right producer unmodified.
    let instruction = json!({ "task": "checkModuleName", "moduleName": "app" });
    control7
        .send(protocol::inspector_envelope(PageId(7), instruction.clone()))
        .expect("send");
    assert_eq!(drain(&mut producer7, &handle).await, vec![instruction]);
    assert!(drain(&mut producer8, &handle).await.is_empty());

    // A reconnecting inspector replaces the route; the stale channel's
    // disconnect must not tear it down or trigger cleanup.
    let stale = handle.connect(Role::PanelInspector, None).expect("connect");
    stale.send(protocol::init_message(PageId(7))).expect("init");
    let mut fresh = handle.connect(Role::PanelInspector, None).expect("connect");
    fresh.send(protocol::init_message(PageId(7))).expect("init");
    stale.disconnect();
    assert!(drain(&mut producer7, &handle).await.is_empty());

    producer7.send(digest(T, 1.0)).expect("send");
    assert_eq!(drain(&mut fresh, &handle).await, vec![digest(T, 1.0)]);
    assert!(drain(&mut control7, &handle).await.is_empty());

    // Disconnecting the live inspector sends exactly one cleanup to page 7.
    fresh.disconnect();
    let got = drain(&mut producer7, &handle).await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["task"], "cleanUpInspectedApp");
    assert!(drain(&mut producer8, &handle).await.is_empty());

    // Without an inspector, producer samples fall back to the control channel.
    producer7.send(digest(T + 1, 1.0)).expect("send");
    assert_eq!(drain(&mut control7, &handle).await, vec![digest(T + 1, 1.0)]);

    cancel.cancel();
    let broker = relay.await.expect("relay task");
    assert_eq!(broker.route_count(Role::ProducerRelay), 2);
    assert_eq!(broker.route_count(Role::PanelInspector), 0);
    assert_eq!(broker.route(PageId(7), Role::PanelControl), Some(control7.id()));
}

#[tokio::test]
async fn relay_blackbox_detection_handshake() {
    let (handle, events) = event_channel();
    let cancel = CancellationToken::new();
    let relay = tokio::spawn(Broker::new().run(events, cancel.clone()));

    // Framework detected before any panel opened.
    let producer = handle
        .connect(Role::ProducerRelay, Some(PageId(3)))
        .expect("connect");
    producer.send(protocol::init_message(PageId(3))).expect("init");
    producer.send(protocol::panel_attached_message()).expect("detected");

    let mut control = handle.connect(Role::PanelControl, None).expect("connect");
    control.send(protocol::init_message(PageId(3))).expect("init");
    control
        .send(json!({ "task": "checkInjectedContentScript", "pageId": 3 }))
        .expect("check");
    let got = drain(&mut control, &handle).await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["task"], "initDevToolPanel");

    // Producer navigated away: the flag goes with it.
    producer.disconnect();
    control
        .send(json!({ "task": "checkInjectedContentScript", "pageId": 3 }))
        .expect("check");
    assert!(drain(&mut control, &handle).await.is_empty());

    cancel.cancel();
    let broker = relay.await.expect("relay task");
    assert!(!broker.is_detected(PageId(3)));
}
