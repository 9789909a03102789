//! Sample Collector: session-lifetime buffering of forwarded samples and
//! on-demand derivation of plot series.

pub mod dispatch;
pub mod distribution;
pub mod execution;
pub mod ring;
pub mod series;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::export::health::HealthMetrics;
use crate::protocol::sample::{
    DigestTiming, ModuleExistence, Sample, SampleKind, ServiceCallTiming, UserEvent, WatcherCount,
};

use self::distribution::{FrequencyTable, LocationAverages};
use self::execution::{ExecutionTable, FunctionExecution, Registration};
use self::ring::RingBuffer;
use self::series::{non_empty, windowed, Aggregation, Point, Window};

pub use self::dispatch::PanelDispatcher;

/// Default ring capacity per sample kind.
pub const DEFAULT_CAPACITY: usize = 300;

/// Trailing span counted by [`Collector::digests_in_last_second`].
const INSTANT_RATE_SPAN_MS: u64 = 1_000;

/// A user event rendered for chart annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventAnnotation {
    pub timestamp: u64,
    pub message: String,
}

/// Buffers samples per kind and derives series from them.
///
/// All queries are reads over already-validated state and never fail.
pub struct Collector {
    clock: Arc<dyn Clock>,
    digests: RingBuffer<DigestTiming>,
    events: RingBuffer<UserEvent>,
    watchers: RingBuffer<WatcherCount>,
    digest_durations: FrequencyTable,
    watcher_locations: LocationAverages,
    executions: ExecutionTable,
    module_check: Option<ModuleExistence>,
    health: Option<Arc<HealthMetrics>>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("capacity", &self.digests.capacity())
            .field("digests", &self.digests.len())
            .field("events", &self.events.len())
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

impl Collector {
    /// Creates a collector whose rings each hold `capacity` samples.
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            digests: RingBuffer::with_capacity(capacity),
            events: RingBuffer::with_capacity(capacity),
            watchers: RingBuffer::with_capacity(capacity),
            digest_durations: FrequencyTable::new(),
            watcher_locations: LocationAverages::new(),
            executions: ExecutionTable::new(),
            module_check: None,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn capacity(&self) -> usize {
        self.digests.capacity()
    }

    /// Current time of the collector's clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Stores one sample. Full rings evict their oldest element.
    pub fn record(&mut self, sample: Sample) {
        let kind = sample.kind();
        match sample {
            Sample::DigestTiming(timing) => {
                self.digest_durations.observe(timing.duration_ms);
                self.digests.push(timing);
            }
            Sample::UserEvent(event) => {
                self.events.push(event);
            }
            Sample::WatcherCount(watcher) => {
                self.watcher_locations
                    .observe(&watcher.location, watcher.count);
                self.watchers.push(watcher);
            }
            Sample::ServiceCall(call) => {
                self.register_service_call(&call);
            }
        }

        if let Some(h) = &self.health {
            h.samples_recorded.with_label_values(&[kind.as_str()]).inc();
        }
    }

    /// Folds one service call into the execution table. An async completion
    /// for a function with no prior sync call is logged and ignored.
    pub fn register_service_call(&mut self, call: &ServiceCallTiming) {
        if self.executions.register(call) == Registration::MissingRow {
            warn!(
                module = %call.module,
                service = %call.service,
                func = %call.func,
                "async completion without a prior sync call, ignoring",
            );
        }
    }

    /// Number of buffered samples of a kind. Service calls are aggregated,
    /// not buffered, so they report the number of tracked functions.
    pub fn len(&self, kind: SampleKind) -> usize {
        match kind {
            SampleKind::DigestTiming => self.digests.len(),
            SampleKind::UserEvent => self.events.len(),
            SampleKind::WatcherCount => self.watchers.len(),
            SampleKind::ServiceCall => self
                .executions
                .modules()
                .map(|m| self.executions.function_count(m))
                .sum(),
        }
    }

    pub fn digests(&self) -> impl Iterator<Item = &DigestTiming> {
        self.digests.iter()
    }

    // --- Windowed series ---

    /// Bins one ring into `window.buckets` points ending now. Digest timings
    /// contribute their duration, watcher counts their count, user events 1.
    pub fn windowed_series(
        &self,
        kind: SampleKind,
        window: Window,
        aggregation: Aggregation,
    ) -> Vec<Point> {
        let now = self.clock.now_ms();
        let timer = self.query_timer(kind.as_str());
        let points = match kind {
            SampleKind::DigestTiming => windowed(
                self.digests.iter_newest_first(),
                now,
                window,
                aggregation,
                |d| d.duration_ms,
            ),
            SampleKind::WatcherCount => windowed(
                self.watchers.iter_newest_first(),
                now,
                window,
                aggregation,
                |w| w.count as f64,
            ),
            SampleKind::UserEvent => windowed(
                self.events.iter_newest_first(),
                now,
                window,
                aggregation,
                |_| 1.0,
            ),
            SampleKind::ServiceCall => windowed(
                std::iter::empty::<&DigestTiming>(),
                now,
                window,
                aggregation,
                |d| d.duration_ms,
            ),
        };
        if let Some(t) = timer {
            t.observe_duration();
        }
        points
    }

    /// Average digest duration per bucket.
    pub fn digest_timing_series(&self, window: Window) -> Vec<Point> {
        self.windowed_series(SampleKind::DigestTiming, window, Aggregation::Average)
    }

    /// Digests per bucket.
    pub fn digest_rate_series(&self, window: Window) -> Vec<Point> {
        self.windowed_series(SampleKind::DigestTiming, window, Aggregation::Count)
    }

    // --- Distributions ---

    /// Running distribution for a kind; always at least the `{0,0}` sentinel.
    pub fn distribution(&self, kind: SampleKind) -> Vec<Point> {
        match kind {
            SampleKind::DigestTiming => self.digest_durations.points(),
            SampleKind::WatcherCount => self.watcher_locations.points(),
            SampleKind::UserEvent | SampleKind::ServiceCall => non_empty(Vec::new()),
        }
    }

    /// Frequency of rounded digest durations in ms.
    pub fn digest_time_distribution(&self) -> Vec<Point> {
        self.distribution(SampleKind::DigestTiming)
    }

    /// Running average watcher count per location id.
    pub fn watcher_count_distribution(&self) -> Vec<Point> {
        self.distribution(SampleKind::WatcherCount)
    }

    pub fn location_map(&self) -> BTreeMap<String, u64> {
        self.watcher_locations.location_map()
    }

    /// Buffered watcher counts as `{timestamp, count}` in insertion order.
    pub fn watcher_count_series(&self) -> Vec<Point> {
        non_empty(
            self.watchers
                .iter()
                .map(|w| Point::new(w.timestamp, w.count as f64))
                .collect(),
        )
    }

    // --- Instant values ---

    /// Newest digest timing by insertion order.
    pub fn last_digest_timing(&self) -> Option<DigestTiming> {
        self.digests.newest().copied()
    }

    /// Digests stamped within the last second, scanning newest first and
    /// stopping at the first older one.
    pub fn digests_in_last_second(&self) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(INSTANT_RATE_SPAN_MS);
        self.digests
            .iter_newest_first()
            .take_while(|d| d.timestamp > cutoff)
            .count()
    }

    /// Events newer than `since_ms`, newest first.
    pub fn event_annotations(&self, since_ms: u64) -> Vec<EventAnnotation> {
        self.events
            .iter_newest_first()
            .take_while(|e| e.timestamp > since_ms)
            .map(|e| EventAnnotation {
                timestamp: e.timestamp,
                message: format!("Event: {} on {}", e.event_type, e.dom_path),
            })
            .collect()
    }

    // --- Service functions ---

    /// Functions of `module` by descending impact score.
    pub fn top_impact(&self, module: &str, limit: Option<usize>) -> Vec<FunctionExecution> {
        self.executions.top_impact(module, limit)
    }

    pub fn clear_module(&mut self, module: &str) {
        if self.executions.clear_module(module) {
            debug!(module, "cleared module execution data");
        }
    }

    /// Stores the latest module existence answer from the producer.
    pub fn set_module_check(&mut self, answer: ModuleExistence) {
        self.module_check = Some(answer);
    }

    pub fn module_check(&self) -> Option<&ModuleExistence> {
        self.module_check.as_ref()
    }

    /// Resets every buffer, distribution and table.
    pub fn clear(&mut self) {
        self.digests.clear();
        self.events.clear();
        self.watchers.clear();
        self.digest_durations.clear();
        self.watcher_locations.clear();
        self.executions.clear();
        self.module_check = None;
        debug!("collector cleared");
    }

    fn query_timer(&self, series: &str) -> Option<prometheus::HistogramTimer> {
        self.health.as_ref().map(|h| {
            h.series_query_duration
                .with_label_values(&[series])
                .start_timer()
        })
    }
}
