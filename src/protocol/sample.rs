use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of telemetry sample, one ring buffer (or table) per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    DigestTiming,
    UserEvent,
    WatcherCount,
    ServiceCall,
}

impl SampleKind {
    pub const ALL: [SampleKind; 4] = [
        SampleKind::DigestTiming,
        SampleKind::UserEvent,
        SampleKind::WatcherCount,
        SampleKind::ServiceCall,
    ];

    /// Label name used in logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DigestTiming => "digest_timing",
            Self::UserEvent => "user_event",
            Self::WatcherCount => "watcher_count",
            Self::ServiceCall => "service_call",
        }
    }
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything with a producer-side capture time in epoch milliseconds.
pub trait Timestamped {
    fn timestamp(&self) -> u64;
}

/// One timed digest cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DigestTiming {
    pub timestamp: u64,
    /// Cycle length in milliseconds.
    #[serde(rename = "time")]
    pub duration_ms: f64,
}

impl Timestamped for DigestTiming {
    fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

/// A captured user interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEvent {
    pub timestamp: u64,
    pub event_type: String,
    /// Path of the target element, as computed by the page relay.
    pub dom_path: String,
}

impl Timestamped for UserEvent {
    fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

/// Watcher count sampled on the root of the watch tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherCount {
    pub timestamp: u64,
    pub count: u64,
    /// Page location (URL) the count was taken at.
    pub location: String,
}

impl Timestamped for WatcherCount {
    fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

/// Whether a service call timing measures the synchronous body or the
/// asynchronous completion of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Sync,
    Async,
}

/// One instrumented service function call.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCallTiming {
    pub module: String,
    pub service: String,
    pub func: String,
    pub phase: CallPhase,
    pub time_ms: f64,
}

/// A sample as stored by the collector.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    DigestTiming(DigestTiming),
    UserEvent(UserEvent),
    WatcherCount(WatcherCount),
    ServiceCall(ServiceCallTiming),
}

impl Sample {
    pub fn kind(&self) -> SampleKind {
        match self {
            Self::DigestTiming(_) => SampleKind::DigestTiming,
            Self::UserEvent(_) => SampleKind::UserEvent,
            Self::WatcherCount(_) => SampleKind::WatcherCount,
            Self::ServiceCall(_) => SampleKind::ServiceCall,
        }
    }
}

// --- Wire payloads (the `data` field of producer messages) ---

/// `registerEvent` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEventData {
    pub timestamp: u64,
    pub event: UserEventBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEventBody {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "targetDOMPath")]
    pub target_dom_path: String,
}

impl From<UserEventData> for UserEvent {
    fn from(d: UserEventData) -> Self {
        Self {
            timestamp: d.timestamp,
            event_type: d.event.event_type,
            dom_path: d.event.target_dom_path,
        }
    }
}

/// `registerRootWatcherCount` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherCountData {
    pub timestamp: u64,
    pub watcher: WatcherBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherBody {
    #[serde(rename = "watcherCount")]
    pub watcher_count: u64,
    pub location: String,
}

impl From<WatcherCountData> for WatcherCount {
    fn from(d: WatcherCountData) -> Self {
        Self {
            timestamp: d.timestamp,
            count: d.watcher.watcher_count,
            location: d.watcher.location,
        }
    }
}

/// `registerSyncServiceFunctionCall` / `registerASyncServiceFunctionCall` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCallData {
    pub module: String,
    pub service: String,
    pub func: String,
    pub time: f64,
}

impl ServiceCallData {
    pub fn into_timing(self, phase: CallPhase) -> ServiceCallTiming {
        ServiceCallTiming {
            module: self.module,
            service: self.service,
            func: self.func,
            phase,
            time_ms: self.time,
        }
    }
}

/// `reportModuleExistence` payload. `services == None` means the module
/// was not found on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleExistence {
    #[serde(rename = "moduleName")]
    pub module_name: String,
    #[serde(default)]
    pub services: Option<Vec<String>>,
}

impl ModuleExistence {
    pub fn exists(&self) -> bool {
        self.services.is_some()
    }
}

/// Alias kept for symmetry with the other `*Data` payloads.
pub type DigestTimingData = DigestTiming;
