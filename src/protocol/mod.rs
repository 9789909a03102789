pub mod parse;
pub mod sample;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub use self::parse::{decode_payload, Envelope, ProtocolError};

/// Value stamped into the `source` field of Broker-originated messages.
pub const SOURCE_TAG: &str = "digestscope";

/// Opaque identifier of one monitored page (a browser tab).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Endpoint role, resolved once from the connection name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Relay running next to the monitored page, carrying producer samples.
    ProducerRelay,
    /// Control channel of the inspection panel.
    PanelControl,
    /// The panel's dedicated inspector channel.
    PanelInspector,
}

impl Role {
    /// All roles, in routing-table order.
    pub const ALL: [Role; 3] = [Role::ProducerRelay, Role::PanelControl, Role::PanelInspector];

    /// Connection name the endpoint declares when it connects.
    pub const fn connection_name(self) -> &'static str {
        match self {
            Self::ProducerRelay => "content-script",
            Self::PanelControl => "devtools-page",
            Self::PanelInspector => "inspection-panel",
        }
    }

    /// Resolves a connection name into a role.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "content-script" => Some(Self::ProducerRelay),
            "devtools-page" => Some(Self::PanelControl),
            "inspection-panel" => Some(Self::PanelInspector),
            _ => None,
        }
    }

    /// Short label used in log lines and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProducerRelay => "producer_relay",
            Self::PanelControl => "panel_control",
            Self::PanelInspector => "panel_inspector",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::ProducerRelay => 0,
            Self::PanelControl => 1,
            Self::PanelInspector => 2,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task tag carried by every routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    Init,
    Log,
    CheckModuleName,
    ReportModuleExistence,
    InstrumentModuleServices,
    SendTaskToInspector,
    RegisterDigestTiming,
    RegisterEvent,
    RegisterRootWatcherCount,
    RegisterSyncServiceFunctionCall,
    RegisterAsyncServiceFunctionCall,
    CleanUpInspectedApp,
    /// Producer announces that the monitored framework was detected.
    InitDevToolPanel,
    /// Panel asks whether the framework was already detected on its page.
    CheckInjectedContentScript,
}

impl Task {
    /// Wire name of the task.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Log => "log",
            Self::CheckModuleName => "checkModuleName",
            Self::ReportModuleExistence => "reportModuleExistence",
            Self::InstrumentModuleServices => "instrumentModuleServices",
            Self::SendTaskToInspector => "sendTaskToInspector",
            Self::RegisterDigestTiming => "registerDigestTiming",
            Self::RegisterEvent => "registerEvent",
            Self::RegisterRootWatcherCount => "registerRootWatcherCount",
            Self::RegisterSyncServiceFunctionCall => "registerSyncServiceFunctionCall",
            Self::RegisterAsyncServiceFunctionCall => "registerASyncServiceFunctionCall",
            Self::CleanUpInspectedApp => "cleanUpInspectedApp",
            Self::InitDevToolPanel => "initDevToolPanel",
            Self::CheckInjectedContentScript => "checkInjectedContentScript",
        }
    }

    /// Parses a wire name. Unknown names return `None`; callers log and drop.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "init" => Some(Self::Init),
            "log" => Some(Self::Log),
            "checkModuleName" => Some(Self::CheckModuleName),
            "reportModuleExistence" => Some(Self::ReportModuleExistence),
            "instrumentModuleServices" => Some(Self::InstrumentModuleServices),
            "sendTaskToInspector" => Some(Self::SendTaskToInspector),
            "registerDigestTiming" => Some(Self::RegisterDigestTiming),
            "registerEvent" => Some(Self::RegisterEvent),
            "registerRootWatcherCount" => Some(Self::RegisterRootWatcherCount),
            "registerSyncServiceFunctionCall" => Some(Self::RegisterSyncServiceFunctionCall),
            "registerASyncServiceFunctionCall" => Some(Self::RegisterAsyncServiceFunctionCall),
            "cleanUpInspectedApp" => Some(Self::CleanUpInspectedApp),
            "initDevToolPanel" => Some(Self::InitDevToolPanel),
            "checkInjectedContentScript" => Some(Self::CheckInjectedContentScript),
            _ => None,
        }
    }

    /// Instructions a panel may address to the producer of its page.
    pub const fn is_producer_instruction(self) -> bool {
        matches!(self, Self::CheckModuleName | Self::InstrumentModuleServices)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake message an endpoint sends to register its route.
pub fn init_message(page: PageId) -> Value {
    json!({ "task": Task::Init.as_str(), "pageId": page })
}

/// Signal telling the producer to stop instrumenting and restore wrapped state.
pub fn cleanup_message() -> Value {
    json!({ "task": Task::CleanUpInspectedApp.as_str(), "source": SOURCE_TAG })
}

/// Notice that a panel is (already) attached to the producer's page.
pub fn panel_attached_message() -> Value {
    json!({ "task": Task::InitDevToolPanel.as_str(), "source": SOURCE_TAG })
}

/// Wraps an instruction so the Broker forwards it to the page's producer.
pub fn inspector_envelope(page: PageId, instruction: Value) -> Value {
    json!({
        "task": Task::SendTaskToInspector.as_str(),
        "pageId": page,
        "data": instruction,
    })
}
