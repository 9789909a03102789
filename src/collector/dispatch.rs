use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::protocol::sample::{
    CallPhase, DigestTimingData, ModuleExistence, Sample, SampleKind, ServiceCallData,
    UserEventData, WatcherCountData,
};
use crate::protocol::{decode_payload, Envelope, ProtocolError, Task};

use super::Collector;

/// What a panel-side message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Recorded(SampleKind),
    ModuleCheck { module: String, exists: bool },
    /// The producer reported the framework on the page.
    FrameworkDetected,
    Ignored,
}

/// Turns messages arriving on a panel channel into Collector operations.
#[derive(Clone)]
pub struct PanelDispatcher {
    collector: Arc<Mutex<Collector>>,
    health: Option<Arc<HealthMetrics>>,
}

impl std::fmt::Debug for PanelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelDispatcher").finish_non_exhaustive()
    }
}

impl PanelDispatcher {
    pub fn new(collector: Arc<Mutex<Collector>>) -> Self {
        Self {
            collector,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn collector(&self) -> &Arc<Mutex<Collector>> {
        &self.collector
    }

    /// Applies one forwarded message. Malformed or unexpected messages are
    /// logged and skipped.
    pub fn handle(&self, message: &Value) -> Dispatch {
        let envelope = match Envelope::parse(message) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "panel received malformed message");
                return Dispatch::Ignored;
            }
        };

        let Some(task) = envelope.task else {
            info!(task = envelope.task_name, "panel received unknown task");
            if let Some(h) = &self.health {
                h.unknown_tasks.inc();
            }
            return Dispatch::Ignored;
        };

        match self.apply(task, message) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!(task = %task, error = %e, "dropping malformed payload");
                if let Some(h) = &self.health {
                    h.malformed_payloads
                        .with_label_values(&[task.as_str()])
                        .inc();
                }
                Dispatch::Ignored
            }
        }
    }

    fn apply(&self, task: Task, message: &Value) -> Result<Dispatch, ProtocolError> {
        let sample = match task {
            Task::RegisterDigestTiming => {
                Sample::DigestTiming(decode_payload::<DigestTimingData>(task, message)?)
            }
            Task::RegisterEvent => {
                Sample::UserEvent(decode_payload::<UserEventData>(task, message)?.into())
            }
            Task::RegisterRootWatcherCount => {
                Sample::WatcherCount(decode_payload::<WatcherCountData>(task, message)?.into())
            }
            Task::RegisterSyncServiceFunctionCall => Sample::ServiceCall(
                decode_payload::<ServiceCallData>(task, message)?.into_timing(CallPhase::Sync),
            ),
            Task::RegisterAsyncServiceFunctionCall => Sample::ServiceCall(
                decode_payload::<ServiceCallData>(task, message)?.into_timing(CallPhase::Async),
            ),
            Task::ReportModuleExistence => {
                let answer = decode_payload::<ModuleExistence>(task, message)?;
                let dispatch = Dispatch::ModuleCheck {
                    module: answer.module_name.clone(),
                    exists: answer.exists(),
                };
                info!(
                    module = %answer.module_name,
                    exists = answer.exists(),
                    "module existence reported",
                );
                self.collector.lock().set_module_check(answer);
                return Ok(dispatch);
            }
            Task::InitDevToolPanel => {
                info!("framework detected on inspected page");
                return Ok(Dispatch::FrameworkDetected);
            }
            other => {
                debug!(task = %other, "task not handled by the panel");
                return Ok(Dispatch::Ignored);
            }
        };

        let kind = sample.kind();
        self.collector.lock().record(sample);
        Ok(Dispatch::Recorded(kind))
    }
}
