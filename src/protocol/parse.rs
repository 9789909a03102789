//! Envelope and payload decoding for routed messages.
//!
//! Messages stay `serde_json::Value` end to end so the Broker can forward
//! them verbatim; only the fields needed for routing are read here.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::{PageId, Task};

/// Errors that can occur while reading a routed message.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has no string `task` field")]
    MissingTask,

    #[error("invalid pageId: {raw}")]
    InvalidPageId { raw: Value },

    #[error("{task}: missing `{field}` field")]
    MissingField { task: &'static str, field: &'static str },

    #[error("{task}: malformed payload: {source}")]
    Payload {
        task: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Routing view over a message: its task tag and optional page address.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    /// Raw task name as sent, kept for "unknown task" diagnostics.
    pub task_name: &'a str,
    /// Recognized task, `None` when the name is not part of the vocabulary.
    pub task: Option<Task>,
    pub page_id: Option<PageId>,
}

impl<'a> Envelope<'a> {
    /// Reads the routing fields of a message without copying it.
    pub fn parse(message: &'a Value) -> Result<Self, ProtocolError> {
        let obj = message.as_object().ok_or(ProtocolError::NotAnObject)?;

        let task_name = obj
            .get("task")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingTask)?;

        let page_id = match obj.get("pageId") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                raw.as_u64()
                    .map(PageId)
                    .ok_or_else(|| ProtocolError::InvalidPageId { raw: raw.clone() })?,
            ),
        };

        Ok(Self {
            task_name,
            task: Task::from_name(task_name),
            page_id,
        })
    }
}

/// Decodes the `data` payload of a message into a typed struct.
pub fn decode_payload<T: DeserializeOwned>(task: Task, message: &Value) -> Result<T, ProtocolError> {
    let data = message.get("data").ok_or(ProtocolError::MissingField {
        task: task.as_str(),
        field: "data",
    })?;

    T::deserialize(data).map_err(|source| ProtocolError::Payload {
        task: task.as_str(),
        source,
    })
}

/// Reads a top-level string field, e.g. `moduleName` on control tasks.
pub fn string_field<'a>(
    task: Task,
    message: &'a Value,
    field: &'static str,
) -> Result<&'a str, ProtocolError> {
    message
        .get(field)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField {
            task: task.as_str(),
            field,
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::sample::DigestTimingData;

    #[test]
    fn test_parse_init() {
        let msg = json!({ "task": "init", "pageId": 7 });
        let env = Envelope::parse(&msg).expect("valid envelope");
        assert_eq!(env.task, Some(Task::Init));
        assert_eq!(env.page_id, Some(PageId(7)));
    }

    #[test]
    fn test_parse_unknown_task_keeps_name() {
        let msg = json!({ "task": "frobnicate" });
        let env = Envelope::parse(&msg).expect("valid envelope");
        assert_eq!(env.task, None);
        assert_eq!(env.task_name, "frobnicate");
        assert_eq!(env.page_id, None);
    }

    #[test]
    fn test_parse_not_an_object() {
        let msg = json!(["init"]);
        assert!(matches!(
            Envelope::parse(&msg),
            Err(ProtocolError::NotAnObject)
        ));
    }

    #[test]
    fn test_parse_missing_task() {
        let msg = json!({ "pageId": 3 });
        assert!(matches!(
            Envelope::parse(&msg),
            Err(ProtocolError::MissingTask)
        ));

        let msg = json!({ "task": 12 });
        assert!(matches!(
            Envelope::parse(&msg),
            Err(ProtocolError::MissingTask)
        ));
    }

    #[test]
    fn test_parse_invalid_page_id() {
        let msg = json!({ "task": "init", "pageId": "seven" });
        let err = Envelope::parse(&msg).expect_err("string page id");
        assert!(err.to_string().contains("invalid pageId"));
    }

    #[test]
    fn test_parse_null_page_id_is_absent() {
        let msg = json!({ "task": "log", "pageId": null });
        let env = Envelope::parse(&msg).expect("valid envelope");
        assert_eq!(env.page_id, None);
    }

    #[test]
    fn test_decode_payload() {
        let msg = json!({
            "task": "registerDigestTiming",
            "data": { "timestamp": 1000, "time": 2.5 }
        });
        let data: DigestTimingData =
            decode_payload(Task::RegisterDigestTiming, &msg).expect("valid payload");
        assert_eq!(data.timestamp, 1000);
        assert!((data.duration_ms - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decode_payload_missing_data() {
        let msg = json!({ "task": "registerDigestTiming" });
        let err = decode_payload::<DigestTimingData>(Task::RegisterDigestTiming, &msg)
            .expect_err("no data field");
        assert!(err.to_string().contains("missing `data`"));
    }

    #[test]
    fn test_decode_payload_malformed() {
        let msg = json!({
            "task": "registerDigestTiming",
            "data": { "timestamp": "soon" }
        });
        let err = decode_payload::<DigestTimingData>(Task::RegisterDigestTiming, &msg)
            .expect_err("bad payload");
        assert!(err.to_string().contains("registerDigestTiming: malformed payload"));
    }

    #[test]
    fn test_string_field() {
        let msg = json!({ "task": "checkModuleName", "moduleName": "app" });
        assert_eq!(
            string_field(Task::CheckModuleName, &msg, "moduleName").expect("present"),
            "app"
        );
        assert!(string_field(Task::CheckModuleName, &json!({}), "moduleName").is_err());
    }
}
