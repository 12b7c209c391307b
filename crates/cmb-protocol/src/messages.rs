use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from the bridge host to a runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    /// Start one execution. `tools` lists the sanitized callable names the
    /// runner exposes on the frozen `host` object.
    Execute {
        id: String,
        code: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<String>,
    },
    /// Successful completion of a tool call previously issued by the runner.
    ToolResult { id: String, result: Value },
    /// Failed completion of a tool call previously issued by the runner.
    ToolError { id: String, error: String },
    /// Liveness signal; the runner self-terminates when these stop arriving.
    Heartbeat,
    /// Ask the runner to exit cleanly.
    Shutdown,
}

/// Messages sent from a runner back to the bridge host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuntimeMessage {
    /// The runner finished booting and will accept `execute` messages.
    Ready,
    /// The sandboxed script invoked a host callable.
    ToolCall { id: String, name: String, args: Value },
    /// Execution finished with a value.
    Result {
        id: String,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        logs: Option<Vec<String>>,
    },
    /// Execution failed (`id` present), or the runner itself failed
    /// (`id` absent). The two shapes share the `error` tag on the wire.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error: RuntimeError,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        logs: Option<Vec<String>>,
    },
}

/// Error payload of a [`RuntimeMessage::Error`].
///
/// Execution-scoped errors carry a plain message string; fatal runner errors
/// carry a structured object with an optional stack trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RuntimeError {
    Message(String),
    Fatal(FatalError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FatalError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RuntimeError {
    /// The human-readable message regardless of shape.
    pub fn message(&self) -> &str {
        match self {
            Self::Message(message) => message,
            Self::Fatal(fatal) => &fatal.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execute_round_trips_with_tools() {
        let msg = HostMessage::Execute {
            id: "exec-1".to_string(),
            code: "(async () => 1)()".to_string(),
            tools: vec!["github__create_issue".to_string()],
        };
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains("\"type\":\"execute\""));
        assert_eq!(serde_json::from_str::<HostMessage>(&line).unwrap(), msg);
    }

    #[test]
    fn heartbeat_serializes_to_bare_type() {
        let line = serde_json::to_string(&HostMessage::Heartbeat).unwrap();
        assert_eq!(line, r#"{"type":"heartbeat"}"#);
    }

    #[test]
    fn tool_call_deserializes() {
        let msg: RuntimeMessage = serde_json::from_str(
            r#"{"type":"tool-call","id":"t1","name":"test__add","args":[{"a":5,"b":3}]}"#,
        )
        .unwrap();
        match msg {
            RuntimeMessage::ToolCall { id, name, args } => {
                assert_eq!(id, "t1");
                assert_eq!(name, "test__add");
                assert_eq!(args, json!([{"a":5,"b":3}]));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn execution_error_carries_plain_message() {
        let msg: RuntimeMessage = serde_json::from_str(
            r#"{"type":"error","id":"exec-1","error":"boom","logs":["[ERROR] boom"]}"#,
        )
        .unwrap();
        match msg {
            RuntimeMessage::Error { id, error, logs } => {
                assert_eq!(id.as_deref(), Some("exec-1"));
                assert_eq!(error.message(), "boom");
                assert_eq!(logs.unwrap(), vec!["[ERROR] boom"]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn fatal_error_has_no_id_and_structured_payload() {
        let msg: RuntimeMessage = serde_json::from_str(
            r#"{"type":"error","error":{"message":"oom","stack":"at foo","name":"RangeError"}}"#,
        )
        .unwrap();
        match msg {
            RuntimeMessage::Error { id, error, .. } => {
                assert!(id.is_none());
                assert_eq!(error.message(), "oom");
                match error {
                    RuntimeError::Fatal(fatal) => {
                        assert_eq!(fatal.name.as_deref(), Some("RangeError"));
                    }
                    other => panic!("expected fatal shape, got {other:?}"),
                }
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn result_defaults_missing_fields() {
        let msg: RuntimeMessage =
            serde_json::from_str(r#"{"type":"result","id":"exec-2"}"#).unwrap();
        match msg {
            RuntimeMessage::Result { id, result, logs } => {
                assert_eq!(id, "exec-2");
                assert_eq!(result, Value::Null);
                assert!(logs.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
