use crate::net::SharedFd;
use hyperlite_shared::{HyperliteError, HyperliteResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One request on the monitor connection.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorCommand {
    pub execute: String,
    pub arguments: Option<Value>,
    /// Descriptor passed alongside the request (`getfd`).
    pub fd: Option<SharedFd>,
}

#[derive(Serialize)]
struct WireCommand<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a Value>,
}

impl MonitorCommand {
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
            fd: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    pub fn with_fd(mut self, fd: SharedFd) -> Self {
        self.fd = Some(fd);
        self
    }

    /// Human monitor passthrough.
    pub fn human(command_line: impl Into<String>) -> Self {
        Self::new("human-monitor-command")
            .with_arguments(serde_json::json!({ "command-line": command_line.into() }))
    }

    /// Single-line JSON encoding.
    pub fn encode(&self) -> HyperliteResult<Vec<u8>> {
        Ok(serde_json::to_vec(&WireCommand {
            execute: &self.execute,
            arguments: self.arguments.as_ref(),
        })?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MonitorError {
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MonitorEvent {
    pub event: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// One message received from the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorMessage {
    Greeting(Value),
    Return(Value),
    Error(MonitorError),
    /// Asynchronous notification, never a response to a request.
    Event(MonitorEvent),
}

impl MonitorMessage {
    pub fn parse(line: &str) -> HyperliteResult<Self> {
        let value: Value = serde_json::from_str(line.trim())?;
        let Value::Object(mut object) = value else {
            return Err(HyperliteError::Protocol(format!(
                "monitor message is not an object: {}",
                line
            )));
        };

        if let Some(ret) = object.remove("return") {
            return Ok(MonitorMessage::Return(ret));
        }
        if let Some(err) = object.remove("error") {
            return Ok(MonitorMessage::Error(serde_json::from_value(err)?));
        }
        if object.contains_key("event") {
            return Ok(MonitorMessage::Event(serde_json::from_value(Value::Object(
                object,
            ))?));
        }
        if let Some(greeting) = object.remove("QMP") {
            return Ok(MonitorMessage::Greeting(greeting));
        }

        Err(HyperliteError::Protocol(format!(
            "unrecognized monitor message: {}",
            line
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_has_no_newline() {
        let cmd = MonitorCommand::human("drive_del drive0");
        let bytes = cmd.encode().unwrap();
        assert!(!bytes.contains(&b'\n'));
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["execute"], "human-monitor-command");
        assert_eq!(value["arguments"]["command-line"], "drive_del drive0");
    }

    #[test]
    fn test_encode_omits_missing_arguments() {
        let bytes = MonitorCommand::new("quit").encode().unwrap();
        assert_eq!(bytes, br#"{"execute":"quit"}"#);
    }

    #[test]
    fn test_parse_messages() {
        assert_eq!(
            MonitorMessage::parse("{\"return\": {}}\r\n").unwrap(),
            MonitorMessage::Return(serde_json::json!({}))
        );

        let err = MonitorMessage::parse(
            r#"{"error": {"class": "GenericError", "desc": "Duplicate ID"}}"#,
        )
        .unwrap();
        assert_eq!(
            err,
            MonitorMessage::Error(MonitorError {
                class: "GenericError".into(),
                desc: "Duplicate ID".into()
            })
        );

        let event = MonitorMessage::parse(
            r#"{"event": "SHUTDOWN", "timestamp": {"seconds": 1, "microseconds": 2}}"#,
        )
        .unwrap();
        assert!(matches!(event, MonitorMessage::Event(e) if e.event == "SHUTDOWN"));

        let greeting =
            MonitorMessage::parse(r#"{"QMP": {"version": {}, "capabilities": []}}"#).unwrap();
        assert!(matches!(greeting, MonitorMessage::Greeting(_)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(MonitorMessage::parse("[]").is_err());
        assert!(MonitorMessage::parse("{\"foo\": 1}").is_err());
        assert!(MonitorMessage::parse("not json").is_err());
    }
}
