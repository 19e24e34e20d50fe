//! WebSocket message types.
//!
//! Every frame is a JSON object tagged by `type`, with camelCase names.

use chrono::{DateTime, Utc};
use gcode_core::pipeline::Stage;
use gcode_core::{ExecutionId, ExecutionNotice, ExecutionOutcome};
use serde::{Deserialize, Serialize};

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    SetUsername {
        username: String,
    },
    SendMessage {
        message: String,
    },
    RunCode {
        language: String,
        code: String,
        #[serde(default)]
        stdin: Option<String>,
    },
    /// Stop every execution this connection has in flight.
    CancelRun,
}

/// Messages the server sends to one client or to the whole room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    UserList {
        users: Vec<String>,
    },
    ChatMessage {
        username: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RunResult {
        execution_id: ExecutionId,
        output: String,
        failed: bool,
        stage: Option<Stage>,
        outcome: ExecutionOutcome,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

impl From<ExecutionNotice> for ServerMessage {
    fn from(notice: ExecutionNotice) -> Self {
        ServerMessage::RunResult {
            execution_id: notice.execution_id,
            output: notice.result.combined_output,
            failed: notice.result.failed,
            stage: notice.result.stage,
            outcome: notice.result.outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcode_core::{ExecutionResult, SessionId};
    use serde_json::json;

    #[test]
    fn test_client_message_parsing() {
        let run: ClientMessage = serde_json::from_value(json!({
            "type": "runCode",
            "language": "python",
            "code": "print(input())",
            "stdin": "hi"
        }))
        .unwrap();
        assert_eq!(
            run,
            ClientMessage::RunCode {
                language: "python".to_string(),
                code: "print(input())".to_string(),
                stdin: Some("hi".to_string()),
            }
        );

        let cancel: ClientMessage = serde_json::from_str(r#"{"type":"cancelRun"}"#).unwrap();
        assert_eq!(cancel, ClientMessage::CancelRun);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"aiSuggestion"}"#).is_err());
    }

    #[test]
    fn test_run_result_wire_format() {
        let notice = ExecutionNotice {
            session_id: SessionId::from("s"),
            execution_id: uuid::Uuid::nil(),
            result: ExecutionResult {
                combined_output: "Compilation Error:\nboom".to_string(),
                failed: true,
                stage: Some(Stage::Compile),
                outcome: ExecutionOutcome::CompileFailed { exit_code: Some(1) },
            },
        };

        let value = serde_json::to_value(ServerMessage::from(notice)).unwrap();
        assert_eq!(value["type"], "runResult");
        assert_eq!(value["executionId"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(value["failed"], true);
        assert_eq!(value["stage"], "compile");
        assert_eq!(value["outcome"]["status"], "compile_failed");
        assert_eq!(value["outcome"]["exit_code"], 1);
    }
}
