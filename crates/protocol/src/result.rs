use crate::JsonObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const COMMAND_EXECUTED_KEY: &str = "_commandExecuted";
const RESPONSE_TIMESTAMP_KEY: &str = "_responseTimestamp";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Processing,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn success(command_id: impl Into<String>, data: Value) -> Self {
        Self {
            command_id: command_id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub status: BatchState,
    pub progress: Progress,
    pub results: Vec<CommandResult>,
    #[serde(rename = "_responseTimestamp")]
    pub response_timestamp: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitingTag {
    Waiting,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitingResult {
    pub status: WaitingTag,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTag {
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResult {
    pub status: ErrorTag,
    pub command: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(
        rename = "_responseTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub response_timestamp: Option<String>,
}

/// Domain result fields with the two bookkeeping keys appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SingleResult {
    #[serde(flatten)]
    pub data: JsonObject,
    #[serde(rename = "_commandExecuted")]
    pub command_executed: String,
    #[serde(rename = "_responseTimestamp")]
    pub response_timestamp: String,
}

impl SingleResult {
    /// Non-object handler output is nested under `result`.
    pub fn new(command: impl Into<String>, data: Value, response_timestamp: String) -> Self {
        let mut data = match data {
            Value::Object(map) => map,
            Value::Null => JsonObject::new(),
            other => {
                let mut map = JsonObject::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        data.remove(COMMAND_EXECUTED_KEY);
        data.remove(RESPONSE_TIMESTAMP_KEY);
        Self {
            data,
            command_executed: command.into(),
            response_timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResultDocument {
    Batch(BatchResult),
    Waiting(WaitingResult),
    Error(ErrorResult),
    Single(SingleResult),
}

impl ResultDocument {
    pub fn waiting(timestamp: String) -> Self {
        ResultDocument::Waiting(WaitingResult {
            status: WaitingTag::Waiting,
            message: "Waiting for the host poller to pick up the command".to_string(),
            timestamp,
        })
    }

    pub fn error(
        command: impl Into<String>,
        message: impl Into<String>,
        line: Option<u32>,
        response_timestamp: String,
    ) -> Self {
        ResultDocument::Error(ErrorResult {
            status: ErrorTag::Error,
            command: command.into(),
            message: message.into(),
            line,
            response_timestamp: Some(response_timestamp),
        })
    }

    /// True while the host has not produced a final outcome yet.
    pub fn is_settled(&self) -> bool {
        match self {
            ResultDocument::Waiting(_) => false,
            ResultDocument::Batch(batch) => batch.status == BatchState::Completed,
            ResultDocument::Error(_) | ResultDocument::Single(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_result_flattens_domain_fields() {
        let doc = ResultDocument::Single(SingleResult::new(
            "getProjectInfo",
            json!({ "projectName": "demo", "itemCount": 3 }),
            "2024-05-01T10:00:00.000Z".to_string(),
        ));
        let value = serde_json::to_value(&doc).expect("serialize");
        assert_eq!(value["projectName"], "demo");
        assert_eq!(value["_commandExecuted"], "getProjectInfo");
        assert_eq!(value["_responseTimestamp"], "2024-05-01T10:00:00.000Z");

        let decoded: ResultDocument = serde_json::from_value(value).expect("parse");
        assert_eq!(decoded, doc);
    }

    #[test]
    fn single_result_drops_spoofed_bookkeeping_keys() {
        let single = SingleResult::new(
            "echo",
            json!({ "_commandExecuted": "other", "ok": true }),
            "t".to_string(),
        );
        assert_eq!(single.command_executed, "echo");
        assert!(!single.data.contains_key("_commandExecuted"));
    }

    #[test]
    fn scalar_handler_output_is_nested() {
        let single = SingleResult::new("count", json!(42), "t".to_string());
        assert_eq!(single.data["result"], 42);
    }

    #[test]
    fn distinguishes_document_shapes() {
        let waiting: ResultDocument =
            serde_json::from_value(json!({"status": "waiting", "message": "m", "timestamp": "t"}))
                .expect("waiting");
        assert!(matches!(waiting, ResultDocument::Waiting(_)));
        assert!(!waiting.is_settled());

        let error: ResultDocument = serde_json::from_value(
            json!({"status": "error", "command": "applyEffect", "message": "boom", "line": 12}),
        )
        .expect("error");
        match &error {
            ResultDocument::Error(err) => assert_eq!(err.line, Some(12)),
            other => panic!("unexpected {other:?}"),
        }

        let batch: ResultDocument = serde_json::from_value(json!({
            "batchId": "batch-1",
            "status": "processing",
            "progress": {"completed": 1, "total": 2, "percentage": 50},
            "results": [{"commandId": "c1", "success": true, "data": {}}],
            "_responseTimestamp": "t"
        }))
        .expect("batch");
        assert!(matches!(batch, ResultDocument::Batch(_)));
        assert!(!batch.is_settled());
    }

    #[test]
    fn failed_command_result_omits_data() {
        let value = serde_json::to_value(CommandResult::failure("c1", "boom")).expect("serialize");
        assert_eq!(value, json!({"commandId": "c1", "success": false, "error": "boom"}));
    }
}
