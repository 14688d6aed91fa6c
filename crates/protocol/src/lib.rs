use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::time::SystemTime;

pub mod config;
pub mod result;
pub mod shared_dir;

pub use result::{
    BatchResult, BatchState, CommandResult, ErrorResult, Progress, ResultDocument, SingleResult,
    WaitingResult,
};
pub use shared_dir::SharedDir;

/// Tool arguments as carried on the wire: always a JSON object.
pub type JsonObject = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Error => "error",
        }
    }

    /// The only legal moves are pending -> running -> {completed, error}.
    pub fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Pending, Status::Running)
                | (Status::Running, Status::Completed)
                | (Status::Running, Status::Error)
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Status::Pending | Status::Running)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Status::Pending),
            "running" => Some(Status::Running),
            "completed" => Some(Status::Completed),
            "error" => Some(Status::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchCommand {
    pub command_id: String,
    pub tool: String,
    #[serde(default)]
    pub args: JsonObject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchDocument {
    pub batch_id: String,
    pub timestamp: String,
    pub status: Status,
    pub commands: Vec<BatchCommand>,
}

/// Legacy shape kept for pollers that predate batching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SingleDocument {
    pub command: String,
    #[serde(default)]
    pub args: JsonObject,
    pub timestamp: String,
    pub status: Status,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CommandDocument {
    Batch(BatchDocument),
    Single(SingleDocument),
}

impl CommandDocument {
    /// Builds the document a flush writes: one command keeps the legacy
    /// shape, more than one becomes a batch.
    pub fn pending(mut commands: Vec<BatchCommand>, timestamp: String) -> Option<Self> {
        match commands.len() {
            0 => None,
            1 => {
                let only = commands.remove(0);
                Some(CommandDocument::Single(SingleDocument {
                    command: only.tool,
                    args: only.args,
                    timestamp,
                    status: Status::Pending,
                }))
            }
            _ => Some(CommandDocument::Batch(BatchDocument {
                batch_id: new_batch_id(),
                timestamp,
                status: Status::Pending,
                commands,
            })),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            CommandDocument::Batch(doc) => doc.status,
            CommandDocument::Single(doc) => doc.status,
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            CommandDocument::Batch(doc) => &doc.timestamp,
            CommandDocument::Single(doc) => &doc.timestamp,
        }
    }

    pub fn batch_id(&self) -> Option<&str> {
        match self {
            CommandDocument::Batch(doc) => Some(&doc.batch_id),
            CommandDocument::Single(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CommandDocument::Batch(doc) => doc.commands.len(),
            CommandDocument::Single(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn identity(&self) -> DocumentIdentity {
        DocumentIdentity {
            batch_id: self.batch_id().map(str::to_string),
            timestamp: self.timestamp().to_string(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            CommandDocument::Single(doc) => {
                if doc.command.trim().is_empty() {
                    anyhow::bail!("command name is empty");
                }
            }
            CommandDocument::Batch(doc) => {
                if doc.commands.is_empty() {
                    anyhow::bail!("batch {} has no commands", doc.batch_id);
                }
                let mut seen = HashSet::new();
                for (index, command) in doc.commands.iter().enumerate() {
                    if command.tool.trim().is_empty() {
                        anyhow::bail!("commands[{index}] has an empty tool name");
                    }
                    if !seen.insert(command.command_id.as_str()) {
                        anyhow::bail!("duplicate commandId {}", command.command_id);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Identifies one particular Command Document so a writer can tell whether
/// the slot was overwritten since it last looked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentIdentity {
    pub batch_id: Option<String>,
    pub timestamp: String,
}

impl DocumentIdentity {
    /// Extracted from the raw JSON so that documents which fail typed
    /// parsing can still be matched.
    pub fn from_value(value: &Value) -> Self {
        Self {
            batch_id: value
                .get("batchId")
                .and_then(Value::as_str)
                .map(str::to_string),
            timestamp: value
                .get("timestamp")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

pub fn new_command_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn new_batch_id() -> String {
    format!("batch-{}", uuid::Uuid::new_v4())
}

pub fn format_timestamp(time: SystemTime) -> String {
    humantime::format_rfc3339_millis(time).to_string()
}

pub fn now_timestamp() -> String {
    format_timestamp(SystemTime::now())
}

pub fn parse_timestamp(raw: &str) -> Option<SystemTime> {
    humantime::parse_rfc3339_weak(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(id: &str, tool: &str) -> BatchCommand {
        BatchCommand {
            command_id: id.to_string(),
            tool: tool.to_string(),
            args: JsonObject::new(),
        }
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        assert!(Status::Pending.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::Completed));
        assert!(Status::Running.can_transition_to(Status::Error));
        assert!(!Status::Pending.can_transition_to(Status::Completed));
        assert!(!Status::Pending.can_transition_to(Status::Error));
        assert!(!Status::Completed.can_transition_to(Status::Running));
        assert!(!Status::Error.can_transition_to(Status::Pending));
        assert!(!Status::Running.can_transition_to(Status::Pending));
    }

    #[test]
    fn one_command_uses_legacy_shape() {
        let doc = CommandDocument::pending(vec![command("c1", "ping")], now_timestamp())
            .expect("document");
        let value = serde_json::to_value(&doc).expect("serialize");
        assert_eq!(value["command"], "ping");
        assert_eq!(value["status"], "pending");
        assert!(value["args"].is_object());
        assert!(value.get("batchId").is_none());
    }

    #[test]
    fn several_commands_use_batch_shape() {
        let doc = CommandDocument::pending(
            vec![command("c1", "a"), command("c2", "b")],
            now_timestamp(),
        )
        .expect("document");
        let value = serde_json::to_value(&doc).expect("serialize");
        assert!(value["batchId"].as_str().expect("batch id").starts_with("batch-"));
        assert_eq!(value["commands"][1]["commandId"], "c2");
        assert_eq!(value["commands"][1]["tool"], "b");
    }

    #[test]
    fn empty_queue_builds_nothing() {
        assert!(CommandDocument::pending(Vec::new(), now_timestamp()).is_none());
    }

    #[test]
    fn parses_documents_written_by_older_clients() {
        let raw = json!({
            "command": "createComposition",
            "args": { "name": "Main", "width": 1920 },
            "timestamp": "2024-05-01T10:00:00.000Z",
            "status": "running"
        });
        let doc: CommandDocument = serde_json::from_value(raw).expect("parse");
        match doc {
            CommandDocument::Single(single) => {
                assert_eq!(single.command, "createComposition");
                assert_eq!(single.status, Status::Running);
                assert_eq!(single.args["width"], 1920);
            }
            CommandDocument::Batch(_) => panic!("expected legacy shape"),
        }
    }

    #[test]
    fn validate_rejects_duplicate_command_ids() {
        let doc = CommandDocument::Batch(BatchDocument {
            batch_id: "batch-1".to_string(),
            timestamp: now_timestamp(),
            status: Status::Pending,
            commands: vec![command("same", "a"), command("same", "b")],
        });
        let err = doc.validate().expect_err("duplicate ids");
        assert!(err.to_string().contains("duplicate commandId"));
    }

    #[test]
    fn identity_from_raw_value_matches_typed_identity() {
        let doc = CommandDocument::pending(
            vec![command("c1", "a"), command("c2", "b")],
            "2024-05-01T10:00:00.000Z".to_string(),
        )
        .expect("document");
        let value = serde_json::to_value(&doc).expect("serialize");
        assert_eq!(DocumentIdentity::from_value(&value), doc.identity());
    }

    #[test]
    fn timestamps_roundtrip_through_rfc3339() {
        let raw = now_timestamp();
        let parsed = parse_timestamp(&raw).expect("parse");
        assert_eq!(format_timestamp(parsed), raw);
    }
}
