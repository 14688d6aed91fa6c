//! Append-only ledger of every dispatch, persisted next to (but independent
//! of) the live command and result documents.

mod export;
mod query;

pub use export::READ_ONLY_TOOLS;
pub use query::{HistoryQuery, HistoryStats, ToolCount};

use anyhow::Context;
use protocol::shared_dir::write_json_atomic;
use protocol::{now_timestamp, parse_timestamp, BatchState, ResultDocument};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntryResult {
    Success,
    Error,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Absent for single-command results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: String,
    pub tool: String,
    pub parameters: Value,
    pub result: EntryResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds between start and finalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_result: Option<HostResult>,
}

impl HistoryEntry {
    pub fn started_at(&self) -> Option<SystemTime> {
        parse_timestamp(&self.timestamp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub command_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryFile {
    #[serde(default)]
    pub commands: Vec<HistoryEntry>,
    pub session: SessionInfo,
}

impl HistoryFile {
    fn fresh() -> Self {
        Self {
            commands: Vec::new(),
            session: SessionInfo {
                start_time: now_timestamp(),
                project_name: None,
                command_count: 0,
            },
        }
    }
}

/// How a dispatch ended on the client side.
#[derive(Debug, Clone)]
pub enum Completion {
    Success { response: Option<Value> },
    Error { message: String },
}

impl Completion {
    pub fn success(response: Value) -> Self {
        Completion::Success {
            response: Some(response),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Completion::Error {
            message: message.into(),
        }
    }
}

pub struct HistoryLedger {
    path: PathBuf,
    file: HistoryFile,
}

impl HistoryLedger {
    /// Loads the whole ledger into memory, or starts an empty one. Entries
    /// that no longer parse are dropped with a warning. A file that is not a
    /// ledger at all is moved aside and replaced by an empty one.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let file = match tokio::fs::read(&path).await {
            Ok(payload) => match load_tolerant(&path, &payload) {
                Some(file) => file,
                None => {
                    set_aside(&path).await?;
                    HistoryFile::fresh()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => HistoryFile::fresh(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read history {}", path.display()))
            }
        };
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.file.commands
    }

    pub fn session(&self) -> &SessionInfo {
        &self.file.session
    }

    pub fn get(&self, id: &str) -> Option<&HistoryEntry> {
        self.file.commands.iter().find(|entry| entry.id == id)
    }

    pub async fn set_project_name(&mut self, name: Option<String>) -> anyhow::Result<()> {
        self.file.session.project_name = name;
        self.persist().await
    }

    /// Appends a `pending` entry and persists immediately.
    pub async fn start_command(&mut self, tool: &str, parameters: Value) -> anyhow::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.file.commands.push(HistoryEntry {
            id: id.clone(),
            timestamp: now_timestamp(),
            tool: tool.to_string(),
            parameters,
            result: EntryResult::Pending,
            error: None,
            duration: None,
            response: None,
            command_id: None,
            host_result: None,
        });
        self.file.session.command_count += 1;
        self.persist().await?;
        Ok(id)
    }

    pub async fn attach_command_id(&mut self, id: &str, command_id: &str) -> anyhow::Result<()> {
        let entry = self.entry_mut(id)?;
        entry.command_id = Some(command_id.to_string());
        self.persist().await
    }

    /// Finalizes an entry. Returns `false` without touching anything when the
    /// entry was already finalized.
    pub async fn complete_command(&mut self, id: &str, completion: Completion) -> anyhow::Result<bool> {
        let entry = self.entry_mut(id)?;
        if entry.result != EntryResult::Pending {
            tracing::warn!(id, result = ?entry.result, "history entry already finalized");
            return Ok(false);
        }
        entry.duration = entry.started_at().map(|started| {
            SystemTime::now()
                .duration_since(started)
                .map(|elapsed| elapsed.as_millis() as u64)
                .unwrap_or(0)
        });
        match completion {
            Completion::Success { response } => {
                entry.result = EntryResult::Success;
                entry.response = response;
            }
            Completion::Error { message } => {
                entry.result = EntryResult::Error;
                entry.error = Some(message);
            }
        }
        self.persist().await?;
        Ok(true)
    }

    /// Copies per-command host outcomes from a completed batch result into
    /// `hostResult`. The dispatch-level `result` is left as recorded. Single
    /// and error results carry no command id and are skipped here; see
    /// [`HistoryLedger::reconcile_single`].
    pub async fn reconcile(&mut self, document: &ResultDocument) -> anyhow::Result<usize> {
        let ResultDocument::Batch(batch) = document else {
            return Ok(0);
        };
        if batch.status != BatchState::Completed {
            return Ok(0);
        }
        let mut updated = 0;
        for result in &batch.results {
            let host_result = HostResult {
                success: result.success,
                error: result.error.clone(),
                batch_id: Some(batch.batch_id.clone()),
            };
            for entry in self.file.commands.iter_mut() {
                if entry.command_id.as_deref() == Some(result.command_id.as_str())
                    && entry.host_result.as_ref() != Some(&host_result)
                {
                    entry.host_result = Some(host_result.clone());
                    updated += 1;
                }
            }
        }
        if updated > 0 {
            self.persist().await?;
        }
        Ok(updated)
    }

    /// Attaches a single or error result to the entry whose command was
    /// flushed alone at `flushed_at`. The result must name the entry's tool
    /// and be no older than the flush. Returns the number of entries updated.
    pub async fn reconcile_single(
        &mut self,
        command_id: &str,
        flushed_at: &str,
        document: &ResultDocument,
    ) -> anyhow::Result<usize> {
        let (host_result, tool, answered_at) = match document {
            ResultDocument::Single(single) => (
                HostResult {
                    success: true,
                    error: None,
                    batch_id: None,
                },
                single.command_executed.as_str(),
                Some(single.response_timestamp.as_str()),
            ),
            ResultDocument::Error(error) => (
                HostResult {
                    success: false,
                    error: Some(error.message.clone()),
                    batch_id: None,
                },
                error.command.as_str(),
                error.response_timestamp.as_deref(),
            ),
            ResultDocument::Batch(_) | ResultDocument::Waiting(_) => return Ok(0),
        };
        let fresh = match (answered_at.and_then(parse_timestamp), parse_timestamp(flushed_at)) {
            (Some(answered), Some(flushed)) => answered >= flushed,
            _ => false,
        };
        if !fresh {
            tracing::debug!(command_id, "result predates the flush");
            return Ok(0);
        }
        let Some(entry) = self
            .file
            .commands
            .iter_mut()
            .find(|entry| entry.command_id.as_deref() == Some(command_id))
        else {
            return Ok(0);
        };
        if entry.tool != tool || entry.host_result.as_ref() == Some(&host_result) {
            return Ok(0);
        }
        entry.host_result = Some(host_result);
        self.persist().await?;
        Ok(1)
    }

    pub fn query(&self, query: &HistoryQuery) -> Vec<&HistoryEntry> {
        query.apply(&self.file.commands)
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats::collect(&self.file.commands)
    }

    pub fn export_script(&self, tools: Option<&[String]>) -> String {
        export::replay_script(&self.file, tools)
    }

    fn entry_mut(&mut self, id: &str) -> anyhow::Result<&mut HistoryEntry> {
        self.file
            .commands
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| anyhow::anyhow!("unknown history entry {id}"))
    }

    /// Rewrites the whole file.
    async fn persist(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        write_json_atomic(&self.path, &self.file)
            .await
            .with_context(|| format!("failed to persist history {}", self.path.display()))
    }
}

#[derive(Deserialize)]
struct RawHistoryFile {
    #[serde(default)]
    commands: Vec<Value>,
    session: Option<Value>,
}

fn load_tolerant(path: &Path, payload: &[u8]) -> Option<HistoryFile> {
    let raw: RawHistoryFile = match serde_json::from_slice(payload) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "history file is unreadable");
            return None;
        }
    };
    let mut commands = Vec::with_capacity(raw.commands.len());
    for (index, value) in raw.commands.into_iter().enumerate() {
        match serde_json::from_value::<HistoryEntry>(value) {
            Ok(entry) => commands.push(entry),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    index,
                    path = %path.display(),
                    "dropping unreadable history entry"
                );
            }
        }
    }
    let session = match raw.session.map(serde_json::from_value::<SessionInfo>) {
        Some(Ok(session)) => session,
        Some(Err(err)) => {
            tracing::warn!(error = %err, path = %path.display(), "history session is unreadable");
            HistoryFile::fresh().session
        }
        None => HistoryFile::fresh().session,
    };
    Some(HistoryFile { commands, session })
}

async fn set_aside(path: &Path) -> anyhow::Result<()> {
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".corrupt-{}", uuid::Uuid::new_v4().simple()));
    let aside = PathBuf::from(aside);
    tokio::fs::rename(path, &aside)
        .await
        .with_context(|| format!("failed to move {} aside", path.display()))?;
    tracing::warn!(
        event = "history_set_aside",
        path = %path.display(),
        aside = %aside.display(),
        "starting a fresh history"
    );
    Ok(())
}
