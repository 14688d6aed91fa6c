use crate::batcher::{CommandBatcher, DocumentShape, FlushReceipt};
use crate::history::{Completion, HistoryLedger};
use crate::reader::{ReadOutcome, ResultReader};
use anyhow::Context;
use futures_util::future::join_all;
use protocol::{JsonObject, ResultDocument, SharedDir};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub shared_dir: PathBuf,
    pub debounce: Duration,
    pub stale_after: Duration,
    pub history_path: Option<PathBuf>,
    pub project_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub history_id: String,
    pub command_id: String,
    pub receipt: FlushReceipt,
}

/// Client-side state for one shared directory: the batcher, the history
/// ledger and the result reader. Build one per process and pass it around.
pub struct Bridge {
    dir: SharedDir,
    batcher: CommandBatcher,
    ledger: Mutex<HistoryLedger>,
    reader: ResultReader,
}

impl Bridge {
    pub async fn open(settings: BridgeSettings) -> anyhow::Result<Self> {
        let dir = SharedDir::new(settings.shared_dir);
        dir.ensure().await?;
        let history_path = settings
            .history_path
            .unwrap_or_else(|| dir.default_history_path());
        let mut ledger = HistoryLedger::open(history_path).await?;
        if settings.project_name.is_some()
            && ledger.session().project_name != settings.project_name
        {
            ledger.set_project_name(settings.project_name).await?;
        }
        tracing::debug!(
            shared_dir = %dir.root().display(),
            history = %ledger.path().display(),
            "bridge opened"
        );
        Ok(Self {
            batcher: CommandBatcher::spawn(dir.clone(), settings.debounce),
            reader: ResultReader::new(dir.clone(), settings.stale_after),
            ledger: Mutex::new(ledger),
            dir,
        })
    }

    pub fn shared_dir(&self) -> &SharedDir {
        &self.dir
    }

    pub fn ledger(&self) -> &Mutex<HistoryLedger> {
        &self.ledger
    }

    /// Records the call, queues it and waits for the flush that carries it.
    /// Success means the command reached the shared directory, not that the
    /// host executed it.
    pub async fn dispatch(&self, tool: &str, args: Value) -> anyhow::Result<DispatchOutcome> {
        let history_id = self
            .ledger
            .lock()
            .await
            .start_command(tool, args.clone())
            .await?;

        let outcome = self.send(&history_id, tool, args).await;
        let completion = match &outcome {
            Ok(outcome) => Completion::success(serde_json::to_value(&outcome.receipt)?),
            Err(err) => Completion::error(format!("{err:#}")),
        };
        self.ledger
            .lock()
            .await
            .complete_command(&history_id, completion)
            .await?;
        if let Err(err) = &outcome {
            tracing::warn!(tool, error = %format!("{err:#}"), "dispatch failed");
        }
        outcome
    }

    /// Dispatches concurrently so calls land in the same debounce window.
    pub async fn dispatch_all(
        &self,
        calls: Vec<(String, Value)>,
    ) -> Vec<anyhow::Result<DispatchOutcome>> {
        join_all(
            calls
                .into_iter()
                .map(|(tool, args)| async move { self.dispatch(&tool, args).await }),
        )
        .await
    }

    async fn send(&self, history_id: &str, tool: &str, args: Value) -> anyhow::Result<DispatchOutcome> {
        let args = validate_call(tool, args)?;
        let pending = self.batcher.enqueue(tool, args).await?;
        let command_id = pending.command_id.clone();
        self.ledger
            .lock()
            .await
            .attach_command_id(history_id, &command_id)
            .await?;
        let receipt = pending.flushed().await?;
        Ok(DispatchOutcome {
            history_id: history_id.to_string(),
            command_id,
            receipt,
        })
    }

    pub async fn read_result(&self) -> ReadOutcome {
        self.reader.read().await
    }

    pub async fn wait_for_result(&self, timeout: Duration, interval: Duration) -> ReadOutcome {
        self.reader.wait_for_result(timeout, interval).await
    }

    /// Pulls per-command host outcomes from the current result into history.
    pub async fn reconcile(&self) -> anyhow::Result<usize> {
        let Some(document) = self.reader.read().await.document() else {
            return Ok(0);
        };
        self.reconcile_document(&document, &[]).await
    }

    /// Batch results match history by command id. Single and error results
    /// carry no id, so they only match a command from `dispatched` that was
    /// flushed alone.
    pub async fn reconcile_document(
        &self,
        document: &ResultDocument,
        dispatched: &[DispatchOutcome],
    ) -> anyhow::Result<usize> {
        let mut ledger = self.ledger.lock().await;
        if let ResultDocument::Batch(_) = document {
            return ledger.reconcile(document).await;
        }
        let Some(single) = dispatched
            .iter()
            .rev()
            .find(|outcome| outcome.receipt.shape == DocumentShape::Single)
        else {
            return Ok(0);
        };
        ledger
            .reconcile_single(&single.command_id, &single.receipt.timestamp, document)
            .await
    }

    /// Writes a script under `<shared>/scripts/` for `runScript` to pick up.
    pub async fn stage_script(&self, name: &str, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.dir.script_path(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("failed to stage script {}", path.display()))?;
        tracing::info!(event = "script_staged", path = %path.display());
        Ok(path)
    }

    pub async fn shutdown(self) {
        self.batcher.shutdown().await;
    }
}

fn validate_call(tool: &str, args: Value) -> anyhow::Result<JsonObject> {
    if tool.trim().is_empty() {
        anyhow::bail!("tool name is empty");
    }
    if tool.chars().any(char::is_control) {
        anyhow::bail!("tool name {tool:?} contains control characters");
    }
    match args {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(JsonObject::new()),
        other => anyhow::bail!("arguments for {tool} must be a JSON object, got {other}"),
    }
}
