//! One poll cycle: claim a pending Command Document, run its commands in
//! order and publish the outcome.

use crate::handler::{HandlerContext, HandlerError, HandlerRegistry};
use crate::progress::{ProgressTracker, DEFAULT_ETA_WINDOW};
use futures_util::FutureExt;
use protocol::shared_dir::StatusUpdate;
use protocol::{
    now_timestamp, BatchCommand, BatchDocument, BatchResult, BatchState, CommandDocument,
    CommandResult, DocumentIdentity, JsonObject, ResultDocument, SharedDir, SingleDocument,
    SingleResult, Status,
};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing pending.
    Idle,
    Executed {
        batch_id: Option<String>,
        commands: usize,
        failed: usize,
        status: Status,
    },
    /// The document could not be executed at all.
    Rejected { message: String },
    /// The client replaced the document before it could be claimed.
    Superseded,
}

pub struct Executor {
    dir: SharedDir,
    registry: HandlerRegistry,
    ctx: HandlerContext,
    eta_window: usize,
    last_rejected: Option<String>,
}

impl Executor {
    pub fn new(registry: HandlerRegistry, mut ctx: HandlerContext) -> Self {
        ctx.tool_names = registry.names();
        Self {
            dir: ctx.dir.clone(),
            registry,
            ctx,
            eta_window: DEFAULT_ETA_WINDOW,
            last_rejected: None,
        }
    }

    pub fn with_eta_window(mut self, window: usize) -> Self {
        self.eta_window = window.max(1);
        self
    }

    pub fn shared_dir(&self) -> &SharedDir {
        &self.dir
    }

    pub async fn run_cycle(&mut self) -> anyhow::Result<CycleOutcome> {
        let value = match self.dir.read_command_value().await {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(CycleOutcome::Idle),
            Err(err) => return self.reject_unclaimable(format!("{err:#}")).await,
        };
        match value.get("status").and_then(Value::as_str).and_then(Status::parse) {
            Some(Status::Pending) => {}
            Some(_) => return Ok(CycleOutcome::Idle),
            None => {
                return self
                    .reject_unclaimable("command document has no valid status".to_string())
                    .await
            }
        }
        self.last_rejected = None;

        let identity = DocumentIdentity::from_value(&value);
        match self.dir.update_status(&identity, Status::Running).await? {
            StatusUpdate::Applied => {}
            StatusUpdate::Replaced { .. } | StatusUpdate::Missing => {
                tracing::debug!("command document changed before it was claimed");
                return Ok(CycleOutcome::Superseded);
            }
        }

        let label = command_label(&value);
        let document = match parse_document(value) {
            Ok(document) => document,
            Err(err) => {
                let message = format!("{err:#}");
                self.fail_dispatch(&identity, &label, &message).await?;
                return Ok(CycleOutcome::Rejected { message });
            }
        };
        tracing::info!(
            event = "dispatch_started",
            command = %label,
            commands = document.len(),
            timestamp = %identity.timestamp,
        );

        match document {
            CommandDocument::Single(single) => self.execute_single(&identity, single).await,
            CommandDocument::Batch(batch) => self.execute_batch(&identity, batch).await,
        }
    }

    async fn execute_single(
        &self,
        identity: &DocumentIdentity,
        single: SingleDocument,
    ) -> anyhow::Result<CycleOutcome> {
        let SingleDocument { command, args, .. } = single;
        let (result, status) = match self.invoke(&command, args).await {
            Ok(data) => (
                ResultDocument::Single(SingleResult::new(command.clone(), data, now_timestamp())),
                Status::Completed,
            ),
            Err(err) => {
                tracing::warn!(event = "command_failed", tool = %command, error = %err.message);
                (
                    ResultDocument::error(command.clone(), err.message, err.line, now_timestamp()),
                    Status::Error,
                )
            }
        };
        self.publish(identity, &result, status).await?;
        tracing::info!(event = "dispatch_completed", command = %command, status = %status);
        Ok(CycleOutcome::Executed {
            batch_id: None,
            commands: 1,
            failed: usize::from(status == Status::Error),
            status,
        })
    }

    async fn execute_batch(
        &self,
        identity: &DocumentIdentity,
        batch: BatchDocument,
    ) -> anyhow::Result<CycleOutcome> {
        let BatchDocument {
            batch_id, commands, ..
        } = batch;
        let tools: Vec<String> = commands.iter().map(|command| command.tool.clone()).collect();
        let mut tracker = ProgressTracker::new(commands.len(), self.eta_window);
        let mut results = Vec::with_capacity(commands.len());
        self.write_progress(identity, &batch_id, &tracker, tools.first(), &results)
            .await;

        for (index, BatchCommand { command_id, tool, args }) in commands.into_iter().enumerate() {
            let started = Instant::now();
            let result = match self.invoke(&tool, args).await {
                Ok(data) => CommandResult::success(command_id, data),
                Err(err) => {
                    tracing::warn!(
                        event = "command_failed",
                        batch_id = %batch_id,
                        command_id = %command_id,
                        tool = %tool,
                        error = %err.message,
                    );
                    CommandResult::failure(command_id, describe(&err))
                }
            };
            tracker.record(started.elapsed());
            results.push(result);
            if let Some(next) = tools.get(index + 1) {
                self.write_progress(identity, &batch_id, &tracker, Some(next), &results)
                    .await;
            }
        }

        let failed = results.iter().filter(|result| !result.success).count();
        let mut progress = tracker.snapshot(None);
        progress.percentage = 100;
        let document = ResultDocument::Batch(BatchResult {
            batch_id: batch_id.clone(),
            status: BatchState::Completed,
            progress,
            results,
            response_timestamp: now_timestamp(),
        });
        self.publish(identity, &document, Status::Completed).await?;
        tracing::info!(
            event = "dispatch_completed",
            batch_id = %batch_id,
            commands = tools.len(),
            failed,
        );
        Ok(CycleOutcome::Executed {
            batch_id: Some(batch_id),
            commands: tools.len(),
            failed,
            status: Status::Completed,
        })
    }

    /// Runs one handler. Unknown tools and panics become ordinary failures.
    async fn invoke(&self, tool: &str, args: JsonObject) -> Result<Value, HandlerError> {
        let Some(handler) = self.registry.get(tool) else {
            return Err(HandlerError::new(format!("unknown tool: {tool}")));
        };
        match AssertUnwindSafe(handler.handle(&self.ctx, args))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::new(format!(
                "handler {tool} panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    /// Progress is best effort; a failed write never stops the batch.
    async fn write_progress(
        &self,
        identity: &DocumentIdentity,
        batch_id: &str,
        tracker: &ProgressTracker,
        current: Option<&String>,
        results: &[CommandResult],
    ) {
        if !self.holds(identity).await {
            return;
        }
        let document = ResultDocument::Batch(BatchResult {
            batch_id: batch_id.to_string(),
            status: BatchState::Processing,
            progress: tracker.snapshot(current.map(String::as_str)),
            results: results.to_vec(),
            response_timestamp: now_timestamp(),
        });
        if let Err(err) = self.dir.write_result(&document).await {
            tracing::warn!(batch_id, error = %format!("{err:#}"), "progress write failed");
        }
    }

    /// Writes the final result, then the final status. Skipped entirely when
    /// the client has overwritten the document in the meantime.
    async fn publish(
        &self,
        identity: &DocumentIdentity,
        result: &ResultDocument,
        status: Status,
    ) -> anyhow::Result<()> {
        if !self.holds(identity).await {
            tracing::warn!(
                event = "result_discarded",
                timestamp = %identity.timestamp,
                "command document was replaced during execution"
            );
            return Ok(());
        }
        if let Err(err) = self.dir.write_result(result).await {
            if let Err(status_err) = self.set_status(identity, Status::Error).await {
                tracing::warn!(error = %format!("{status_err:#}"), "status write failed");
            }
            return Err(err.context("failed to write result document"));
        }
        self.set_status(identity, status).await
    }

    async fn fail_dispatch(
        &self,
        identity: &DocumentIdentity,
        label: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        tracing::warn!(event = "dispatch_rejected", command = %label, error = %message);
        let result = ResultDocument::error(label, message, None, now_timestamp());
        self.publish(identity, &result, Status::Error).await
    }

    /// A document without a usable status cannot be claimed, so only the
    /// Result Document is told. Repeats of the same problem are not rewritten.
    async fn reject_unclaimable(&mut self, message: String) -> anyhow::Result<CycleOutcome> {
        if self.last_rejected.as_deref() == Some(message.as_str()) {
            return Ok(CycleOutcome::Idle);
        }
        tracing::warn!(event = "dispatch_rejected", error = %message);
        self.dir
            .write_result(&ResultDocument::error(
                "unknown",
                message.clone(),
                None,
                now_timestamp(),
            ))
            .await?;
        self.last_rejected = Some(message.clone());
        Ok(CycleOutcome::Rejected { message })
    }

    async fn set_status(&self, identity: &DocumentIdentity, next: Status) -> anyhow::Result<()> {
        match self.dir.update_status(identity, next).await? {
            StatusUpdate::Applied => {}
            StatusUpdate::Replaced { found } => tracing::warn!(
                event = "status_write_skipped",
                status = %next,
                expected = %identity.timestamp,
                found = %found.timestamp,
                "command document was replaced"
            ),
            StatusUpdate::Missing => {
                tracing::warn!(event = "status_write_skipped", status = %next, "command document vanished")
            }
        }
        Ok(())
    }

    async fn holds(&self, identity: &DocumentIdentity) -> bool {
        match self.dir.read_command_value().await {
            Ok(Some(value)) => &DocumentIdentity::from_value(&value) == identity,
            _ => false,
        }
    }
}

fn parse_document(value: Value) -> anyhow::Result<CommandDocument> {
    let document: CommandDocument = serde_json::from_value(value)
        .map_err(|err| anyhow::anyhow!("malformed command document: {err}"))?;
    document.validate()?;
    Ok(document)
}

fn command_label(value: &Value) -> String {
    if let Some(command) = value.get("command").and_then(Value::as_str) {
        return command.to_string();
    }
    match value.get("batchId").and_then(Value::as_str) {
        Some(batch_id) => format!("batch {batch_id}"),
        None => "unknown".to_string(),
    }
}

fn describe(err: &HandlerError) -> String {
    match err.line {
        Some(line) => format!("{} (line {line})", err.message),
        None => err.message.clone(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
