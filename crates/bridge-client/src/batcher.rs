//! Coalesces tool calls that arrive within the debounce window into a single
//! Command Document write.

use anyhow::Context;
use protocol::{
    new_command_id, now_timestamp, BatchCommand, CommandDocument, JsonObject, ResultDocument,
    SharedDir, Status,
};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentShape {
    Single,
    Batch,
}

/// What a flush wrote. Every command that took part in the flush receives
/// the same receipt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReceipt {
    pub shape: DocumentShape,
    pub batch_id: Option<String>,
    pub command_ids: Vec<String>,
    pub timestamp: String,
    /// Status of the document this flush overwrote, when it was still in flight.
    pub replaced_in_flight: Option<Status>,
}

/// Handle returned by [`CommandBatcher::enqueue`].
#[derive(Debug)]
pub struct PendingDispatch {
    pub command_id: String,
    receipt: oneshot::Receiver<Result<FlushReceipt, String>>,
}

impl PendingDispatch {
    /// Resolves once the batch containing this command has been written.
    pub async fn flushed(self) -> anyhow::Result<FlushReceipt> {
        match self.receipt.await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(message)) => Err(anyhow::anyhow!(message)),
            Err(_) => anyhow::bail!("batcher stopped before flushing command {}", self.command_id),
        }
    }
}

struct QueuedCommand {
    command: BatchCommand,
    respond_to: oneshot::Sender<Result<FlushReceipt, String>>,
}

pub struct CommandBatcher {
    tx: mpsc::Sender<QueuedCommand>,
    task: JoinHandle<()>,
}

impl CommandBatcher {
    pub fn spawn(dir: SharedDir, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let task = tokio::spawn(debounce_loop(dir, debounce, rx));
        Self { tx, task }
    }

    /// Queues one tool call and restarts the debounce timer.
    pub async fn enqueue(
        &self,
        tool: impl Into<String>,
        args: JsonObject,
    ) -> anyhow::Result<PendingDispatch> {
        let command = BatchCommand {
            command_id: new_command_id(),
            tool: tool.into(),
            args,
        };
        let command_id = command.command_id.clone();
        let (respond_to, receipt) = oneshot::channel();
        self.tx
            .send(QueuedCommand {
                command,
                respond_to,
            })
            .await
            .map_err(|_| anyhow::anyhow!("command batcher is not running"))?;
        tracing::debug!(command_id = %command_id, "command queued");
        Ok(PendingDispatch {
            command_id,
            receipt,
        })
    }

    /// Flushes whatever is still queued and stops the timer task.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "command batcher task failed");
        }
    }
}

async fn debounce_loop(dir: SharedDir, debounce: Duration, mut rx: mpsc::Receiver<QueuedCommand>) {
    while let Some(first) = rx.recv().await {
        let mut queue = vec![first];
        let mut closed = false;
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(command) => queue.push(command),
                    None => {
                        closed = true;
                        break;
                    }
                },
                _ = tokio::time::sleep(debounce) => break,
            }
        }

        let (commands, waiters): (Vec<_>, Vec<_>) = queue
            .into_iter()
            .map(|queued| (queued.command, queued.respond_to))
            .unzip();
        let outcome = flush(&dir, commands).await.map_err(|err| {
            tracing::error!(error = %format!("{err:#}"), "command flush failed");
            format!("{err:#}")
        });
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        if closed {
            break;
        }
    }
    tracing::debug!("command batcher stopped");
}

async fn flush(dir: &SharedDir, commands: Vec<BatchCommand>) -> anyhow::Result<FlushReceipt> {
    let command_ids: Vec<String> = commands.iter().map(|c| c.command_id.clone()).collect();
    let timestamp = now_timestamp();
    let document = CommandDocument::pending(commands, timestamp.clone())
        .context("flush called with an empty queue")?;

    let replaced_in_flight = match dir.read_command().await {
        Ok(Some(previous)) if previous.status().is_in_flight() => {
            tracing::warn!(
                event = "in_flight_overwritten",
                previous_status = %previous.status(),
                previous_timestamp = %previous.timestamp(),
                "overwriting a command document the host has not finished"
            );
            Some(previous.status())
        }
        Ok(_) => None,
        Err(err) => {
            tracing::debug!(error = %err, "previous command document unreadable");
            None
        }
    };

    dir.write_result(&ResultDocument::waiting(timestamp.clone()))
        .await
        .context("failed to reset result document")?;
    dir.write_command(&document)
        .await
        .context("failed to write command document")?;

    let shape = match &document {
        CommandDocument::Single(_) => DocumentShape::Single,
        CommandDocument::Batch(_) => DocumentShape::Batch,
    };
    tracing::info!(
        event = "command_flushed",
        shape = ?shape,
        batch_id = document.batch_id().unwrap_or("-"),
        commands = command_ids.len(),
    );
    Ok(FlushReceipt {
        shape,
        batch_id: document.batch_id().map(str::to_string),
        command_ids,
        timestamp,
        replaced_in_flight,
    })
}
