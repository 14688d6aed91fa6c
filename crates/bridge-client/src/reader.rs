//! Reads the Result Document and flags it when it has not been touched for a
//! while. The flag is advisory: a stopped poller and a long render look the
//! same from here.

use protocol::{ResultDocument, SharedDir};
use serde_json::{json, Value};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Fresh { content: Value },
    Stale {
        warning: String,
        original_content: Value,
        age: Duration,
    },
    Missing { message: String },
    Unreadable { message: String },
}

impl ReadOutcome {
    /// JSON handed back to callers: fresh content as-is, everything else
    /// wrapped with an explanation.
    pub fn to_response(&self) -> Value {
        match self {
            ReadOutcome::Fresh { content } => content.clone(),
            ReadOutcome::Stale {
                warning,
                original_content,
                ..
            } => json!({ "warning": warning, "originalContent": original_content }),
            ReadOutcome::Missing { message } => json!({ "warning": message }),
            ReadOutcome::Unreadable { message } => json!({ "error": message }),
        }
    }

    pub fn document(&self) -> Option<ResultDocument> {
        let content = match self {
            ReadOutcome::Fresh { content } => content,
            ReadOutcome::Stale {
                original_content, ..
            } => original_content,
            _ => return None,
        };
        serde_json::from_value(content.clone()).ok()
    }

    /// Neither the waiting placeholder nor a batch still processing.
    pub fn is_settled(&self) -> bool {
        match self {
            ReadOutcome::Fresh { .. } | ReadOutcome::Stale { .. } => {
                self.document().map_or(true, |document| document.is_settled())
            }
            _ => false,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, ReadOutcome::Stale { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ResultReader {
    dir: SharedDir,
    stale_after: Duration,
}

impl ResultReader {
    pub fn new(dir: SharedDir, stale_after: Duration) -> Self {
        Self { dir, stale_after }
    }

    pub async fn read(&self) -> ReadOutcome {
        match self.dir.read_result_raw().await {
            Ok(Some((raw, modified))) => {
                classify(&raw, modified, SystemTime::now(), self.stale_after)
            }
            Ok(None) => ReadOutcome::Missing {
                message: format!(
                    "No result file at {}. Is the host poller running?",
                    self.dir.result_path().display()
                ),
            },
            Err(err) => ReadOutcome::Unreadable {
                message: format!("{err:#}"),
            },
        }
    }

    /// Re-reads until the result settles or `timeout` elapses. The last read
    /// is returned either way.
    pub async fn wait_for_result(&self, timeout: Duration, interval: Duration) -> ReadOutcome {
        let started = Instant::now();
        loop {
            let outcome = self.read().await;
            if outcome.is_settled() || started.elapsed() >= timeout {
                return outcome;
            }
            tokio::time::sleep(interval).await;
        }
    }
}

pub fn classify(raw: &str, modified: SystemTime, now: SystemTime, stale_after: Duration) -> ReadOutcome {
    let content: Value = match serde_json::from_str(raw) {
        Ok(content) => content,
        Err(err) => {
            return ReadOutcome::Unreadable {
                message: format!("result file is not valid JSON: {err}"),
            }
        }
    };
    // A modification time in the future counts as fresh.
    let age = now.duration_since(modified).unwrap_or_default();
    if age <= stale_after {
        return ReadOutcome::Fresh { content };
    }
    tracing::warn!(age_secs = age.as_secs(), "result document is stale");
    ReadOutcome::Stale {
        warning: format!(
            "Result file has not been updated for {}s (threshold {}s). \
             The host poller may have stopped, or a long operation is still running.",
            age.as_secs(),
            stale_after.as_secs()
        ),
        original_content: content,
        age,
    }
}
