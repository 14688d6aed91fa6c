use super::{EntryResult, HistoryEntry, HistoryFile};
use std::fmt::Write;

/// Tools that only inspect state; replaying them changes nothing.
pub const READ_ONLY_TOOLS: &[&str] = &[
    "ping",
    "echo",
    "listTools",
    "getProjectInfo",
    "listCompositions",
    "getLayerInfo",
    "getResults",
];

/// Renders the ledger as a POSIX shell script that re-sends every successful
/// state-changing call through the `bridge` binary. Everything else stays
/// visible as a comment.
pub(crate) fn replay_script(file: &HistoryFile, tools: Option<&[String]>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "#!/bin/sh");
    let _ = writeln!(out, "# Replay of bridge history");
    let _ = writeln!(out, "# session started {}", file.session.start_time);
    if let Some(project) = file.session.project_name.as_deref() {
        let _ = writeln!(out, "# project {}", single_line(project));
    }
    let _ = writeln!(out, "set -e");
    let _ = writeln!(out);

    for entry in &file.commands {
        if let Some(tools) = tools {
            if !tools.iter().any(|tool| tool == &entry.tool) {
                continue;
            }
        }
        let _ = writeln!(out, "# {} {}", entry.timestamp, single_line(&entry.tool));
        match skip_reason(entry) {
            Some(reason) => {
                let _ = writeln!(out, "# skipped ({reason}): {}", single_line(&send_line(entry)));
            }
            None => {
                let _ = writeln!(out, "{}", send_line(entry));
            }
        }
    }
    out
}

fn skip_reason(entry: &HistoryEntry) -> Option<&'static str> {
    match entry.result {
        EntryResult::Pending => Some("pending"),
        EntryResult::Error => Some("failed"),
        EntryResult::Success if READ_ONLY_TOOLS.contains(&entry.tool.as_str()) => {
            Some("read-only")
        }
        EntryResult::Success => None,
    }
}

fn send_line(entry: &HistoryEntry) -> String {
    let args = serde_json::to_string(&entry.parameters).unwrap_or_else(|_| "{}".to_string());
    format!("bridge send {} {}", shell_escape(&entry.tool), shell_escape(&args))
}

fn shell_escape(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

fn single_line(raw: &str) -> String {
    raw.replace(['\n', '\r'], " ")
}
