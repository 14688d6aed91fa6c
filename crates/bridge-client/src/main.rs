mod cli;
mod settings;

use anyhow::Context;
use bridge_client::{Bridge, DispatchOutcome, EntryResult, HistoryLedger, HistoryQuery, ReadOutcome};
use clap::Parser;
use cli::{Args, ClassArg, Command, HistoryCommand, ResultArg, WaitArgs};
use protocol::config::{OperationClass, TimeoutConfig};
use protocol::{parse_timestamp, SharedDir};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use settings::{load_client_settings, ClientSettings};
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const WAIT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct BatchCall {
    tool: String,
    #[serde(default)]
    args: Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let settings = load_client_settings(&args)?;

    match args.command {
        Command::History(command) => run_history(&settings, command).await,
        command => {
            let bridge = Bridge::open(settings.bridge.clone()).await?;
            let result = run_bridge(&bridge, &settings.timeouts, command).await;
            bridge.shutdown().await;
            result
        }
    }
}

async fn run_bridge(bridge: &Bridge, timeouts: &TimeoutConfig, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Send { tool, args, wait } => {
            let args: Value = serde_json::from_str(&args)
                .with_context(|| format!("arguments for {tool} are not valid JSON"))?;
            let outcome = bridge.dispatch(&tool, args).await?;
            print_json(&outcome)?;
            finish_wait(bridge, timeouts, &wait, std::slice::from_ref(&outcome)).await
        }
        Command::Batch { file, wait } => {
            let raw = match file {
                Some(path) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut raw = String::new();
                    tokio::io::stdin()
                        .read_to_string(&mut raw)
                        .await
                        .context("failed to read stdin")?;
                    raw
                }
            };
            let calls: Vec<BatchCall> =
                serde_json::from_str(&raw).context("batch input must be a JSON array")?;
            let outcomes = bridge
                .dispatch_all(calls.into_iter().map(|call| (call.tool, call.args)).collect())
                .await;
            let mut failed = 0;
            let report: Vec<Value> = outcomes
                .iter()
                .map(|outcome| match outcome {
                    Ok(outcome) => serde_json::to_value(outcome).unwrap_or(Value::Null),
                    Err(err) => {
                        failed += 1;
                        json!({ "error": format!("{err:#}") })
                    }
                })
                .collect();
            print_json(&report)?;
            if failed > 0 {
                anyhow::bail!("{failed} of {} calls failed to dispatch", report.len());
            }
            let dispatched: Vec<DispatchOutcome> = outcomes.into_iter().filter_map(Result::ok).collect();
            finish_wait(bridge, timeouts, &wait, &dispatched).await
        }
        Command::ReadResult => {
            let outcome = bridge.read_result().await;
            print_json(&outcome.to_response())
        }
        Command::Wait {
            class,
            timeout_secs,
            interval_ms,
        } => {
            let limit = wait_limit(timeouts, class, timeout_secs);
            let outcome = bridge
                .wait_for_result(limit, Duration::from_millis(interval_ms.max(1)))
                .await;
            settle(bridge, outcome, &[]).await
        }
        Command::Reconcile => {
            let updated = bridge.reconcile().await?;
            print_json(&json!({ "updated": updated }))
        }
        Command::RunScript { file, name, wait } => {
            let contents = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
                    .with_context(|| format!("cannot derive a script name from {}", file.display()))?,
            };
            bridge.stage_script(&name, &contents).await?;
            let class = OperationClass::from(wait.class);
            let outcome = bridge
                .dispatch("runScript", json!({ "script": name, "class": class }))
                .await?;
            print_json(&outcome)?;
            finish_wait(bridge, timeouts, &wait, std::slice::from_ref(&outcome)).await
        }
        Command::History(_) => anyhow::bail!("history commands do not open the shared directory"),
    }
}

async fn finish_wait(
    bridge: &Bridge,
    timeouts: &TimeoutConfig,
    wait: &WaitArgs,
    dispatched: &[DispatchOutcome],
) -> anyhow::Result<()> {
    if !wait.wait {
        return Ok(());
    }
    let limit = wait_limit(timeouts, wait.class, wait.timeout_secs);
    let outcome = bridge.wait_for_result(limit, WAIT_INTERVAL).await;
    settle(bridge, outcome, dispatched).await
}

async fn settle(
    bridge: &Bridge,
    outcome: ReadOutcome,
    dispatched: &[DispatchOutcome],
) -> anyhow::Result<()> {
    if outcome.is_settled() {
        if let Some(document) = outcome.document() {
            bridge.reconcile_document(&document, dispatched).await?;
        }
    } else {
        tracing::warn!("result did not settle before the wait timed out");
    }
    print_json(&outcome.to_response())
}

fn wait_limit(timeouts: &TimeoutConfig, class: ClassArg, explicit: Option<u64>) -> Duration {
    explicit
        .map(Duration::from_secs)
        .unwrap_or_else(|| timeouts.for_class(class.into()))
}

async fn run_history(settings: &ClientSettings, command: HistoryCommand) -> anyhow::Result<()> {
    let path = settings
        .bridge
        .history_path
        .clone()
        .unwrap_or_else(|| SharedDir::new(&settings.bridge.shared_dir).default_history_path());
    let ledger = HistoryLedger::open(&path).await?;
    match command {
        HistoryCommand::List {
            tool,
            result,
            since,
            until,
            limit,
        } => {
            let query = HistoryQuery {
                tool,
                result: result.map(|result| match result {
                    ResultArg::Success => EntryResult::Success,
                    ResultArg::Error => EntryResult::Error,
                    ResultArg::Pending => EntryResult::Pending,
                }),
                since: since.as_deref().map(parse_bound).transpose()?,
                until: until.as_deref().map(parse_bound).transpose()?,
                limit,
            };
            print_json(&ledger.query(&query))
        }
        HistoryCommand::Stats => print_json(&ledger.stats()),
        HistoryCommand::Export { tools, output } => {
            let filter = (!tools.is_empty()).then_some(tools.as_slice());
            let script = ledger.export_script(filter);
            match output {
                Some(output) => write_script(&output, &script).await,
                None => {
                    print!("{script}");
                    Ok(())
                }
            }
        }
    }
}

fn parse_bound(raw: &str) -> anyhow::Result<std::time::SystemTime> {
    parse_timestamp(raw).with_context(|| format!("invalid RFC 3339 timestamp: {raw}"))
}

async fn write_script(path: &Path, script: &str) -> anyhow::Result<()> {
    tokio::fs::write(path, script)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .await
            .with_context(|| format!("failed to mark {} executable", path.display()))?;
    }
    tracing::info!(event = "history_exported", path = %path.display());
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Logs go to stderr; stdout carries command output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);
    tracing_subscriber::registry().with(filter).with(layer).init();
}
