//! Handlers every host poller ships with. Domain operations are registered
//! next to these by whoever embeds the poller.

use crate::handler::{CommandHandler, HandlerContext, HandlerError, HandlerRegistry};
use async_trait::async_trait;
use protocol::config::OperationClass;
use protocol::{now_timestamp, JsonObject};
use serde::Deserialize;
use serde_json::{json, Value};
use system_utils::process::run_with_timeout;
use tokio::process::Command;

pub fn register_builtins(registry: &mut HandlerRegistry) {
    registry.register("ping", Ping);
    registry.register("echo", Echo);
    registry.register("listTools", ListTools);
    registry.register("runScript", RunScript);
}

pub struct Ping;

#[async_trait]
impl CommandHandler for Ping {
    async fn handle(&self, _ctx: &HandlerContext, _args: JsonObject) -> Result<Value, HandlerError> {
        Ok(json!({ "pong": true, "timestamp": now_timestamp() }))
    }
}

pub struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    async fn handle(&self, _ctx: &HandlerContext, args: JsonObject) -> Result<Value, HandlerError> {
        Ok(Value::Object(args))
    }
}

pub struct ListTools;

#[async_trait]
impl CommandHandler for ListTools {
    async fn handle(&self, ctx: &HandlerContext, _args: JsonObject) -> Result<Value, HandlerError> {
        Ok(json!({ "tools": ctx.tool_names }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunScriptArgs {
    script: String,
    #[serde(default)]
    class: OperationClass,
    #[serde(default)]
    args: Vec<String>,
    /// Staged scripts are removed after they run unless this is set.
    #[serde(default)]
    keep: bool,
}

/// Runs a script staged under `<shared>/scripts/` with the configured
/// interpreter, bounded by the timeout of its operation class.
pub struct RunScript;

#[async_trait]
impl CommandHandler for RunScript {
    async fn handle(&self, ctx: &HandlerContext, args: JsonObject) -> Result<Value, HandlerError> {
        let request: RunScriptArgs = serde_json::from_value(Value::Object(args))
            .map_err(|err| HandlerError::new(format!("invalid runScript arguments: {err}")))?;
        let path = ctx.dir.script_path(&request.script)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(HandlerError::new(format!(
                "script not found: {}",
                path.display()
            )));
        }

        let limit = ctx.timeouts.for_class(request.class);
        let mut cmd = Command::new(&ctx.scripts.interpreter);
        cmd.args(&ctx.scripts.args)
            .arg(&path)
            .args(&request.args)
            .current_dir(ctx.dir.root());
        tracing::info!(
            event = "script_started",
            script = %request.script,
            class = ?request.class,
            timeout_secs = limit.as_secs(),
        );
        let output = run_with_timeout(
            &mut cmd,
            limit,
            ctx.scripts.max_output_bytes,
            &format!("script {}", request.script),
        )
        .await;

        if !request.keep {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = %path.display(), error = %err, "staged script not removed");
            }
        }

        let output = output?;
        tracing::info!(
            event = "script_finished",
            script = %request.script,
            exit_code = ?output.exit_code,
            elapsed_ms = output.elapsed.as_millis() as u64,
        );
        if !output.success() {
            let stderr = output.stderr.trim();
            let message = if stderr.is_empty() {
                format!(
                    "script {} exited with {}",
                    request.script,
                    exit_label(output.exit_code)
                )
            } else {
                stderr.to_string()
            };
            return Err(HandlerError::at_line(message, error_line(stderr)));
        }
        Ok(json!({
            "exitCode": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
            "truncated": output.truncated,
            "elapsedMs": output.elapsed.as_millis() as u64,
        }))
    }
}

fn exit_label(code: Option<i32>) -> String {
    code.map(|code| format!("status {code}"))
        .unwrap_or_else(|| "a signal".to_string())
}

/// Picks the line number out of interpreter diagnostics such as
/// `script.sh: line 3: ...` (bash) or `script.sh: 3: ...` (dash).
pub(crate) fn error_line(stderr: &str) -> Option<u32> {
    for diagnostic in stderr.lines() {
        let mut fields = diagnostic.split(':').map(str::trim).skip(1);
        if let Some(field) = fields.next() {
            let number = field.strip_prefix("line ").unwrap_or(field);
            if let Ok(line) = number.parse() {
                return Some(line);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::SharedDir;

    fn object(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn context() -> (tempfile::TempDir, HandlerContext) {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = SharedDir::new(temp.path());
        dir.ensure().await.expect("ensure");
        let mut ctx = HandlerContext::new(dir);
        ctx.tool_names = vec!["echo".to_string(), "ping".to_string()];
        (temp, ctx)
    }

    #[tokio::test]
    async fn echo_returns_its_arguments() {
        let (_temp, ctx) = context().await;
        let value = Echo
            .handle(&ctx, object(json!({"text": "hi"})))
            .await
            .expect("echo");
        assert_eq!(value, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn list_tools_reports_registered_names() {
        let (_temp, ctx) = context().await;
        let value = ListTools.handle(&ctx, JsonObject::new()).await.expect("list");
        assert_eq!(value["tools"], json!(["echo", "ping"]));
    }

    #[tokio::test]
    async fn missing_script_is_a_handler_error() {
        let (_temp, ctx) = context().await;
        let err = RunScript
            .handle(&ctx, object(json!({"script": "absent.sh"})))
            .await
            .expect_err("missing");
        assert!(err.message.contains("script not found"));
    }

    #[tokio::test]
    async fn script_arguments_are_validated() {
        let (_temp, ctx) = context().await;
        let err = RunScript
            .handle(&ctx, object(json!({"script": 7})))
            .await
            .expect_err("bad args");
        assert!(err.message.contains("invalid runScript arguments"));
        let err = RunScript
            .handle(&ctx, object(json!({"script": "../outside.sh"})))
            .await
            .expect_err("escape");
        assert!(err.message.contains("invalid script name"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_staged_script_and_removes_it() {
        let (_temp, ctx) = context().await;
        let path = ctx.dir.script_path("hello.sh").expect("path");
        std::fs::write(&path, "echo \"hello $1\"\n").expect("stage");

        let value = RunScript
            .handle(
                &ctx,
                object(json!({"script": "hello.sh", "class": "quick", "args": ["host"]})),
            )
            .await
            .expect("run");
        assert_eq!(value["exitCode"], 0);
        assert_eq!(value["stdout"].as_str().map(str::trim), Some("hello host"));
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_script_reports_stderr() {
        let (_temp, ctx) = context().await;
        let path = ctx.dir.script_path("fail.sh").expect("path");
        std::fs::write(&path, "echo 'layer missing' 1>&2\nexit 2\n").expect("stage");

        let err = RunScript
            .handle(&ctx, object(json!({"script": "fail.sh", "keep": true})))
            .await
            .expect_err("failure");
        assert_eq!(err.message, "layer missing");
        assert!(path.exists());
    }

    #[test]
    fn extracts_line_numbers_from_diagnostics() {
        assert_eq!(
            error_line("/tmp/s/fail.sh: line 3: nope: command not found"),
            Some(3)
        );
        assert_eq!(error_line("/tmp/s/fail.sh: 7: nope: not found"), Some(7));
        assert_eq!(error_line("layer missing"), None);
    }
}
