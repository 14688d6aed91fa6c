use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs `cmd` to completion, killing it once `limit` elapses. The limit
/// covers draining both output streams too, so a background process that
/// inherits the pipes cannot hold the call open. On unix the child leads its
/// own process group and the kill reaches its descendants. Each output
/// stream keeps at most `max_output_bytes`; the rest is drained and dropped.
pub async fn run_with_timeout(
    cmd: &mut Command,
    limit: Duration,
    max_output_bytes: usize,
    label: &str,
) -> anyhow::Result<ProcessOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    apply_process_group(cmd);
    let started = Instant::now();
    let mut child = cmd.spawn().with_context(|| format!("failed to spawn {label}"))?;
    // The group outlives its leader, so keep the id for after `wait`.
    let group = child.id();
    let stdout = child.stdout.take().context("missing stdout")?;
    let stderr = child.stderr.take().context("missing stderr")?;
    let mut stdout_task = tokio::spawn(read_capped(stdout, max_output_bytes));
    let mut stderr_task = tokio::spawn(read_capped(stderr, max_output_bytes));

    let finished = timeout(limit, async {
        let status = child.wait().await;
        let stdout = (&mut stdout_task).await;
        let stderr = (&mut stderr_task).await;
        (status, stdout, stderr)
    })
    .await;

    let (status, stdout, stderr) = match finished {
        Ok(parts) => parts,
        Err(_) => {
            kill_group(group);
            let _ = child.kill().await;
            let _ = child.wait().await;
            stdout_task.abort();
            stderr_task.abort();
            tracing::warn!(label, limit_secs = limit.as_secs(), "process timed out");
            anyhow::bail!("{label} timed out after {}s", limit.as_secs())
        }
    };

    let status = status.with_context(|| format!("{label} failed"))?;
    let (stdout_bytes, stdout_truncated) = stdout.context("stdout task join")?.context("stdout read")?;
    let (stderr_bytes, stderr_truncated) = stderr.context("stderr task join")?.context("stderr read")?;

    Ok(ProcessOutput {
        exit_code: status.code(),
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
        truncated: stdout_truncated || stderr_truncated,
        elapsed: started.elapsed(),
    })
}

#[cfg(unix)]
fn apply_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_group(group: Option<u32>) {
    if let Some(pid) = group {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>) {}

async fn read_capped<R>(mut reader: R, max_bytes: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        let room = max_bytes.saturating_sub(kept.len());
        if read > room {
            truncated = true;
        }
        kept.extend_from_slice(&chunk[..read.min(room)]);
    }
    Ok((kept, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let output = run_with_timeout(
            &mut shell("echo out; echo err 1>&2; exit 3"),
            Duration::from_secs(5),
            1024,
            "test script",
        )
        .await
        .expect("run");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.truncated);
    }

    #[tokio::test]
    async fn kills_processes_that_overrun() {
        let err = run_with_timeout(
            &mut shell("sleep 5"),
            Duration::from_millis(100),
            1024,
            "sleeper",
        )
        .await
        .expect_err("timeout");
        assert!(err.to_string().contains("sleeper timed out"));
    }

    #[tokio::test]
    async fn background_children_cannot_outlive_the_limit() {
        let started = Instant::now();
        let err = run_with_timeout(
            &mut shell("sleep 4 & echo started"),
            Duration::from_secs(1),
            1024,
            "forking script",
        )
        .await
        .expect_err("timeout");
        assert!(err.to_string().contains("forking script timed out"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn caps_output_size() {
        let output = run_with_timeout(
            &mut shell("i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done"),
            Duration::from_secs(5),
            64,
            "chatty",
        )
        .await
        .expect("run");
        assert!(output.success());
        assert_eq!(output.stdout.len(), 64);
        assert!(output.truncated);
    }
}
