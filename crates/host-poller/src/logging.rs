use anyhow::Context;
use std::io;
use std::path::Path;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// File name prefix of the poller's daily log; rotation appends the date.
pub(crate) const LOG_FILE_PREFIX: &str = "host-poller.log";

/// Every executed and rejected dispatch is logged as a JSON line to a daily
/// file under `log_dir`. A readable copy goes to stderr on request.
pub(crate) fn init_tracing(
    log_dir: &Path,
    file_prefix: &str,
    log_to_stderr: bool,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let appender = daily_appender(log_dir, file_prefix)?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_target(false)
        .json();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    if log_to_stderr {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false);
        registry.with(stderr_layer).init();
    } else {
        registry.init();
    }

    Ok(file_guard)
}

fn daily_appender(log_dir: &Path, file_prefix: &str) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
    Ok(tracing_appender::rolling::daily(log_dir, file_prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn daily_file_lands_under_a_fresh_log_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_dir = temp.path().join("nested").join("logs");
        let mut appender = daily_appender(&log_dir, LOG_FILE_PREFIX).expect("appender");
        appender.write_all(b"{\"event\":\"poller_started\"}\n").expect("write");
        appender.flush().expect("flush");

        let names: Vec<String> = std::fs::read_dir(&log_dir)
            .expect("read dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|name| name.starts_with(LOG_FILE_PREFIX)));
    }
}
