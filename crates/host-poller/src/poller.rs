use crate::executor::{CycleOutcome, Executor};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    pub checks: u64,
    pub dispatches: u64,
    pub rejected: u64,
    pub errors: u64,
    /// Ticks that fell inside a running check and were dropped.
    pub skipped_ticks: u64,
}

impl PollerStats {
    fn note(&mut self, outcome: &anyhow::Result<CycleOutcome>) {
        self.checks += 1;
        match outcome {
            Ok(CycleOutcome::Executed { .. }) => self.dispatches += 1,
            Ok(CycleOutcome::Rejected { .. }) => self.rejected += 1,
            Ok(CycleOutcome::Idle | CycleOutcome::Superseded) => {}
            Err(_) => self.errors += 1,
        }
    }
}

/// Checks the shared directory once per `interval` until `shutdown` fires.
/// Each check runs to completion before the next tick is considered, so two
/// checks never overlap; a long batch simply swallows the ticks it spans.
pub async fn run_poller(
    executor: &mut Executor,
    interval: Duration,
    shutdown: CancellationToken,
) -> PollerStats {
    let mut stats = PollerStats::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(
        event = "poller_started",
        shared_dir = %executor.shared_dir().root().display(),
        interval_ms = interval.as_millis() as u64,
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let started = Instant::now();
        let outcome = executor.run_cycle().await;
        if let Err(err) = &outcome {
            tracing::error!(event = "poll_failed", error = %format!("{err:#}"));
        }
        stats.note(&outcome);
        stats.skipped_ticks += missed_ticks(started.elapsed(), interval);
    }

    tracing::info!(
        event = "poller_stopped",
        checks = stats.checks,
        dispatches = stats.dispatches,
        skipped_ticks = stats.skipped_ticks,
    );
    stats
}

fn missed_ticks(elapsed: Duration, interval: Duration) -> u64 {
    let interval = interval.as_millis().max(1);
    (elapsed.as_millis() / interval) as u64
}
