use protocol::Progress;
use std::collections::VecDeque;
use std::time::Duration;

pub const DEFAULT_ETA_WINDOW: usize = 5;

/// Tracks completed commands in a batch and estimates what is left from the
/// mean of the most recent per-command durations.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: usize,
    completed: usize,
    window: VecDeque<Duration>,
    window_size: usize,
}

impl ProgressTracker {
    pub fn new(total: usize, window_size: usize) -> Self {
        Self {
            total,
            completed: 0,
            window: VecDeque::with_capacity(window_size.max(1)),
            window_size: window_size.max(1),
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.completed = (self.completed + 1).min(self.total);
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(elapsed);
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn remaining(&self) -> usize {
        self.total - self.completed
    }

    /// `None` until at least one command has finished, or once none remain.
    pub fn eta_secs(&self) -> Option<u64> {
        if self.window.is_empty() || self.remaining() == 0 {
            return None;
        }
        let mean = self.window.iter().map(Duration::as_secs_f64).sum::<f64>() / self.window.len() as f64;
        Some((self.remaining() as f64 * mean).ceil() as u64)
    }

    pub fn snapshot(&self, current_command: Option<&str>) -> Progress {
        let percentage = if self.total == 0 {
            100
        } else {
            (self.completed * 100 / self.total) as u8
        };
        Progress {
            completed: self.completed,
            total: self.total,
            percentage,
            current_command: current_command.map(str::to_string),
            estimated_time_remaining: self.eta_secs().map(format_eta),
        }
    }
}

/// `"N seconds"` up to a minute, whole minutes rounded up beyond that.
pub fn format_eta(secs: u64) -> String {
    if secs > 60 {
        format!("{} minutes", secs.div_ceil(60))
    } else {
        format!("{secs} seconds")
    }
}
