use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Total server-side processing seconds tolerated within one measurement
/// period, per method.
pub const MAX_REQUEST_RUNNING_TIME: f64 = 480.0;
/// The rolling period over which processing time is measured.
pub const MEASUREMENT_PERIOD: Duration = Duration::from_secs(600);

/// Caps cumulative request-processing seconds within a rolling period.
/// The server bounds total "operating" time per method this way; ignoring
/// it produces delayed mass-throttling once the budget is spent.
pub struct SlidingWindow {
    max_running_time: f64,
    period: Duration,
    /// `(admission time, observed server duration)`, newest first.
    history: VecDeque<(Instant, f64)>,
}

impl SlidingWindow {
    pub fn new(max_running_time: f64, period: Duration) -> Self {
        Self {
            max_running_time,
            period,
            history: VecDeque::new(),
        }
    }

    /// Walk the history newest to oldest accumulating durations; the first
    /// record that fills the budget dictates when the next request may go
    /// out: when that record leaves the measurement period.
    pub fn needed_wait(&self, now: Instant) -> Duration {
        let mut consumed = 0.0;
        for (when, duration) in &self.history {
            consumed += duration;
            if consumed >= self.max_running_time {
                let release = *when + self.period;
                return release.duration_since(now);
            }
        }
        Duration::ZERO
    }

    /// Register how much server time the last request consumed.
    pub fn record(&mut self, now: Instant, duration: f64) {
        self.history.push_front((now, duration));
    }

    /// Drop records that left the measurement period.
    pub fn trim(&mut self, now: Instant) {
        while let Some((when, _)) = self.history.back() {
            if now.duration_since(*when) > self.period {
                self.history.pop_back();
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.history.len()
    }
}
