use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// A burst pool drained at a steady rate: up to `pool_size` admissions may
/// happen back to back, after which admissions are spaced at
/// `1 / requests_per_second`. This mirrors the server's advertised
/// admission policy.
pub struct TokenBucket {
    pool_size: usize,
    requests_per_second: f64,
    /// Admission timestamps, newest first.
    history: VecDeque<Instant>,
}

impl TokenBucket {
    pub fn new(pool_size: usize, requests_per_second: f64) -> Self {
        Self {
            pool_size,
            requests_per_second,
            history: VecDeque::new(),
        }
    }

    /// How long the caller must wait before the next admission is safe.
    /// Zero while the pool still has room.
    pub fn needed_wait(&self, now: Instant) -> Duration {
        if self.history.len() < self.pool_size {
            return Duration::ZERO;
        }
        let since_last = now.duration_since(self.history[0]);
        let spacing = Duration::from_secs_f64(1.0 / self.requests_per_second);
        spacing.saturating_sub(since_last)
    }

    /// Register an admission.
    pub fn record(&mut self, now: Instant) {
        self.history.push_front(now);
    }

    /// Drop records older than the pool's drain horizon.
    pub fn trim(&mut self, now: Instant) {
        let horizon =
            Duration::from_secs_f64(self.pool_size as f64 / self.requests_per_second);
        while let Some(oldest) = self.history.back() {
            if now.duration_since(*oldest) > horizon {
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
