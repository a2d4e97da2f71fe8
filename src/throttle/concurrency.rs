use std::sync::Mutex;

use tokio::sync::Notify;

/// Hard ceiling on simultaneous in-flight requests.
pub const MAX_CONCURRENT_REQUESTS: usize = 50;

/// A semaphore-like gate whose limit moves at runtime: the scheduler's
/// autothrottle raises it on success streaks and cuts it on failures, and
/// `slow()` pushes scoped cap overrides on top.
///
/// The adaptive limit is fractional (it is multiplied and divided by
/// non-integer factors); admission uses `ceil(effective_limit)` so the
/// in-flight count never exceeds the cap a caller asked for.
pub struct ConcurrencyLimiter {
    state: Mutex<State>,
    request_complete: Notify,
}

struct State {
    in_flight: usize,
    limit: f64,
    max_limit: f64,
    /// `slow()` override stack, innermost scope last.
    overrides: Vec<f64>,
}

impl State {
    fn effective_limit(&self) -> f64 {
        match self.overrides.last() {
            Some(cap) => cap.min(self.limit),
            None => self.limit,
        }
    }

    fn admission_cap(&self) -> usize {
        (self.effective_limit().ceil() as usize).max(1)
    }
}

impl ConcurrencyLimiter {
    pub fn new(max_limit: usize) -> Self {
        Self {
            state: Mutex::new(State {
                in_flight: 0,
                limit: max_limit as f64,
                max_limit: max_limit as f64,
                overrides: Vec::new(),
            }),
            request_complete: Notify::new(),
        }
    }

    /// Wait until a slot is free, then enter. The returned permit releases
    /// the slot on drop.
    pub async fn acquire(&self) -> ConcurrencyPermit<'_> {
        loop {
            if self.try_enter() {
                return ConcurrencyPermit { limiter: self };
            }

            // Register interest before re-checking: `notify_waiters` only
            // reaches waiters that are already enabled, and a release may
            // land between the check and the await.
            let notified = self.request_complete.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.try_enter() {
                return ConcurrencyPermit { limiter: self };
            }
            notified.await;
        }
    }

    fn try_enter(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.in_flight < state.admission_cap() {
            state.in_flight += 1;
            true
        } else {
            false
        }
    }

    /// Divide the adaptive limit, floored at 1. Returns the new limit.
    pub fn decrease_limit(&self, factor: f64) -> f64 {
        let mut state = self.state.lock().unwrap();
        state.limit = (state.limit / factor).max(1.0);
        state.limit
    }

    /// Multiply the adaptive limit, capped at the construction maximum.
    /// Returns the new limit. Raising the limit frees waiters.
    pub fn increase_limit(&self, factor: f64) -> f64 {
        let limit = {
            let mut state = self.state.lock().unwrap();
            state.limit = (state.limit * factor).min(state.max_limit);
            state.limit
        };
        self.request_complete.notify_waiters();
        limit
    }

    pub fn current_limit(&self) -> f64 {
        self.state.lock().unwrap().effective_limit()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    /// Push a scoped cap override. The matching [`pop_override`] restores
    /// the previous cap.
    ///
    /// [`pop_override`]: ConcurrencyLimiter::pop_override
    pub fn push_override(&self, cap: f64) {
        self.state.lock().unwrap().overrides.push(cap.max(1.0));
    }

    pub fn pop_override(&self) {
        self.state.lock().unwrap().overrides.pop();
        self.request_complete.notify_waiters();
    }
}

/// An occupied concurrency slot.
pub struct ConcurrencyPermit<'a> {
    limiter: &'a ConcurrencyLimiter,
}

impl Drop for ConcurrencyPermit<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.limiter.state.lock().unwrap();
            state.in_flight -= 1;
        }
        self.limiter.request_complete.notify_waiters();
    }
}
