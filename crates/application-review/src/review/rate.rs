use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::warn;

/// Sliding-window budget for calls to the form provider.
///
/// Only successful calls are recorded. Once the window fills up, admission is refused for the
/// whole backoff period, even if the window drains in the meantime.
#[derive(Debug, Clone)]
pub struct RateGovernor {
    window: Duration,
    ceiling: usize,
    backoff: Duration,
    calls: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl RateGovernor {
    pub fn new(window: Duration, ceiling: usize, backoff: Duration) -> Self {
        Self {
            window,
            ceiling,
            backoff,
            calls: VecDeque::with_capacity(ceiling),
            cooldown_until: None,
        }
    }

    pub fn admit(&mut self) -> bool {
        self.admit_at(Instant::now())
    }

    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    pub fn admit_at(&mut self, now: Instant) -> bool {
        self.prune(now);

        if let Some(until) = self.cooldown_until {
            if now < until {
                return false;
            }
            self.cooldown_until = None;
        }

        if self.calls.len() >= self.ceiling {
            self.cooldown_until = Some(now + self.backoff);
            warn!(
                calls = self.calls.len(),
                ceiling = self.ceiling,
                backoff_secs = self.backoff.as_secs_f64(),
                "form provider call budget exhausted, backing off"
            );
            return false;
        }

        true
    }

    pub fn record_at(&mut self, now: Instant) {
        self.calls.push_back(now);
    }

    /// Calls still inside the trailing window as of the last prune.
    pub fn in_window(&self) -> usize {
        self.calls.len()
    }

    pub fn cooling_down_at(&self, now: Instant) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.calls.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}
