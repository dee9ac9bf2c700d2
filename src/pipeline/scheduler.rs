use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

/// Fixed-cadence pacer.
///
/// Deadlines advance by exactly one period per tick, so a short sleep on one tick
/// is made up on the next instead of accumulating drift. When a tick runs more
/// than a full period late the schedule restarts from now rather than bursting.
pub struct TickScheduler {
    period: Duration,
    next_deadline: Instant,
    overruns: u64,
}

impl TickScheduler {
    pub fn new(tick_hz: f64) -> Result<Self> {
        if !(tick_hz.is_finite() && tick_hz > 0.0) {
            return Err(anyhow!("tick rate must be positive, got {}", tick_hz));
        }
        let period = Duration::from_secs_f64(1.0 / tick_hz);
        Ok(Self {
            period,
            next_deadline: Instant::now() + period,
            overruns: 0,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks that finished after their deadline.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Restart the schedule with the first deadline one period after `now`.
    pub fn reset(&mut self, now: Instant) {
        self.next_deadline = now + self.period;
    }

    /// Advance to the next deadline and return how long to sleep from `now`.
    pub fn plan(&mut self, now: Instant) -> Duration {
        let deadline = self.next_deadline;
        if now <= deadline {
            self.next_deadline = deadline + self.period;
            return deadline - now;
        }
        self.overruns += 1;
        if now - deadline > self.period {
            self.next_deadline = now + self.period;
        } else {
            self.next_deadline = deadline + self.period;
        }
        Duration::ZERO
    }

    /// Sleep until the next deadline.
    pub fn wait(&mut self) {
        let pause = self.plan(Instant::now());
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }
}
