//! Tick timing for the audio loop.
//!
//! Durations land in a fixed ring so recording never allocates on the
//! loop thread.

use std::time::Duration;

const WINDOW: usize = 256;

/// Aggregate over the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub avg_us: u32,
    pub max_us: u32,
    pub p95_us: u32,
    /// Ticks that took longer than one buffer period, since creation.
    pub overruns: u64,
    pub ticks: u64,
}

pub struct TickTelemetry {
    durations_us: [u32; WINDOW],
    next: usize,
    filled: usize,
    max_us: u32,
    budget_us: u32,
    overruns: u64,
    ticks: u64,
}

impl TickTelemetry {
    /// `budget` is the wall time available per tick, one buffer period.
    pub fn new(budget: Duration) -> Self {
        Self {
            durations_us: [0; WINDOW],
            next: 0,
            filled: 0,
            max_us: 0,
            budget_us: budget.as_micros().min(u32::MAX as u128) as u32,
            overruns: 0,
            ticks: 0,
        }
    }

    pub fn budget(&self) -> Duration {
        Duration::from_micros(self.budget_us as u64)
    }

    #[inline]
    pub fn record(&mut self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u32::MAX as u128) as u32;
        self.durations_us[self.next] = us;
        self.next = (self.next + 1) % WINDOW;
        self.filled = (self.filled + 1).min(WINDOW);
        self.max_us = self.max_us.max(us);
        self.ticks += 1;
        if us > self.budget_us {
            self.overruns += 1;
        }
    }

    /// Summarize the window and start a new max. Overruns stay cumulative.
    pub fn take_summary(&mut self) -> TickSummary {
        if self.filled == 0 {
            return TickSummary {
                ticks: self.ticks,
                ..TickSummary::default()
            };
        }
        let window = &self.durations_us[..self.filled];
        let sum: u64 = window.iter().map(|&us| us as u64).sum();

        let mut sorted = self.durations_us;
        let sorted = &mut sorted[..self.filled];
        sorted.sort_unstable();
        let p95 = sorted[((self.filled * 95).div_ceil(100)).clamp(1, self.filled) - 1];

        let summary = TickSummary {
            avg_us: (sum / self.filled as u64) as u32,
            max_us: self.max_us,
            p95_us: p95,
            overruns: self.overruns,
            ticks: self.ticks,
        };
        self.max_us = 0;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_of_a_short_window() {
        let mut t = TickTelemetry::new(Duration::from_micros(500));
        for us in [100, 200, 300] {
            t.record(Duration::from_micros(us));
        }
        let summary = t.take_summary();
        assert_eq!(summary.avg_us, 200);
        assert_eq!(summary.max_us, 300);
        assert_eq!(summary.p95_us, 300);
        assert_eq!(summary.overruns, 0);
        assert_eq!(summary.ticks, 3);

        assert_eq!(t.take_summary().max_us, 0);
    }

    #[test]
    fn overruns_are_cumulative() {
        let mut t = TickTelemetry::new(Duration::from_micros(500));
        t.record(Duration::from_micros(400));
        t.record(Duration::from_micros(600));
        assert_eq!(t.take_summary().overruns, 1);
        t.record(Duration::from_micros(900));
        assert_eq!(t.take_summary().overruns, 2);
    }

    #[test]
    fn empty_window() {
        let mut t = TickTelemetry::new(Duration::from_millis(1));
        assert_eq!(t.take_summary(), TickSummary::default());
    }
}
