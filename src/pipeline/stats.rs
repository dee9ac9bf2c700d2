use std::time::Duration;

use crate::telemetry::DispatchReport;

/// Outcome of one tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    /// Sources that delivered a new frame since the previous tick.
    pub fresh_frames: usize,
    /// Sources whose previous frame was reused.
    pub repeated_frames: usize,
    /// Sources that have never delivered a frame.
    pub missing_frames: usize,
    pub inferences: usize,
    pub inference_failures: usize,
    pub dispatch: DispatchReport,
    pub latency: Duration,
}

/// Min / mean / max over a window of durations.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
    pub total: Duration,
}

impl LatencySummary {
    pub fn record(&mut self, sample: Duration) {
        if self.count == 0 || sample < self.min {
            self.min = sample;
        }
        if sample > self.max {
            self.max = sample;
        }
        self.count += 1;
        self.total += sample;
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / u128::from(self.count);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Counters accumulated over one stats window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickStats {
    pub ticks: u64,
    pub repeated_frames: u64,
    pub missing_frames: u64,
    pub inference_failures: u64,
    pub datagrams_sent: u64,
    pub dispatch_failures: u64,
    pub latency: LatencySummary,
}

impl TickStats {
    pub fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.repeated_frames += report.repeated_frames as u64;
        self.missing_frames += report.missing_frames as u64;
        self.inference_failures += report.inference_failures as u64;
        self.datagrams_sent += report.dispatch.sent as u64;
        self.dispatch_failures += report.dispatch.failed as u64;
        self.latency.record(report.latency);
    }

    /// Return the window's counters and start a new window.
    pub fn take(&mut self) -> TickStats {
        std::mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_summary_tracks_extremes() {
        let mut summary = LatencySummary::default();
        assert_eq!(summary.mean(), Duration::ZERO);
        for ms in [4, 2, 9] {
            summary.record(Duration::from_millis(ms));
        }
        assert_eq!(summary.min, Duration::from_millis(2));
        assert_eq!(summary.max, Duration::from_millis(9));
        assert_eq!(summary.mean(), Duration::from_millis(5));
    }

    #[test]
    fn mean_survives_counts_beyond_u32() {
        let count = u64::from(u32::MAX) + 1;
        let summary = LatencySummary {
            count,
            min: Duration::from_millis(1),
            max: Duration::from_millis(3),
            // 2^32 samples of 2 ms each.
            total: Duration::from_millis(4) * (1u32 << 31),
        };
        assert_eq!(summary.mean(), Duration::from_millis(2));
    }

    #[test]
    fn take_starts_a_new_window() {
        let mut stats = TickStats::default();
        stats.record(&TickReport {
            repeated_frames: 2,
            inference_failures: 1,
            latency: Duration::from_millis(3),
            ..TickReport::default()
        });
        let window = stats.take();
        assert_eq!(window.ticks, 1);
        assert_eq!(window.repeated_frames, 2);
        assert_eq!(stats, TickStats::default());
    }
}
