//! Rolling iteration timing statistics.

use std::collections::VecDeque;
use std::time::Duration;

/// Number of recent iterations used for the rolling average.
pub const ROLLING_WINDOW: usize = 5;

/// Derived session timing: elapsed time, rolling average duration, ETA.
#[derive(Debug, Clone, Default)]
pub struct IterationStats {
    recent: VecDeque<Duration>,
    samples: u32,
    elapsed: Duration,
}

impl IterationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, duration: Duration) {
        if self.recent.len() == ROLLING_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(duration);
        self.samples += 1;
        self.elapsed += duration;
    }

    /// Total time spent inside recorded iterations.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Average over the last [`ROLLING_WINDOW`] iterations.
    pub fn rolling_average(&self) -> Option<Duration> {
        if self.recent.is_empty() {
            return None;
        }
        let total: Duration = self.recent.iter().sum();
        Some(total / self.recent.len() as u32)
    }

    /// `remaining_iterations × rolling_average`, available once a full window was recorded.
    pub fn eta(&self, remaining_iterations: u32) -> Option<Duration> {
        if self.recent.len() < ROLLING_WINDOW {
            return None;
        }
        self.rolling_average().map(|avg| avg * remaining_iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_requires_full_window() {
        let mut stats = IterationStats::new();
        for _ in 0..ROLLING_WINDOW - 1 {
            stats.record(Duration::from_secs(10));
        }
        assert_eq!(stats.rolling_average(), Some(Duration::from_secs(10)));
        assert_eq!(stats.eta(3), None);

        stats.record(Duration::from_secs(10));
        assert_eq!(stats.eta(3), Some(Duration::from_secs(30)));
    }

    #[test]
    fn rolling_average_drops_old_samples() {
        let mut stats = IterationStats::new();
        stats.record(Duration::from_secs(100));
        for _ in 0..ROLLING_WINDOW {
            stats.record(Duration::from_secs(2));
        }
        assert_eq!(stats.rolling_average(), Some(Duration::from_secs(2)));
        assert_eq!(stats.samples(), 6);
        assert_eq!(stats.elapsed(), Duration::from_secs(110));
    }
}
