use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::address::{FIRST_ADDRESS_INDEX, LAST_ADDRESS_INDEX};

#[derive(Debug, Clone, Copy)]
struct Baseline {
    starting_index: u32,
    start_time: Instant,
    current_index: u32,
}

/// Tracks how far the allocation cursor has moved through the current epoch.
pub struct ProgressEstimator {
    state: Mutex<Baseline>,
}

impl ProgressEstimator {
    pub fn new() -> Self {
        Self::starting_at(FIRST_ADDRESS_INDEX)
    }

    pub fn starting_at(index: u32) -> Self {
        Self {
            state: Mutex::new(Baseline {
                starting_index: index,
                start_time: Instant::now(),
                current_index: index,
            }),
        }
    }

    /// Rebase on `index`, e.g. the cursor recovered at startup.
    pub fn init(&self, index: u32) {
        *self.state.lock() = Baseline {
            starting_index: index,
            start_time: Instant::now(),
            current_index: index,
        };
    }

    /// Rebase at the bottom of the address space after a rollover.
    pub fn reset(&self) {
        self.init(FIRST_ADDRESS_INDEX);
    }

    pub fn update(&self, current_index: u32) {
        self.state.lock().current_index = current_index;
    }

    pub fn current_index(&self) -> u32 {
        self.state.lock().current_index
    }

    /// Percentage of the address space behind the cursor, 0 to 100.
    pub fn percent_complete(&self) -> f64 {
        let current = self.current_index().max(FIRST_ADDRESS_INDEX);
        let total = (LAST_ADDRESS_INDEX - FIRST_ADDRESS_INDEX) as f64;
        (current - FIRST_ADDRESS_INDEX) as f64 / total * 100.0
    }

    /// Remaining time at the observed rate since the last baseline.
    ///
    /// `None` until the cursor has moved past the baseline.
    pub fn eta(&self) -> Option<Duration> {
        let baseline = *self.state.lock();
        let processed = baseline.current_index.checked_sub(baseline.starting_index)?;
        if processed == 0 {
            return None;
        }
        let remaining = LAST_ADDRESS_INDEX.saturating_sub(baseline.current_index);
        let per_address = baseline.start_time.elapsed().as_secs_f64() / processed as f64;
        Some(Duration::from_secs_f64(per_address * remaining as f64))
    }
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// `"{d} days hh:mm:ss"`, or `"unknown"` when no estimate exists.
pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        None => "unknown".to_string(),
        Some(d) => {
            let secs = d.as_secs();
            format!(
                "{} days {:02}:{:02}:{:02}",
                secs / 86_400,
                (secs % 86_400) / 3_600,
                (secs % 3_600) / 60,
                secs % 60
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_progress_means_no_eta() {
        let progress = ProgressEstimator::new();
        assert_eq!(progress.eta(), None);
        assert_eq!(progress.percent_complete(), 0.0);
        assert_eq!(format_eta(progress.eta()), "unknown");
    }

    #[test]
    fn test_percent_complete_bounds() {
        let progress = ProgressEstimator::new();
        progress.update(LAST_ADDRESS_INDEX);
        assert!((progress.percent_complete() - 100.0).abs() < 1e-9);

        let midpoint = FIRST_ADDRESS_INDEX + (LAST_ADDRESS_INDEX - FIRST_ADDRESS_INDEX) / 2;
        progress.update(midpoint);
        assert!((progress.percent_complete() - 50.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eta_extrapolates_observed_rate() {
        let progress = ProgressEstimator::starting_at(LAST_ADDRESS_INDEX - 2_000);
        tokio::time::advance(Duration::from_secs(100)).await;
        progress.update(LAST_ADDRESS_INDEX - 1_000);

        // 1000 addresses in 100s leaves 1000 addresses, so roughly 100s.
        let eta = progress.eta().unwrap();
        assert!((eta.as_secs_f64() - 100.0).abs() < 1.0);
    }

    #[test]
    fn test_reset_clears_estimate() {
        let progress = ProgressEstimator::new();
        progress.update(FIRST_ADDRESS_INDEX + 4096);
        progress.reset();
        assert_eq!(progress.current_index(), FIRST_ADDRESS_INDEX);
        assert_eq!(progress.eta(), None);
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(Some(Duration::from_secs(90_061))), "1 days 01:01:01");
    }
}
