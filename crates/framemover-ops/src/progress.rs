//! Progress aggregation and throughput-based ETA.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use framemover_core::{BatchId, BatchProgress, BatchStatus};

/// Rolling window of (time, processed bytes) samples.
///
/// The ETA is only reported once at least one full window has elapsed
/// since the first sample, so a single burst is never extrapolated.
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    window: Duration,
    started: Option<Instant>,
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputWindow {
    /// Create a window of the given length.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            started: None,
            samples: VecDeque::new(),
        }
    }

    /// Record the cumulative processed byte count at `at`.
    pub fn record(&mut self, at: Instant, processed: u64) {
        self.started.get_or_insert(at);
        self.samples.push_back((at, processed));

        // Keep one sample at or before the window boundary as the baseline.
        if let Some(boundary) = at.checked_sub(self.window) {
            while self.samples.len() > 2 && self.samples[1].0 <= boundary {
                self.samples.pop_front();
            }
        }
    }

    /// Bytes per second over the window, if measurable.
    pub fn rate(&self) -> Option<f64> {
        let (first_at, first_bytes) = *self.samples.front()?;
        let (last_at, last_bytes) = *self.samples.back()?;
        let span = last_at.saturating_duration_since(first_at).as_secs_f64();
        if span <= 0.0 {
            return None;
        }
        Some(last_bytes.saturating_sub(first_bytes) as f64 / span)
    }

    /// Estimated seconds to process `remaining` bytes, as of `now`.
    pub fn eta(&self, now: Instant, remaining: u64) -> Option<u64> {
        let started = self.started?;
        if now.saturating_duration_since(started) < self.window {
            return None;
        }
        if remaining == 0 {
            return Some(0);
        }
        let rate = self.rate()?;
        if rate <= 0.0 {
            return None;
        }
        Some((remaining as f64 / rate).ceil() as u64)
    }
}

/// Mutable aggregate behind a batch's progress snapshots.
///
/// Owned by the batch controller and only touched under its lock.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    batch_id: BatchId,
    start_time: Instant,
    total_operations: usize,
    completed_operations: usize,
    failed_operations: usize,
    total_bytes: u64,
    processed_bytes: u64,
    current_file: Option<PathBuf>,
    throughput: ThroughputWindow,
}

impl ProgressTracker {
    pub fn new(batch_id: BatchId, total_operations: usize, total_bytes: u64, window: Duration) -> Self {
        Self {
            batch_id,
            start_time: Instant::now(),
            total_operations,
            completed_operations: 0,
            failed_operations: 0,
            total_bytes,
            processed_bytes: 0,
            current_file: None,
            throughput: ThroughputWindow::new(window),
        }
    }

    /// Restart the clock when the batch actually begins running.
    pub fn start(&mut self) {
        self.start_time = Instant::now();
        self.throughput.record(self.start_time, self.processed_bytes);
    }

    pub fn record_bytes(&mut self, bytes: u64) {
        self.processed_bytes = self.processed_bytes.saturating_add(bytes);
        self.throughput.record(Instant::now(), self.processed_bytes);
    }

    pub fn record_completed(&mut self) {
        self.completed_operations += 1;
        self.debug_check();
    }

    pub fn record_failed(&mut self) {
        self.failed_operations += 1;
        self.debug_check();
    }

    pub fn set_current_file(&mut self, path: Option<PathBuf>) {
        self.current_file = path;
    }

    pub fn finished(&self) -> usize {
        self.completed_operations + self.failed_operations
    }

    pub fn snapshot(&self, status: BatchStatus, paused: bool, cancelled: bool) -> BatchProgress {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.start_time);
        let eta_seconds = if status.is_terminal() {
            Some(0)
        } else {
            self.throughput
                .eta(now, self.total_bytes.saturating_sub(self.processed_bytes))
        };
        let bytes_per_second = if elapsed.as_secs_f64() > 0.0 {
            self.processed_bytes as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        BatchProgress {
            batch_id: self.batch_id,
            total_operations: self.total_operations,
            completed_operations: self.completed_operations,
            failed_operations: self.failed_operations,
            total_bytes: self.total_bytes,
            processed_bytes: self.processed_bytes,
            percentage: BatchProgress::percentage_of(self.finished(), self.total_operations),
            eta_seconds,
            status,
            paused,
            cancelled,
            current_file: self.current_file.clone(),
            elapsed_ms: elapsed.as_millis() as u64,
            bytes_per_second,
        }
    }

    fn debug_check(&self) {
        debug_assert!(
            self.finished() <= self.total_operations,
            "completed + failed exceeded total"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eta_unavailable_before_full_window() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(5));
        window.record(start, 0);
        window.record(start + Duration::from_secs(1), 1000);

        assert!(window.eta(start + Duration::from_secs(1), 10_000).is_none());
    }

    #[test]
    fn test_eta_after_full_window() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(5));
        for second in 0..=6u64 {
            window.record(start + Duration::from_secs(second), second * 100);
        }

        let rate = window.rate().unwrap();
        assert!((rate - 100.0).abs() < 1e-6);
        assert_eq!(window.eta(start + Duration::from_secs(6), 1000), Some(10));
    }

    #[test]
    fn test_window_drops_old_samples() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(2));
        // Slow start, fast finish: only the recent rate should count.
        window.record(start, 0);
        window.record(start + Duration::from_secs(10), 10);
        window.record(start + Duration::from_secs(11), 1010);
        window.record(start + Duration::from_secs(12), 2010);

        let rate = window.rate().unwrap();
        assert!((rate - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_tracker_percentage_counts_failures() {
        let mut tracker = ProgressTracker::new(BatchId(1), 4, 400, Duration::from_secs(5));
        tracker.start();
        tracker.record_bytes(100);
        tracker.record_completed();
        tracker.record_failed();

        let snapshot = tracker.snapshot(BatchStatus::Running, false, false);
        assert_eq!(snapshot.completed_operations, 1);
        assert_eq!(snapshot.failed_operations, 1);
        assert_eq!(snapshot.processed_bytes, 100);
        assert_eq!(snapshot.percentage, 50.0);
        assert!(snapshot.eta_seconds.is_none());
    }
}
