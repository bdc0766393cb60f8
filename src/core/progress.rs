//! Progress reporting for archive operations.
//!
//! The archiver only produces raw cumulative byte counts through a
//! [`ProgressReporter`]; how they are shown (terminal bar, log lines, nothing)
//! is up to the implementation handed to it.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::debug;

use crate::logging::LogThrottle;

/// Cumulative bytes read from source files so far in one archive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveProgress {
    pub processed_bytes: u64,
}

/// Receives progress from the archiver. Calls are made synchronously from the
/// thread doing the I/O, so implementations should return quickly.
pub trait ProgressReporter: Send + Sync {
    /// Called once before any data is read. `total_bytes` is an estimate and
    /// may be unknown.
    fn start(&self, total_bytes: Option<u64>);

    /// Called after every read with the running total.
    fn update(&self, progress: ArchiveProgress);

    /// Called once the operation has ended, successfully or not.
    fn finish(&self);
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn start(&self, _total_bytes: Option<u64>) {}
    fn update(&self, _progress: ArchiveProgress) {}
    fn finish(&self) {}
}

const BAR_TEMPLATE: &str =
    " {bar:40} {percent:>3}% | ETA: {eta} | {bytes}/{total_bytes} ({binary_bytes_per_sec})";
const SPINNER_TEMPLATE: &str = " {spinner} {bytes} processed | {elapsed} ({binary_bytes_per_sec})";

/// Interactive progress bar on stderr.
#[derive(Default)]
pub struct TerminalProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Option<ProgressBar> {
        self.bar.lock().ok().and_then(|bar| bar.clone())
    }
}

impl ProgressReporter for TerminalProgress {
    fn start(&self, total_bytes: Option<u64>) {
        let bar = match total_bytes {
            Some(total) => {
                let style = ProgressStyle::with_template(BAR_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("\u{2588}\u{2591}");
                ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stderr())
                    .with_style(style)
            }
            None => {
                let style = ProgressStyle::with_template(SPINNER_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_spinner());
                let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr())
                    .with_style(style);
                bar.enable_steady_tick(Duration::from_millis(120));
                bar
            }
        };

        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(bar);
        }
    }

    fn update(&self, progress: ArchiveProgress) {
        let Some(bar) = self.current() else {
            return;
        };

        // The total is only an estimate; grow it rather than overflow the bar.
        if let Some(len) = bar.length() {
            if progress.processed_bytes > len {
                bar.set_length(progress.processed_bytes);
            }
        }
        bar.set_position(progress.processed_bytes);
    }

    fn finish(&self) {
        let bar = self.bar.lock().ok().and_then(|mut slot| slot.take());
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
    }
}

const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Progress as throttled debug log lines, for non-interactive runs.
pub struct LogProgress {
    throttle: LogThrottle,
    total_bytes: AtomicU64,
    last_bytes: AtomicU64,
}

impl LogProgress {
    pub fn new(interval: Duration) -> Self {
        Self {
            throttle: LogThrottle::new(interval),
            total_bytes: AtomicU64::new(UNKNOWN_TOTAL),
            last_bytes: AtomicU64::new(0),
        }
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProgressReporter for LogProgress {
    fn start(&self, total_bytes: Option<u64>) {
        self.total_bytes
            .store(total_bytes.unwrap_or(UNKNOWN_TOTAL), Ordering::Relaxed);
        self.last_bytes.store(0, Ordering::Relaxed);
        self.throttle.reset();
    }

    fn update(&self, progress: ArchiveProgress) {
        self.last_bytes
            .store(progress.processed_bytes, Ordering::Relaxed);

        if !self.throttle.should_log() {
            return;
        }

        match self.total_bytes.load(Ordering::Relaxed) {
            UNKNOWN_TOTAL => debug!(processed_bytes = progress.processed_bytes, "Archiving"),
            total => {
                let percentage = percentage(progress.processed_bytes, total);
                debug!(
                    processed_bytes = progress.processed_bytes,
                    total_bytes = total,
                    percentage = percentage,
                    "Archiving"
                );
            }
        }
    }

    fn finish(&self) {
        debug!(
            processed_bytes = self.last_bytes.load(Ordering::Relaxed),
            "Archiving finished"
        );
    }
}

/// Whole-number percentage, capped at 100 since totals are estimates.
pub fn percentage(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((processed as f64 / total as f64) * 100.0).min(100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, 200), 0);
        assert_eq!(percentage(50, 200), 25);
        assert_eq!(percentage(200, 200), 100);
    }

    #[test]
    fn test_percentage_caps_when_estimate_is_low() {
        assert_eq!(percentage(300, 200), 100);
        assert_eq!(percentage(10, 0), 100);
    }

    #[test]
    fn test_terminal_progress_grows_length_past_estimate() {
        let progress = TerminalProgress::new();
        progress.start(Some(10));
        progress.update(ArchiveProgress {
            processed_bytes: 25,
        });

        let bar = progress.current().unwrap();
        assert_eq!(bar.length(), Some(25));
        assert_eq!(bar.position(), 25);

        progress.finish();
        assert!(progress.current().is_none());
    }

    #[test]
    fn test_terminal_progress_ignores_updates_before_start() {
        let progress = TerminalProgress::new();
        progress.update(ArchiveProgress {
            processed_bytes: 5,
        });
        assert!(progress.current().is_none());
    }

    #[test]
    fn test_log_progress_tracks_last_value() {
        let progress = LogProgress::new(Duration::from_secs(60));
        progress.start(None);
        progress.update(ArchiveProgress {
            processed_bytes: 10,
        });
        progress.update(ArchiveProgress {
            processed_bytes: 42,
        });
        assert_eq!(progress.last_bytes.load(Ordering::Relaxed), 42);
        assert_eq!(progress.total_bytes.load(Ordering::Relaxed), UNKNOWN_TOTAL);
    }
}
