// src/pipeline/monitor.rs
//
// Throughput accounting and worker liveness.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Point-in-time view of the pipeline's throughput.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub processed: u64,
    pub skipped: u64,
    /// Exponential moving average of the worker's per-frame time.
    pub avg_processing_ms: f64,
    /// Frames in flight when the sample was taken.
    pub queue_depth: usize,
    /// Processed frames per second since the first processed frame.
    pub fps: f64,
    /// `processed / (processed + skipped)`, 1.0 before any frame.
    pub efficiency: f64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    skipped: u64,
    ema_ms: Option<f64>,
    first_processed: Option<Instant>,
}

/// Read-only observer fed by the throttler and the worker. Nothing in the
/// pipeline consults it to make decisions.
#[derive(Debug)]
pub struct PerformanceMonitor {
    alpha: f64,
    counters: Mutex<Counters>,
}

impl PerformanceMonitor {
    /// `alpha` is the weight of the newest sample in the moving average.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            counters: Mutex::new(Counters::default()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_processed(&self, duration: Duration) {
        let ms = duration.as_secs_f64() * 1e3;
        let mut c = self.counters();
        c.processed += 1;
        c.ema_ms = Some(match c.ema_ms {
            Some(avg) => avg + self.alpha * (ms - avg),
            None => ms,
        });
        c.first_processed.get_or_insert_with(Instant::now);
    }

    pub fn record_skipped(&self) {
        self.counters().skipped += 1;
    }

    pub fn snapshot(&self, queue_depth: usize) -> PerformanceSample {
        let c = self.counters();
        let seen = c.processed + c.skipped;
        let elapsed = c
            .first_processed
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        PerformanceSample {
            processed: c.processed,
            skipped: c.skipped,
            avg_processing_ms: c.ema_ms.unwrap_or(0.0),
            queue_depth,
            fps: if elapsed > 0.0 {
                c.processed as f64 / elapsed
            } else {
                0.0
            },
            efficiency: if seen == 0 {
                1.0
            } else {
                c.processed as f64 / seen as f64
            },
        }
    }

    /// Zero every counter. Only pipeline re-initialization calls this.
    pub fn reset(&self) {
        *self.counters() = Counters::default();
    }
}

/// Liveness of the worker thread as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineHealth {
    /// Waiting for the next request.
    Idle,
    /// Working on a request for `elapsed`.
    Busy { elapsed: Duration },
    /// Working on one request for longer than the stall threshold.
    Stalled { elapsed: Duration },
}

/// Start time of the request the worker is currently on.
#[derive(Debug, Default)]
pub(crate) struct Heartbeat {
    busy_since: Mutex<Option<Instant>>,
}

impl Heartbeat {
    fn slot(&self) -> MutexGuard<'_, Option<Instant>> {
        self.busy_since.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn begin(&self) -> Instant {
        let now = Instant::now();
        *self.slot() = Some(now);
        now
    }

    pub(crate) fn end(&self) {
        *self.slot() = None;
    }

    pub(crate) fn health(&self, stall_threshold: Duration) -> PipelineHealth {
        match *self.slot() {
            None => PipelineHealth::Idle,
            Some(started) => {
                let elapsed = started.elapsed();
                if elapsed > stall_threshold {
                    PipelineHealth::Stalled { elapsed }
                } else {
                    PipelineHealth::Busy { elapsed }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn fresh_monitor_reports_full_efficiency() {
        let monitor = PerformanceMonitor::new(0.1);
        let sample = monitor.snapshot(0);
        assert_eq!(sample.processed, 0);
        assert_eq!(sample.efficiency, 1.0);
        assert_eq!(sample.fps, 0.0);
        assert_eq!(sample.avg_processing_ms, 0.0);
    }

    #[test]
    fn moving_average_starts_at_first_sample() {
        let monitor = PerformanceMonitor::new(0.5);
        monitor.record_processed(Duration::from_millis(10));
        assert_relative_eq!(monitor.snapshot(0).avg_processing_ms, 10.0, epsilon = 1e-9);
        monitor.record_processed(Duration::from_millis(20));
        assert_relative_eq!(monitor.snapshot(0).avg_processing_ms, 15.0, epsilon = 1e-9);
    }

    #[test]
    fn efficiency_counts_skips() {
        let monitor = PerformanceMonitor::new(0.1);
        monitor.record_processed(Duration::from_millis(1));
        for _ in 0..3 {
            monitor.record_skipped();
        }
        let sample = monitor.snapshot(2);
        assert_eq!((sample.processed, sample.skipped, sample.queue_depth), (1, 3, 2));
        assert_relative_eq!(sample.efficiency, 0.25);

        monitor.reset();
        assert_eq!(monitor.snapshot(0).skipped, 0);
    }

    #[test]
    fn heartbeat_reports_stalls() {
        let heartbeat = Heartbeat::default();
        assert_eq!(heartbeat.health(Duration::from_secs(1)), PipelineHealth::Idle);
        heartbeat.begin();
        assert!(matches!(
            heartbeat.health(Duration::from_secs(60)),
            PipelineHealth::Busy { .. }
        ));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            heartbeat.health(Duration::from_millis(1)),
            PipelineHealth::Stalled { .. }
        ));
        heartbeat.end();
        assert_eq!(heartbeat.health(Duration::ZERO), PipelineHealth::Idle);
    }
}
