// Worker metrics module
//
// Lightweight per-worker counters for observing task throughput and failures

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Per-worker task metrics
///
/// Uses atomic operations for thread-safe tracking without locks. Every
/// [`Worker`](crate::worker::Worker) owns one instance, shared with its
/// task loop, and logs a summary when it stops.
#[derive(Debug)]
pub struct WorkerMetrics {
    /// Tasks accepted onto the queue
    pub tasks_posted: AtomicU64,

    /// Tasks that ran to completion
    pub tasks_completed: AtomicU64,

    /// Tasks that panicked (caught by the task loop)
    pub tasks_panicked: AtomicU64,

    /// Posts refused because the worker was stopped
    pub posts_rejected: AtomicU64,

    /// Total time spent executing tasks in microseconds
    pub busy_time_us: AtomicU64,

    /// Worker start time
    start_time: Instant,
}

impl WorkerMetrics {
    /// Create a new WorkerMetrics instance
    pub fn new() -> Self {
        Self {
            tasks_posted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
            posts_rejected: AtomicU64::new(0),
            busy_time_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_posted(&self) {
        self.tasks_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.busy_time_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_panicked(&self) {
        self.tasks_panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.posts_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of tasks accepted onto the queue so far
    pub fn posted(&self) -> u64 {
        self.tasks_posted.load(Ordering::Relaxed)
    }

    /// Number of tasks that finished, successfully or by panicking
    pub fn finished(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed) + self.tasks_panicked.load(Ordering::Relaxed)
    }

    /// Tasks accepted but not yet finished
    pub fn pending(&self) -> u64 {
        self.posted().saturating_sub(self.finished())
    }

    /// Get total uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get average task execution time in microseconds
    pub fn avg_task_time_us(&self) -> f64 {
        let total = self.busy_time_us.load(Ordering::Relaxed);
        let count = self.tasks_completed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self, worker: &str) {
        tracing::info!(
            "Worker '{}' metrics: {} posted, {} completed, {} panicked, {} rejected, \
             avg {:.1}us per task, uptime {:.2}s",
            worker,
            self.tasks_posted.load(Ordering::Relaxed),
            self.tasks_completed.load(Ordering::Relaxed),
            self.tasks_panicked.load(Ordering::Relaxed),
            self.posts_rejected.load(Ordering::Relaxed),
            self.avg_task_time_us(),
            self.uptime().as_secs_f64()
        );
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = WorkerMetrics::new();
        assert_eq!(metrics.posted(), 0);
        assert_eq!(metrics.finished(), 0);
        assert_eq!(metrics.pending(), 0);
    }

    #[test]
    fn test_record_task_outcomes() {
        let metrics = WorkerMetrics::new();

        metrics.record_posted();
        metrics.record_posted();
        metrics.record_posted();
        metrics.record_completed(Duration::from_micros(100));
        metrics.record_panicked();

        assert_eq!(metrics.posted(), 3);
        assert_eq!(metrics.finished(), 2);
        assert_eq!(metrics.pending(), 1);
        assert_eq!(metrics.tasks_panicked.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_avg_task_time() {
        let metrics = WorkerMetrics::new();

        metrics.record_completed(Duration::from_micros(100));
        metrics.record_completed(Duration::from_micros(300));

        assert_eq!(metrics.busy_time_us.load(Ordering::Relaxed), 400);
        assert_eq!(metrics.avg_task_time_us(), 200.0);
    }

    #[test]
    fn test_busy_time_saturates() {
        let metrics = WorkerMetrics::new();
        metrics.record_completed(Duration::MAX);
        assert_eq!(metrics.busy_time_us.load(Ordering::Relaxed), u64::MAX);
    }

    #[test]
    fn test_avg_task_time_no_tasks() {
        let metrics = WorkerMetrics::new();
        assert_eq!(metrics.avg_task_time_us(), 0.0);
    }

    #[test]
    fn test_rejected_posts_are_not_pending() {
        let metrics = WorkerMetrics::new();
        metrics.record_rejected();
        assert_eq!(metrics.pending(), 0);
        assert_eq!(metrics.posts_rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_uptime() {
        let metrics = WorkerMetrics::new();
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.uptime().as_millis() >= 10);
    }
}
