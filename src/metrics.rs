//! Metrics hooks.
//!
//! The journal reports through an injected [`JournalMetrics`] implementation;
//! every method has a no-op default so sinks only override what they record.
//! Durations are measured with `quanta`, which reads the TSC where available.

use std::time::Duration;

pub trait JournalMetrics: Send + Sync {
    fn observe_append(&self, _bytes: usize) {}
    fn observe_append_latency(&self, _elapsed: Duration) {}
    fn observe_seek_latency(&self, _elapsed: Duration) {}
    fn set_segment_count(&self, _count: usize) {}
    fn observe_segment_creation(&self, _elapsed: Duration) {}
    fn observe_segment_flush(&self, _elapsed: Duration) {}
    fn observe_segment_allocation(&self, _elapsed: Duration) {}
    fn observe_journal_open(&self, _elapsed: Duration) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJournalMetrics;

impl JournalMetrics for NoopJournalMetrics {}

/// Measures the time between its creation and [`Stopwatch::elapsed`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Stopwatch {
    start: quanta::Instant,
}

impl Stopwatch {
    pub(crate) fn start() -> Self {
        Self {
            start: quanta::Instant::now(),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        quanta::Instant::now().duration_since(self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingMetrics {
        appends: AtomicUsize,
        bytes: AtomicUsize,
    }

    impl JournalMetrics for CountingMetrics {
        fn observe_append(&self, bytes: usize) {
            self.appends.fetch_add(1, Ordering::Relaxed);
            self.bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    #[test]
    fn defaults_are_noops_and_overrides_record() {
        let metrics = CountingMetrics::default();
        metrics.observe_append(10);
        metrics.observe_append(5);
        metrics.observe_seek_latency(Duration::from_micros(3));
        assert_eq!(metrics.appends.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.bytes.load(Ordering::Relaxed), 15);

        NoopJournalMetrics.set_segment_count(3);
    }

    #[test]
    fn stopwatch_is_monotonic() {
        let watch = Stopwatch::start();
        let first = watch.elapsed();
        let second = watch.elapsed();
        assert!(second >= first);
    }
}
