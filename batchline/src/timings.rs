use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Call counter and cumulative duration for one stage of a pipeline. Updates are lock-free so a
/// pipeline can be shared between threads.
#[derive(Debug, Default)]
pub struct Timings {
    num_calls: AtomicU64,
    total_ns: AtomicU64,
}

/// A point in time copy of [`Timings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingsSnapshot {
    pub num_calls: u64,
    pub total: Duration,
}

impl Timings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one call that took `elapsed`.
    pub fn record(&self, elapsed: Duration) {
        let elapsed_ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TimingsSnapshot {
        TimingsSnapshot {
            num_calls: self.num_calls.load(Ordering::Relaxed),
            total: Duration::from_nanos(self.total_ns.load(Ordering::Relaxed)),
        }
    }
}

impl TimingsSnapshot {
    /// Mean time per call. Zero calls are treated as one.
    pub fn mean(&self) -> Duration {
        let calls = self.num_calls.max(1);
        Duration::from_nanos((self.total.as_nanos() / calls as u128) as u64)
    }

    /// Formats the snapshot as a stats line, e.g.
    /// `Tokenizer: Total time=1.2ms, Execution count=3, Average query time=400µs`.
    pub fn describe(&self, stage: &str) -> String {
        format!(
            "{}: Total time={:?}, Execution count={}, Average query time={:?}",
            stage,
            self.total,
            self.num_calls,
            self.mean()
        )
    }
}
