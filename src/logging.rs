// =============================================================================
// Rate-limited logging for hot paths
// =============================================================================
//
// Any log statement reachable once per tick must go through one of these
// gates. Unthrottled synchronous log writes at the producer rate have been
// observed to freeze pipelines just as badly as an algorithmic leak, so the
// hot path counts first and logs at most once per interval.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Token-bucket gate for a single log call-site.
///
/// `allow()` returns `true` at most once per `interval`, and reports how many
/// calls were suppressed since the last allowed one so the log line can carry
/// the count.
pub struct RateLimitedLog {
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl RateLimitedLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Default hot-path gate: one event per second.
    pub fn per_second() -> Self {
        Self::new(Duration::from_secs(1))
    }

    /// Returns `Some(suppressed_since_last)` when the caller may log now,
    /// `None` when the line should be swallowed.
    pub fn allow(&self) -> Option<u64> {
        let now = Instant::now();
        let mut last = self.last_emit.lock();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(now);
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }

    /// Total calls swallowed since the last allowed call.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}
