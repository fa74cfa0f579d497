// =============================================================================
// One cross-exchange rolling window
// =============================================================================
//
// A time-ordered sequence of merged spread samples, pruned to the horizon on
// every append. There is no sample-count cap: the horizon already bounds the
// memory. A sorted mirror of the spread values keeps the 0.97/0.03 quantile
// bands an index read.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::rolling_window::quantile::SortedSpreads;
use crate::types::{WindowKey, WindowSample};

pub const UPPER_BAND_Q: f64 = 0.97;
pub const LOWER_BAND_Q: f64 = 0.03;

#[derive(Debug)]
pub struct RollingWindow {
    pub key: WindowKey,
    samples: VecDeque<WindowSample>,
    sorted: SortedSpreads,
}

/// Outcome of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The sample's timestamp precedes the newest sample; dropped to keep
    /// the per-window non-decreasing order guarantee.
    OutOfOrder,
}

impl RollingWindow {
    pub fn new(key: WindowKey) -> Self {
        Self {
            key,
            samples: VecDeque::new(),
            sorted: SortedSpreads::new(),
        }
    }

    /// Append a sample and prune everything older than `horizon` relative to
    /// the newest timestamp. Out-of-order samples are dropped, not inserted.
    pub fn append(&mut self, sample: WindowSample, horizon: Duration) -> AppendOutcome {
        if let Some(last) = self.samples.back() {
            if sample.ts < last.ts {
                return AppendOutcome::OutOfOrder;
            }
        }

        self.samples.push_back(sample);
        self.sorted.insert(sample.spread);

        let cutoff = sample.ts - horizon;
        while let Some(front) = self.samples.front() {
            if front.ts < cutoff {
                self.sorted.remove(front.spread);
                self.samples.pop_front();
            } else {
                break;
            }
        }

        AppendOutcome::Appended
    }

    /// Rolling 0.97 quantile of spreads over the live horizon.
    pub fn upper_band(&self) -> f64 {
        self.sorted.quantile(UPPER_BAND_Q)
    }

    /// Rolling 0.03 quantile of spreads over the live horizon.
    pub fn lower_band(&self) -> f64 {
        self.sorted.quantile(LOWER_BAND_Q)
    }

    /// Detached copy of the current samples, oldest first.
    pub fn snapshot(&self) -> Vec<WindowSample> {
        self.samples.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn newest_ts(&self) -> Option<DateTime<Utc>> {
        self.samples.back().map(|s| s.ts)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExchangeId;

    fn key() -> WindowKey {
        WindowKey::canonical(ExchangeId::Bybit, ExchangeId::GateIo, "BTC_USDT")
    }

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn sample(ms: i64, spread: f64) -> WindowSample {
        WindowSample {
            ts: ts(ms),
            bid_a: 100.0,
            bid_b: 100.0,
            spread,
        }
    }

    #[test]
    fn appends_in_order() {
        let mut w = RollingWindow::new(key());
        assert_eq!(
            w.append(sample(1000, 0.1), Duration::seconds(900)),
            AppendOutcome::Appended
        );
        assert_eq!(
            w.append(sample(2000, 0.2), Duration::seconds(900)),
            AppendOutcome::Appended
        );
        assert_eq!(w.len(), 2);
        assert_eq!(w.newest_ts(), Some(ts(2000)));
    }

    #[test]
    fn equal_timestamps_are_accepted() {
        let mut w = RollingWindow::new(key());
        w.append(sample(1000, 0.1), Duration::seconds(900));
        assert_eq!(
            w.append(sample(1000, 0.2), Duration::seconds(900)),
            AppendOutcome::Appended
        );
    }

    #[test]
    fn out_of_order_sample_is_dropped() {
        let mut w = RollingWindow::new(key());
        w.append(sample(2000, 0.1), Duration::seconds(900));
        assert_eq!(
            w.append(sample(1000, 0.2), Duration::seconds(900)),
            AppendOutcome::OutOfOrder
        );
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn horizon_prunes_old_samples_on_append() {
        let mut w = RollingWindow::new(key());
        let horizon = Duration::seconds(10);
        w.append(sample(0, 0.1), horizon);
        w.append(sample(5_000, 0.2), horizon);
        // 20s in: the first two fall out of the 10s horizon.
        w.append(sample(20_000, 0.3), horizon);
        assert_eq!(w.len(), 1);
        let snap = w.snapshot();
        assert_eq!(snap[0].ts, ts(20_000));
        // Bands follow the surviving population.
        assert_eq!(w.upper_band(), 0.3);
        assert_eq!(w.lower_band(), 0.3);
    }

    #[test]
    fn sample_exactly_at_horizon_edge_survives() {
        let mut w = RollingWindow::new(key());
        let horizon = Duration::seconds(10);
        w.append(sample(0, 0.1), horizon);
        w.append(sample(10_000, 0.2), horizon);
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn bands_track_sorted_mirror() {
        let mut w = RollingWindow::new(key());
        let horizon = Duration::seconds(900);
        for i in 0..100 {
            w.append(sample(i * 1000, i as f64 / 100.0), horizon);
        }
        assert!((w.upper_band() - 0.96).abs() < 1e-9);
        assert!((w.lower_band() - 0.03).abs() < 1e-9);
    }

    #[test]
    fn snapshot_is_detached() {
        let mut w = RollingWindow::new(key());
        w.append(sample(1000, 0.1), Duration::seconds(900));
        let snap = w.snapshot();
        w.append(sample(2000, 0.2), Duration::seconds(900));
        assert_eq!(snap.len(), 1);
        assert_eq!(w.len(), 2);
    }
}
