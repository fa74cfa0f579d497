// =============================================================================
// Cross-exchange deviation calculator
// =============================================================================
//
// Holds `symbol → exchange → (bid, ts)` with overwrite-on-update semantics.
// One ingest is O(E) in the number of exchanges quoting the symbol and never
// scans an accumulator: appending ticks to a growing collection and
// filtering it per ingest is exactly the CPU leak this design exists to
// prevent, and must not be reintroduced.
//
// Every fresh pairwise reading is returned to the caller; the min-threshold
// gate marks which readings are published as `DeviationEvent`s. The signal
// detector consumes all readings — its exit threshold sits below the event
// gate, so exits must be observable from sub-threshold deviations.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use crate::runtime_config::DeviationConfig;
use crate::types::{DeviationEvent, ExchangeId, Tick};

/// One fresh pairwise deviation measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviationOutcome {
    pub reading: DeviationEvent,
    /// True when `|deviation_pct|` clears the configured minimum and the
    /// reading is published as a deviation event.
    pub above_threshold: bool,
}

#[derive(Debug, Clone, Copy)]
struct BidEntry {
    bid: f64,
    ts: DateTime<Utc>,
}

struct SymbolSpreads {
    by_exchange: HashMap<ExchangeId, BidEntry>,
    last_update: DateTime<Utc>,
}

/// Counters for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DeviationStats {
    pub symbols_tracked: usize,
    pub events_emitted: u64,
    pub readings_below_threshold: u64,
    pub stale_partners_skipped: u64,
    pub evicted_symbols: u64,
}

pub struct DeviationCalculator {
    min_threshold: f64,
    max_age: Duration,
    max_symbols: usize,

    spreads: RwLock<HashMap<String, SymbolSpreads>>,

    events_emitted: AtomicU64,
    below_threshold: AtomicU64,
    stale_skipped: AtomicU64,
    evicted_symbols: AtomicU64,
}

impl DeviationCalculator {
    /// `max_symbols` bounds the spread index the same way the store bounds
    /// its latest-tick index.
    pub fn new(cfg: &DeviationConfig, max_symbols: usize) -> Self {
        Self {
            min_threshold: cfg.min_threshold,
            max_age: Duration::seconds(cfg.max_tick_age_seconds as i64),
            max_symbols,
            spreads: RwLock::new(HashMap::new()),
            events_emitted: AtomicU64::new(0),
            below_threshold: AtomicU64::new(0),
            stale_skipped: AtomicU64::new(0),
            evicted_symbols: AtomicU64::new(0),
        }
    }

    /// Overwrite the `(symbol, exchange)` entry and measure this tick's bid
    /// against every other exchange whose cached bid is fresh enough.
    ///
    /// `deviation_pct = (tick.bid − other.bid) / other.bid × 100`; the cheap
    /// side is whichever exchange holds the lower bid. Partners older than
    /// the max age are treated as missing, not as current.
    pub fn ingest(&self, tick: &Tick) -> Vec<DeviationOutcome> {
        let Some(bid) = tick.best_bid().and_then(|d| d.to_f64()) else {
            return Vec::new();
        };
        if bid <= 0.0 {
            return Vec::new();
        }

        let partners: Vec<(ExchangeId, BidEntry)> = {
            let mut spreads = self.spreads.write();
            if !spreads.contains_key(&tick.symbol) && spreads.len() >= self.max_symbols {
                let lru = spreads
                    .iter()
                    .min_by_key(|(_, v)| v.last_update)
                    .map(|(k, _)| k.clone());
                if let Some(symbol) = lru {
                    spreads.remove(&symbol);
                    self.evicted_symbols.fetch_add(1, Ordering::Relaxed);
                }
            }
            let entry = spreads
                .entry(tick.symbol.clone())
                .or_insert_with(|| SymbolSpreads {
                    by_exchange: HashMap::new(),
                    last_update: tick.ts,
                });
            entry.last_update = tick.ts;
            entry
                .by_exchange
                .insert(tick.exchange, BidEntry { bid, ts: tick.ts });
            entry
                .by_exchange
                .iter()
                .filter(|(ex, _)| **ex != tick.exchange)
                .map(|(ex, e)| (*ex, *e))
                .collect()
        };

        let mut outcomes = Vec::with_capacity(partners.len());
        for (other_ex, other) in partners {
            if (tick.ts - other.ts).num_milliseconds().abs()
                > self.max_age.num_milliseconds()
            {
                self.stale_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if other.bid <= 0.0 {
                continue;
            }

            let deviation_pct = (bid - other.bid) / other.bid * 100.0;
            let (cheap_exchange, rich_exchange) = if bid < other.bid {
                (tick.exchange, other_ex)
            } else {
                (other_ex, tick.exchange)
            };

            let above_threshold = deviation_pct.abs() >= self.min_threshold;
            if above_threshold {
                self.events_emitted.fetch_add(1, Ordering::Relaxed);
            } else {
                self.below_threshold.fetch_add(1, Ordering::Relaxed);
            }

            outcomes.push(DeviationOutcome {
                reading: DeviationEvent {
                    symbol: tick.symbol.clone(),
                    cheap_exchange,
                    rich_exchange,
                    deviation_pct,
                    ts: tick.ts,
                },
                above_threshold,
            });
        }
        outcomes
    }

    pub fn stats(&self) -> DeviationStats {
        DeviationStats {
            symbols_tracked: self.spreads.read().len(),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            readings_below_threshold: self.below_threshold.load(Ordering::Relaxed),
            stale_partners_skipped: self.stale_skipped.load(Ordering::Relaxed),
            evicted_symbols: self.evicted_symbols.load(Ordering::Relaxed),
        }
    }
}
