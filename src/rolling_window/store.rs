// =============================================================================
// Rolling-window store — bounded windows, targeted event delivery
// =============================================================================
//
// Owns every rolling window plus two indices:
//
//   windows           WindowKey → slot (per-window lock + last-access stamp)
//   subscriber_index  (exchange, symbol) → set of WindowKey
//
// A tick for (exchange, symbol) touches only the O(k) windows that pair the
// tick's exchange with another exchange holding a fresh tick on the same
// symbol, and invokes only those windows' handler lists. There is no
// broadcast fan-out and no subscriber-side filtering.
//
// Bounds: window count is LRU-capped (eviction runs inside the same write
// lock as the insert that overflowed — count-then-add races cannot occur),
// and the latest-tick index is LRU-capped by symbol. Appends and event
// dispatch for one window are serialised by that window's mutex, so a
// handler observes updates in append order and never a half-written sample.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::rolling_window::window::{AppendOutcome, RollingWindow};
use crate::runtime_config::{LatestTicksConfig, RollingWindowConfig};
use crate::types::{ExchangeId, Tick, WindowKey, WindowSample, WindowUpdate};

/// Handler invoked under the owning window's lock; must hand off, not work.
pub type WindowHandler = Arc<dyn Fn(&WindowUpdate) + Send + Sync>;

/// Opaque registration token returned by [`RollingWindowStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct WindowSlot {
    /// Millisecond wall-clock stamp of the last touch; read by LRU eviction
    /// without taking the window lock.
    last_access_ms: AtomicI64,
    window: Mutex<RollingWindow>,
}

impl WindowSlot {
    fn touch(&self) {
        self.last_access_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

struct LatestTick {
    tick: Tick,
    bid: f64,
}

struct LatestBySymbol {
    by_exchange: HashMap<ExchangeId, LatestTick>,
    last_update: DateTime<Utc>,
}

/// Counters and sizes for the stats/health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub active_windows: usize,
    pub total_samples: usize,
    pub latest_symbols: usize,
    pub evicted_windows: u64,
    pub evicted_latest: u64,
    pub samples_appended: u64,
    pub samples_skipped_as_of: u64,
    pub samples_out_of_order: u64,
    pub events_dispatched: u64,
    pub cleanup_removed: u64,
}

pub struct RollingWindowStore {
    horizon: Duration,
    tolerance_ms: i64,
    max_windows: usize,
    max_latest_symbols: usize,
    stale_latest: Duration,
    cleanup_interval: std::time::Duration,
    latest_sweep_every: u32,

    windows: RwLock<HashMap<WindowKey, Arc<WindowSlot>>>,
    subscriber_index: RwLock<HashMap<(ExchangeId, String), HashSet<WindowKey>>>,
    handlers: RwLock<HashMap<WindowKey, Arc<Vec<(HandlerId, WindowHandler)>>>>,
    latest: RwLock<HashMap<String, LatestBySymbol>>,

    next_handler_id: AtomicU64,
    evicted_windows: AtomicU64,
    evicted_latest: AtomicU64,
    samples_appended: AtomicU64,
    samples_skipped_as_of: AtomicU64,
    samples_out_of_order: AtomicU64,
    events_dispatched: AtomicU64,
    cleanup_removed: AtomicU64,
}

impl RollingWindowStore {
    pub fn new(window_cfg: &RollingWindowConfig, latest_cfg: &LatestTicksConfig) -> Self {
        let cleanup_interval =
            std::time::Duration::from_secs(window_cfg.cleanup_interval_seconds.max(1));
        let latest_sweep_every = (latest_cfg.stale_seconds
            / window_cfg.cleanup_interval_seconds.max(1))
        .max(1) as u32;

        Self {
            horizon: Duration::seconds(window_cfg.horizon_seconds as i64),
            tolerance_ms: window_cfg.as_of_tolerance_ms as i64,
            max_windows: window_cfg.max_windows,
            max_latest_symbols: latest_cfg.max_entries,
            stale_latest: Duration::seconds(latest_cfg.stale_seconds as i64),
            cleanup_interval,
            latest_sweep_every,

            windows: RwLock::new(HashMap::new()),
            subscriber_index: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),

            next_handler_id: AtomicU64::new(1),
            evicted_windows: AtomicU64::new(0),
            evicted_latest: AtomicU64::new(0),
            samples_appended: AtomicU64::new(0),
            samples_skipped_as_of: AtomicU64::new(0),
            samples_out_of_order: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            cleanup_removed: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Ingest
    // =========================================================================

    /// Ingest one spread tick: overwrite the latest-tick index, then as-of
    /// merge against every other exchange holding a fresh tick on the same
    /// symbol, appending one sample per affected window and firing that
    /// window's handlers. Trade ticks do not participate in windows.
    pub fn ingest(&self, tick: &Tick) {
        let Some(bid) = tick.best_bid().and_then(|d| d.to_f64()) else {
            return;
        };
        if bid <= 0.0 {
            return;
        }

        // Overwrite-on-update; eviction of the least-recently-updated symbol
        // happens inside this same write-lock scope when the bound is hit.
        let partners: Vec<(ExchangeId, f64, DateTime<Utc>)> = {
            let mut latest = self.latest.write();
            if !latest.contains_key(&tick.symbol) && latest.len() >= self.max_latest_symbols {
                let lru = latest
                    .iter()
                    .min_by_key(|(_, v)| v.last_update)
                    .map(|(k, _)| k.clone());
                if let Some(symbol) = lru {
                    latest.remove(&symbol);
                    self.evicted_latest.fetch_add(1, Ordering::Relaxed);
                }
            }
            let entry = latest
                .entry(tick.symbol.clone())
                .or_insert_with(|| LatestBySymbol {
                    by_exchange: HashMap::new(),
                    last_update: tick.ts,
                });
            entry.last_update = tick.ts;
            entry
                .by_exchange
                .insert(tick.exchange, LatestTick {
                    tick: tick.clone(),
                    bid,
                });
            entry
                .by_exchange
                .iter()
                .filter(|(ex, _)| **ex != tick.exchange)
                .map(|(ex, lt)| (*ex, lt.bid, lt.tick.ts))
                .collect()
        };

        for (other_ex, other_bid, other_ts) in partners {
            if (tick.ts - other_ts).num_milliseconds().abs() > self.tolerance_ms {
                self.samples_skipped_as_of.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if other_bid <= 0.0 {
                continue;
            }

            let key = WindowKey::canonical(tick.exchange, other_ex, tick.symbol.clone());
            let (bid_a, bid_b) = if key.exchange_a == tick.exchange {
                (bid, other_bid)
            } else {
                (other_bid, bid)
            };
            let sample = WindowSample {
                ts: tick.ts.max(other_ts),
                bid_a,
                bid_b,
                spread: (bid_a - bid_b) / bid_b,
            };

            let slot = self.get_or_create(&key);
            slot.touch();

            // Append + emit under the per-window lock: handlers see updates
            // in append order, and never a partially built sample.
            let mut window = slot.window.lock();
            match window.append(sample, self.horizon) {
                AppendOutcome::Appended => {
                    self.samples_appended.fetch_add(1, Ordering::Relaxed);
                    let update = WindowUpdate {
                        key: key.clone(),
                        sample,
                        upper_band: window.upper_band(),
                        lower_band: window.lower_band(),
                    };
                    self.dispatch(&key, &update);
                }
                AppendOutcome::OutOfOrder => {
                    self.samples_out_of_order.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn dispatch(&self, key: &WindowKey, update: &WindowUpdate) {
        let list = { self.handlers.read().get(key).cloned() };
        if let Some(list) = list {
            for (_, handler) in list.iter() {
                handler(update);
            }
            self.events_dispatched
                .fetch_add(list.len() as u64, Ordering::Relaxed);
        }
    }

    /// Fetch a window slot, creating it (and its subscriber-index entries)
    /// on first use. LRU eviction runs before this returns when the insert
    /// pushed the map over `max_windows`.
    fn get_or_create(&self, key: &WindowKey) -> Arc<WindowSlot> {
        if let Some(slot) = self.windows.read().get(key) {
            return slot.clone();
        }

        let mut windows = self.windows.write();
        if let Some(slot) = windows.get(key) {
            return slot.clone(); // lost the race, someone else created it
        }

        let slot = Arc::new(WindowSlot {
            last_access_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            window: Mutex::new(RollingWindow::new(key.clone())),
        });
        windows.insert(key.clone(), slot.clone());
        {
            let mut index = self.subscriber_index.write();
            index
                .entry((key.exchange_a, key.symbol.clone()))
                .or_default()
                .insert(key.clone());
            index
                .entry((key.exchange_b, key.symbol.clone()))
                .or_default()
                .insert(key.clone());
        }
        debug!(window = %key, "rolling window created");

        while windows.len() > self.max_windows {
            let lru = windows
                .iter()
                .filter(|(k, _)| *k != key)
                .min_by_key(|(_, s)| s.last_access_ms.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            let Some(lru_key) = lru else { break };
            windows.remove(&lru_key);
            self.remove_from_index(&lru_key);
            self.evicted_windows.fetch_add(1, Ordering::Relaxed);
            debug!(window = %lru_key, "rolling window evicted (LRU)");
        }

        slot
    }

    fn remove_from_index(&self, key: &WindowKey) {
        let mut index = self.subscriber_index.write();
        for ex in [key.exchange_a, key.exchange_b] {
            let idx_key = (ex, key.symbol.clone());
            if let Some(set) = index.get_mut(&idx_key) {
                set.remove(key);
                if set.is_empty() {
                    index.remove(&idx_key);
                }
            }
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register a handler for one window key. O(1) amortised: the handler
    /// list is copy-on-write, so dispatch never takes a write lock.
    pub fn subscribe(&self, key: &WindowKey, handler: WindowHandler) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write();
        let entry = handlers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Vec::new()));
        let mut list: Vec<(HandlerId, WindowHandler)> = entry.as_ref().clone();
        list.push((id, handler));
        *entry = Arc::new(list);
        id
    }

    /// Remove one specific handler registration.
    pub fn unsubscribe(&self, key: &WindowKey, id: HandlerId) {
        let mut handlers = self.handlers.write();
        if let Some(entry) = handlers.get_mut(key) {
            let list: Vec<(HandlerId, WindowHandler)> = entry
                .iter()
                .filter(|(hid, _)| *hid != id)
                .cloned()
                .collect();
            if list.is_empty() {
                handlers.remove(key);
            } else {
                *entry = Arc::new(list);
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Consistent detached copy of a window's samples, oldest first.
    pub fn get_window(&self, key: &WindowKey) -> Vec<WindowSample> {
        let slot = { self.windows.read().get(key).cloned() };
        match slot {
            Some(slot) => {
                slot.touch();
                slot.window.lock().snapshot()
            }
            None => Vec::new(),
        }
    }

    /// Window keys currently indexed for `(exchange, symbol)`.
    pub fn windows_for(&self, exchange: ExchangeId, symbol: &str) -> HashSet<WindowKey> {
        self.subscriber_index
            .read()
            .get(&(exchange, symbol.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Latest indexed spread tick for `(symbol, exchange)`.
    pub fn latest_tick(&self, symbol: &str, exchange: ExchangeId) -> Option<Tick> {
        self.latest
            .read()
            .get(symbol)
            .and_then(|entry| entry.by_exchange.get(&exchange))
            .map(|lt| lt.tick.clone())
    }

    pub fn stats(&self) -> StoreStats {
        let (active_windows, total_samples) = {
            let windows = self.windows.read();
            let total = windows
                .values()
                .map(|slot| slot.window.lock().len())
                .sum();
            (windows.len(), total)
        };
        StoreStats {
            active_windows,
            total_samples,
            latest_symbols: self.latest.read().len(),
            evicted_windows: self.evicted_windows.load(Ordering::Relaxed),
            evicted_latest: self.evicted_latest.load(Ordering::Relaxed),
            samples_appended: self.samples_appended.load(Ordering::Relaxed),
            samples_skipped_as_of: self.samples_skipped_as_of.load(Ordering::Relaxed),
            samples_out_of_order: self.samples_out_of_order.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            cleanup_removed: self.cleanup_removed.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Drop windows whose newest sample (or, for empty windows, last access)
    /// is older than `horizon + cleanup_interval`. Returns the number
    /// removed.
    pub fn cleanup_windows(&self) -> usize {
        let now = Utc::now();
        let grace = self.horizon
            + Duration::from_std(self.cleanup_interval).unwrap_or_else(|_| Duration::seconds(60));

        let dead: Vec<WindowKey> = {
            let windows = self.windows.read();
            windows
                .iter()
                .filter_map(|(key, slot)| {
                    let newest = slot.window.lock().newest_ts();
                    let reference = newest.unwrap_or_else(|| {
                        DateTime::from_timestamp_millis(
                            slot.last_access_ms.load(Ordering::Relaxed),
                        )
                        .unwrap_or(now)
                    });
                    (now - reference > grace).then(|| key.clone())
                })
                .collect()
        };

        if dead.is_empty() {
            return 0;
        }

        let mut windows = self.windows.write();
        let mut removed = 0;
        for key in &dead {
            if windows.remove(key).is_some() {
                removed += 1;
            }
        }
        drop(windows);
        for key in &dead {
            self.remove_from_index(key);
        }
        self.cleanup_removed
            .fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            info!(removed, "idle rolling windows cleaned up");
        }
        removed
    }

    /// Drop latest-tick entries whose symbol has been silent longer than the
    /// stale threshold. Returns the number removed.
    pub fn cleanup_latest(&self) -> usize {
        let now = Utc::now();
        let mut latest = self.latest.write();
        let before = latest.len();
        latest.retain(|_, entry| now - entry.last_update <= self.stale_latest);
        let removed = before - latest.len();
        self.evicted_latest
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Periodic maintenance task: window sweep every `cleanup_interval`,
    /// latest-tick sweep every `stale_seconds`.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.cleanup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ticks: u32 = 0;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        store.cleanup_windows();
                        ticks = ticks.wrapping_add(1);
                        if ticks % store.latest_sweep_every == 0 {
                            store.cleanup_latest();
                        }
                    }
                }
            }
        })
    }
}
