// =============================================================================
// Bounded drop-oldest tick channels
// =============================================================================
//
// The orchestrator fans ticks out to the archive and window sinks through two
// independent instances of this channel. Producers never block: at capacity
// the oldest queued tick is displaced and counted. The receiver half is
// deliberately not cloneable and is consumed by the draining task — a
// competing-consumers topology (two sinks splitting one stream) cannot be
// wired up with this API.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use tokio::sync::Notify;
use tracing::warn;

use crate::logging::RateLimitedLog;
use crate::types::Tick;

struct Shared {
    name: &'static str,
    queue: ArrayQueue<Tick>,
    notify: Notify,
    closed: AtomicBool,
    sent: AtomicU64,
    dropped: AtomicU64,
    full_warn: RateLimitedLog,
}

/// Producer half. Cheap to clone; every adapter callback path holds one.
#[derive(Clone)]
pub struct TickSender {
    shared: Arc<Shared>,
}

/// Consumer half. Exactly one exists per channel and `recv` needs `&mut self`,
/// so a channel has exactly one draining task.
pub struct TickReceiver {
    shared: Arc<Shared>,
}

/// Create a bounded drop-oldest channel. `name` appears in drop warnings and
/// the stats endpoint.
pub fn tick_channel(name: &'static str, capacity: usize) -> (TickSender, TickReceiver) {
    let shared = Arc::new(Shared {
        name,
        queue: ArrayQueue::new(capacity.max(1)),
        notify: Notify::new(),
        closed: AtomicBool::new(false),
        sent: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
        full_warn: RateLimitedLog::per_second(),
    });
    (
        TickSender {
            shared: shared.clone(),
        },
        TickReceiver { shared },
    )
}

impl TickSender {
    /// Enqueue a tick without blocking. At capacity the oldest queued tick is
    /// displaced, counted, and reported through a rate-limited warning.
    pub fn send(&self, tick: Tick) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        if self.shared.queue.force_push(tick).is_some() {
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(suppressed) = self.shared.full_warn.allow() {
                warn!(
                    channel = self.shared.name,
                    dropped_total = dropped,
                    suppressed,
                    "channel at capacity, dropping oldest tick"
                );
            }
        }
        self.shared.sent.fetch_add(1, Ordering::Relaxed);
        self.shared.notify.notify_one();
    }

    /// Close the writer side. The receiver drains what is queued and then
    /// observes end-of-stream.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }
}

impl TickReceiver {
    /// Await the next tick. Returns `None` once the channel is closed and
    /// fully drained.
    pub async fn recv(&mut self) -> Option<Tick> {
        loop {
            if let Some(tick) = self.shared.queue.pop() {
                return Some(tick);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                // A send may have raced the close; take whatever landed.
                return self.shared.queue.pop();
            }
            let notified = self.shared.notify.notified();
            // Re-check after registering the waiter so a push between the
            // empty pop and `notified()` cannot strand us.
            if let Some(tick) = self.shared.queue.pop() {
                return Some(tick);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return self.shared.queue.pop();
            }
            notified.await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExchangeId, Side, TickKind};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn trade_tick(n: i64) -> Tick {
        Tick {
            exchange: ExchangeId::Bybit,
            symbol: "BTC_USDT".into(),
            ts: Utc::now(),
            kind: TickKind::Trade {
                price: Decimal::new(n, 0),
                qty: Decimal::ONE,
                side: Side::Buy,
            },
        }
    }

    fn price_of(tick: &Tick) -> i64 {
        match &tick.kind {
            TickKind::Trade { price, .. } => price.mantissa() as i64,
            _ => panic!("expected trade tick"),
        }
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let (tx, mut rx) = tick_channel("test", 8);
        for n in 0..5 {
            tx.send(trade_tick(n));
        }
        for n in 0..5 {
            assert_eq!(price_of(&rx.recv().await.unwrap()), n);
        }
    }

    #[tokio::test]
    async fn capacity_overflow_drops_oldest() {
        let (tx, mut rx) = tick_channel("test", 3);
        for n in 0..5 {
            tx.send(trade_tick(n));
        }
        assert_eq!(tx.dropped(), 2);
        assert_eq!(tx.sent(), 5);
        // 0 and 1 were displaced; 2, 3, 4 survive in order.
        for n in 2..5 {
            assert_eq!(price_of(&rx.recv().await.unwrap()), n);
        }
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let (tx, mut rx) = tick_channel("test", 8);
        tx.send(trade_tick(1));
        tx.send(trade_tick(2));
        tx.close();
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_is_ignored() {
        let (tx, mut rx) = tick_channel("test", 8);
        tx.close();
        tx.send(trade_tick(1));
        assert!(rx.recv().await.is_none());
        assert_eq!(tx.sent(), 0);
    }

    #[tokio::test]
    async fn receiver_wakes_on_send() {
        let (tx, mut rx) = tick_channel("test", 8);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(trade_tick(7));
        let got = handle.await.unwrap();
        assert_eq!(price_of(&got.unwrap()), 7);
    }

    #[tokio::test]
    async fn independent_channels_each_see_the_full_stream() {
        // The archive and window sinks each own a channel; neither steals
        // from the other.
        let (archive_tx, mut archive_rx) = tick_channel("archive", 16);
        let (window_tx, mut window_rx) = tick_channel("window", 16);
        for n in 0..10 {
            let tick = trade_tick(n);
            archive_tx.send(tick.clone());
            window_tx.send(tick);
        }
        archive_tx.close();
        window_tx.close();

        let mut archive_count = 0;
        while archive_rx.recv().await.is_some() {
            archive_count += 1;
        }
        let mut window_count = 0;
        while window_rx.recv().await.is_some() {
            window_count += 1;
        }
        assert_eq!(archive_count, 10);
        assert_eq!(window_count, 10);
    }
}
