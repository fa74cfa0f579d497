// =============================================================================
// Exchange adapter contract
// =============================================================================
//
// One adapter per venue. An adapter owns its network connections and spawned
// stream tasks; the orchestrator holds a non-owning `Arc<dyn ExchangeAdapter>`
// and receives normalized-enough ticks through the registered callback.
//
// Reconnection is the adapter's business: on a dropped stream it backs off
// exponentially and resubscribes the identical symbol set without
// orchestrator involvement.
// =============================================================================

pub mod binance;
pub mod bybit;
pub mod filter;
pub mod gateio;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{ExchangeId, Tick, TickerInfo};

/// Callback invoked once per update per symbol. Must not block: anything
/// heavier than a channel hand-off is the orchestrator's job.
pub type TickCallback = Arc<dyn Fn(Tick) + Send + Sync>;

// =============================================================================
// Failure taxonomy
// =============================================================================

/// Adapter failure kinds, matched by the stream supervisors.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Socket drop, timeout, transient HTTP failure. Retried inside the
    /// adapter with backoff; not surfaced unless it persists.
    #[error("transient connection error: {0}")]
    Transient(String),

    /// Auth failure, subscription rejection, protocol mismatch. The adapter
    /// moves to `Failed` and the orchestrator isolates it.
    #[error("fatal adapter error: {0}")]
    Fatal(String),

    /// One malformed message. Logged, dropped, the stream continues.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl AdapterError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

// =============================================================================
// Adapter state machine
// =============================================================================

/// `NotStarted → Connecting → Subscribed ⇄ Reconnecting → Stopped | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    NotStarted,
    Connecting,
    Subscribed,
    Reconnecting,
    Stopped,
    Failed,
}

impl std::fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Connecting => write!(f, "connecting"),
            Self::Subscribed => write!(f, "subscribed"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// The adapter trait
// =============================================================================

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn id(&self) -> ExchangeId;

    /// Acquire scoped resources and mark the adapter live. Stream tasks are
    /// spawned by the `subscribe_*` calls; `start` must be called first.
    async fn start(&self) -> Result<(), AdapterError>;

    /// Stop all stream tasks and release connections. Idempotent; safe on
    /// every exit path.
    async fn stop(&self);

    /// Snapshot of `{symbol, 24h quote volume}` for symbol selection, in the
    /// venue's raw symbol format.
    async fn get_tickers(&self) -> Result<Vec<TickerInfo>, AdapterError>;

    /// Subscribe to top-of-book updates for `symbols` (venue-raw format).
    /// `on_tick` fires at most once per update per symbol.
    async fn subscribe_spreads(
        &self,
        symbols: Vec<String>,
        on_tick: TickCallback,
    ) -> Result<(), AdapterError>;

    /// Subscribe to public trades for `symbols` (venue-raw format).
    async fn subscribe_trades(
        &self,
        symbols: Vec<String>,
        on_tick: TickCallback,
    ) -> Result<(), AdapterError>;

    fn status(&self) -> AdapterStatus;
}

// =============================================================================
// Reconnect backoff
// =============================================================================

/// Exponential backoff for stream reconnects: 1 s base, doubling, 60 s cap,
/// with a small attempt-derived stagger so a fleet of streams dropped by the
/// same venue outage does not reconnect in lock-step.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay for the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let stagger = Duration::from_millis(u64::from(self.attempt % 7) * 137);
        self.attempt = self.attempt.saturating_add(1);
        exp.min(self.cap) + stagger
    }

    /// Call after a successful (re)subscribe.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

// =============================================================================
// Shared parse helpers
// =============================================================================

/// Parse a decimal that venues ship as a JSON string (occasionally a bare
/// number). A missing or malformed field is a protocol violation for the
/// enclosing message.
pub(crate) fn json_decimal(
    value: &serde_json::Value,
    field: &str,
) -> Result<Decimal, AdapterError> {
    match value {
        serde_json::Value::String(s) => s
            .parse::<Decimal>()
            .map_err(|e| AdapterError::Protocol(format!("field {field}: {e}"))),
        serde_json::Value::Number(n) => n
            .to_string()
            .parse::<Decimal>()
            .map_err(|e| AdapterError::Protocol(format!("field {field}: {e}"))),
        _ => Err(AdapterError::Protocol(format!(
            "field {field} missing or not a decimal"
        ))),
    }
}

/// Millisecond UNIX timestamp → UTC datetime; falls back to now on a
/// nonsensical value rather than rejecting the tick.
pub(crate) fn ms_to_utc(ms: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let d0 = b.next_delay();
        let d1 = b.next_delay();
        let d2 = b.next_delay();
        assert!(d0 >= Duration::from_secs(1) && d0 < Duration::from_secs(2));
        assert!(d1 >= Duration::from_secs(2) && d1 < Duration::from_secs(3));
        assert!(d2 >= Duration::from_secs(4) && d2 < Duration::from_secs(5));

        for _ in 0..20 {
            let d = b.next_delay();
            assert!(d <= Duration::from_secs(61), "cap exceeded: {d:?}");
        }
    }

    #[test]
    fn backoff_reset_restarts_sequence() {
        let mut b = Backoff::default();
        let _ = b.next_delay();
        let _ = b.next_delay();
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert!(b.next_delay() < Duration::from_secs(2));
    }

    #[test]
    fn json_decimal_accepts_strings_and_numbers() {
        let s = serde_json::json!("50000.123456789");
        assert_eq!(
            json_decimal(&s, "p").unwrap(),
            "50000.123456789".parse::<Decimal>().unwrap()
        );
        let n = serde_json::json!(42);
        assert_eq!(json_decimal(&n, "p").unwrap(), Decimal::new(42, 0));
    }

    #[test]
    fn json_decimal_rejects_garbage() {
        let v = serde_json::json!({"nested": true});
        assert!(matches!(
            json_decimal(&v, "p"),
            Err(AdapterError::Protocol(_))
        ));
        let bad = serde_json::json!("not-a-number");
        assert!(matches!(
            json_decimal(&bad, "p"),
            Err(AdapterError::Protocol(_))
        ));
    }

    #[test]
    fn fatal_classification() {
        assert!(AdapterError::Fatal("auth".into()).is_fatal());
        assert!(!AdapterError::Transient("net".into()).is_fatal());
        assert!(!AdapterError::Protocol("junk".into()).is_fatal());
    }
}
