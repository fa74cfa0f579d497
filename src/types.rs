// =============================================================================
// Shared types used across the QuoteMesh pipeline
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Exchanges
// =============================================================================

/// The exchanges QuoteMesh knows how to speak to.
///
/// `as_str()` is the stable lowercase identifier used in window keys, health
/// maps, and archive partition paths; `Display` is the human form used in
/// push frames and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeId {
    Bybit,
    GateIo,
    Binance,
}

impl ExchangeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bybit => "bybit",
            Self::GateIo => "gateio",
            Self::Binance => "binance",
        }
    }

    /// All known exchanges, used to validate config entries.
    pub fn all() -> &'static [ExchangeId] {
        &[Self::Bybit, Self::GateIo, Self::Binance]
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "bybit" => Some(Self::Bybit),
            "gateio" | "gate" | "gate.io" => Some(Self::GateIo),
            "binance" => Some(Self::Binance),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bybit => write!(f, "Bybit"),
            Self::GateIo => write!(f, "GateIo"),
            Self::Binance => write!(f, "Binance"),
        }
    }
}

// =============================================================================
// Ticks
// =============================================================================

/// Trade aggressor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Payload of a normalized tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TickKind {
    /// Top-of-book update.
    Spread {
        best_bid: Decimal,
        best_ask: Decimal,
        /// `(ask - bid) / ask * 100`, computed once by the orchestrator.
        spread_pct: f64,
        bid_qty: Decimal,
        ask_qty: Decimal,
    },
    /// A single public trade.
    Trade {
        price: Decimal,
        qty: Decimal,
        side: Side,
    },
}

/// One price/trade update from one exchange for one symbol.
///
/// Immutable once handed to the orchestrator; sinks share it by value or
/// behind `Arc` and never mutate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub exchange: ExchangeId,
    /// Venue-raw as produced by an adapter; canonical `BASE_QUOTE` (see
    /// `market_data::normalize`) everywhere downstream of the orchestrator.
    pub symbol: String,
    /// Receive timestamp stamped by the adapter, UTC, microsecond resolution.
    pub ts: DateTime<Utc>,
    pub kind: TickKind,
}

impl Tick {
    /// Best bid for spread ticks, `None` for trades.
    pub fn best_bid(&self) -> Option<Decimal> {
        match &self.kind {
            TickKind::Spread { best_bid, .. } => Some(*best_bid),
            TickKind::Trade { .. } => None,
        }
    }

    pub fn is_spread(&self) -> bool {
        matches!(self.kind, TickKind::Spread { .. })
    }

    /// Archive partition kind: `spreads` or `trades`.
    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            TickKind::Spread { .. } => "spreads",
            TickKind::Trade { .. } => "trades",
        }
    }
}

// =============================================================================
// Cross-exchange windows
// =============================================================================

/// Identifies one cross-exchange rolling window.
///
/// The pair order is canonical: `exchange_a < exchange_b` by their stable
/// lowercase names. Always construct through [`WindowKey::canonical`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub exchange_a: ExchangeId,
    pub exchange_b: ExchangeId,
    pub symbol: String,
}

impl WindowKey {
    /// Build a key with the canonical exchange ordering, regardless of the
    /// order the caller passes the pair in.
    pub fn canonical(x: ExchangeId, y: ExchangeId, symbol: impl Into<String>) -> Self {
        let (exchange_a, exchange_b) = if x.as_str() <= y.as_str() {
            (x, y)
        } else {
            (y, x)
        };
        Self {
            exchange_a,
            exchange_b,
            symbol: symbol.into(),
        }
    }

    /// Whether `exchange` participates in this window.
    pub fn contains(&self, exchange: ExchangeId) -> bool {
        self.exchange_a == exchange || self.exchange_b == exchange
    }

    /// The other side of the pair, if `exchange` participates.
    pub fn counterparty(&self, exchange: ExchangeId) -> Option<ExchangeId> {
        if self.exchange_a == exchange {
            Some(self.exchange_b)
        } else if self.exchange_b == exchange {
            Some(self.exchange_a)
        } else {
            None
        }
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}:{}",
            self.exchange_a.as_str(),
            self.exchange_b.as_str(),
            self.symbol
        )
    }
}

/// One merged cross-exchange sample produced by the as-of join.
///
/// `spread = (bid_a - bid_b) / bid_b`, signed relative to the canonical pair
/// order of the owning [`WindowKey`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSample {
    pub ts: DateTime<Utc>,
    pub bid_a: f64,
    pub bid_b: f64,
    pub spread: f64,
}

/// Event payload delivered to window subscribers: the freshly appended sample
/// plus the rolling quantile bands at the time of the append.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowUpdate {
    pub key: WindowKey,
    pub sample: WindowSample,
    /// 0.97 rolling quantile of spreads over the live horizon.
    pub upper_band: f64,
    /// 0.03 rolling quantile of spreads over the live horizon.
    pub lower_band: f64,
}

// =============================================================================
// Deviations & signals
// =============================================================================

/// A cross-exchange price deviation above the configured minimum threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviationEvent {
    pub symbol: String,
    /// Exchange with the lower bid.
    pub cheap_exchange: ExchangeId,
    /// Exchange with the higher bid.
    pub rich_exchange: ExchangeId,
    /// Percentage deviation of the triggering tick's bid against the other
    /// exchange's bid; sign follows the triggering exchange's side.
    pub deviation_pct: f64,
    pub ts: DateTime<Utc>,
}

/// Direction of an entry signal relative to the triggering exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalDirection {
    Up,
    Down,
}

impl std::fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// An open arbitrage entry signal produced by the hysteresis detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: SignalDirection,
    pub cheap_exchange: ExchangeId,
    pub rich_exchange: ExchangeId,
    pub deviation_pct: f64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// =============================================================================
// Ticker snapshots (symbol selection)
// =============================================================================

/// One row of an exchange's 24h ticker snapshot, in the venue's raw symbol
/// format. Consumed by `exchanges::filter`.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerInfo {
    pub symbol: String,
    pub quote_volume_24h: Decimal,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_pair_is_order_independent() {
        let a = WindowKey::canonical(ExchangeId::GateIo, ExchangeId::Bybit, "BTC_USDT");
        let b = WindowKey::canonical(ExchangeId::Bybit, ExchangeId::GateIo, "BTC_USDT");
        assert_eq!(a, b);
        assert_eq!(a.exchange_a, ExchangeId::Bybit);
        assert_eq!(a.exchange_b, ExchangeId::GateIo);
    }

    #[test]
    fn canonical_pair_orders_by_name_not_declaration() {
        // "binance" < "bybit" < "gateio" lexicographically.
        let key = WindowKey::canonical(ExchangeId::Bybit, ExchangeId::Binance, "ETH_USDT");
        assert_eq!(key.exchange_a, ExchangeId::Binance);
        assert_eq!(key.exchange_b, ExchangeId::Bybit);
    }

    #[test]
    fn counterparty_lookup() {
        let key = WindowKey::canonical(ExchangeId::Bybit, ExchangeId::GateIo, "BTC_USDT");
        assert_eq!(key.counterparty(ExchangeId::Bybit), Some(ExchangeId::GateIo));
        assert_eq!(key.counterparty(ExchangeId::GateIo), Some(ExchangeId::Bybit));
        assert_eq!(key.counterparty(ExchangeId::Binance), None);
        assert!(key.contains(ExchangeId::Bybit));
        assert!(!key.contains(ExchangeId::Binance));
    }

    #[test]
    fn exchange_parse_aliases() {
        assert_eq!(ExchangeId::parse("Bybit"), Some(ExchangeId::Bybit));
        assert_eq!(ExchangeId::parse("gate.io"), Some(ExchangeId::GateIo));
        assert_eq!(ExchangeId::parse("BINANCE"), Some(ExchangeId::Binance));
        assert_eq!(ExchangeId::parse("kraken"), None);
    }

    #[test]
    fn tick_kind_helpers() {
        let tick = Tick {
            exchange: ExchangeId::Bybit,
            symbol: "BTC_USDT".into(),
            ts: Utc::now(),
            kind: TickKind::Spread {
                best_bid: Decimal::new(50_000, 0),
                best_ask: Decimal::new(50_001, 0),
                spread_pct: 0.002,
                bid_qty: Decimal::ONE,
                ask_qty: Decimal::ONE,
            },
        };
        assert!(tick.is_spread());
        assert_eq!(tick.best_bid(), Some(Decimal::new(50_000, 0)));
        assert_eq!(tick.kind_str(), "spreads");

        let trade = Tick {
            exchange: ExchangeId::GateIo,
            symbol: "BTC_USDT".into(),
            ts: Utc::now(),
            kind: TickKind::Trade {
                price: Decimal::new(50_000, 0),
                qty: Decimal::new(1, 2),
                side: Side::Buy,
            },
        };
        assert!(!trade.is_spread());
        assert_eq!(trade.best_bid(), None);
        assert_eq!(trade.kind_str(), "trades");
    }
}
