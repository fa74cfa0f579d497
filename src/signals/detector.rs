// =============================================================================
// Signal detector — hysteresis entry/exit with cooldown and TTL
// =============================================================================
//
// Per-symbol state machine: Idle → Armed (Up|Down) → Idle. Entry requires
// the deviation magnitude to clear the entry threshold; the armed state
// holds until the magnitude collapses below the (lower) exit threshold,
// times out, or the signal TTL forces an exit. After any return to Idle a
// cooldown suppresses re-entry for the same symbol.
//
// The detector consumes every deviation reading (including sub-threshold
// ones) because the exit threshold sits below the public event gate.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::runtime_config::SignalsConfig;
use crate::types::{DeviationEvent, Signal, SignalDirection};

/// Why an armed signal was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Deviation magnitude fell to or below the exit threshold.
    Reverted,
    /// No exit observed within the signal TTL; force-closed.
    Expired,
}

/// A state transition worth reporting to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalTransition {
    Entry(Signal),
    Exit { signal: Signal, reason: ExitReason },
}

/// An open signal with its age, as served by the signals endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSignal {
    #[serde(flatten)]
    pub signal: Signal,
    pub age_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalStats {
    pub active: usize,
    pub entries: u64,
    pub exits: u64,
    pub expiries: u64,
}

#[derive(Default)]
struct SymbolState {
    active: Option<Signal>,
    cooldown_until: Option<DateTime<Utc>>,
}

pub struct SignalDetector {
    entry_threshold: f64,
    exit_threshold: f64,
    cooldown: Duration,
    ttl: Duration,

    states: RwLock<HashMap<String, SymbolState>>,

    entries: AtomicU64,
    exits: AtomicU64,
    expiries: AtomicU64,
}

impl SignalDetector {
    pub fn new(cfg: &SignalsConfig) -> Self {
        Self {
            entry_threshold: cfg.entry_threshold,
            exit_threshold: cfg.exit_threshold,
            cooldown: Duration::seconds(cfg.cooldown_seconds as i64),
            ttl: Duration::seconds(cfg.ttl_seconds as i64),
            states: RwLock::new(HashMap::new()),
            entries: AtomicU64::new(0),
            exits: AtomicU64::new(0),
            expiries: AtomicU64::new(0),
        }
    }

    /// Feed one deviation reading through the state machine. The reading's
    /// timestamp is the clock, which keeps replayed streams deterministic.
    pub fn observe(&self, reading: &DeviationEvent) -> Option<SignalTransition> {
        let now = reading.ts;
        let mut states = self.states.write();
        let state = states.entry(reading.symbol.clone()).or_default();

        // TTL enforcement runs ahead of the hysteresis check.
        if let Some(signal) = &state.active {
            if now >= signal.expires_at {
                let closed = signal.clone();
                state.active = None;
                state.cooldown_until = Some(now + self.cooldown);
                self.expiries.fetch_add(1, Ordering::Relaxed);
                return Some(SignalTransition::Exit {
                    signal: closed,
                    reason: ExitReason::Expired,
                });
            }
        }

        match &state.active {
            Some(signal) => {
                if reading.deviation_pct.abs() <= self.exit_threshold {
                    let closed = signal.clone();
                    state.active = None;
                    state.cooldown_until = Some(now + self.cooldown);
                    self.exits.fetch_add(1, Ordering::Relaxed);
                    Some(SignalTransition::Exit {
                        signal: closed,
                        reason: ExitReason::Reverted,
                    })
                } else {
                    None
                }
            }
            None => {
                if let Some(until) = state.cooldown_until {
                    if now < until {
                        return None;
                    }
                }
                if reading.deviation_pct.abs() < self.entry_threshold {
                    return None;
                }

                // Direction follows the canonical pair order: Down when the
                // lexicographically-first exchange is the cheap side.
                let direction =
                    if reading.cheap_exchange.as_str() < reading.rich_exchange.as_str() {
                        SignalDirection::Down
                    } else {
                        SignalDirection::Up
                    };

                let signal = Signal {
                    symbol: reading.symbol.clone(),
                    direction,
                    cheap_exchange: reading.cheap_exchange,
                    rich_exchange: reading.rich_exchange,
                    deviation_pct: reading.deviation_pct,
                    issued_at: now,
                    expires_at: now + self.ttl,
                };
                state.active = Some(signal.clone());
                self.entries.fetch_add(1, Ordering::Relaxed);
                Some(SignalTransition::Entry(signal))
            }
        }
    }

    /// Snapshot of currently open entry signals with ages. Signals past
    /// their TTL are force-closed here as well, so a quiet feed cannot keep
    /// an expired signal visible.
    pub fn active_signals(&self) -> Vec<ActiveSignal> {
        let now = Utc::now();
        let mut states = self.states.write();
        let mut open = Vec::new();
        for state in states.values_mut() {
            if let Some(signal) = &state.active {
                if now >= signal.expires_at {
                    state.active = None;
                    state.cooldown_until = Some(now + self.cooldown);
                    self.expiries.fetch_add(1, Ordering::Relaxed);
                } else {
                    open.push(ActiveSignal {
                        signal: signal.clone(),
                        age_ms: (now - signal.issued_at).num_milliseconds(),
                    });
                }
            }
        }
        open
    }

    pub fn stats(&self) -> SignalStats {
        let active = self
            .states
            .read()
            .values()
            .filter(|s| s.active.is_some())
            .count();
        SignalStats {
            active,
            entries: self.entries.load(Ordering::Relaxed),
            exits: self.exits.load(Ordering::Relaxed),
            expiries: self.expiries.load(Ordering::Relaxed),
        }
    }
}
