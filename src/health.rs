// =============================================================================
// Exchange health monitor
// =============================================================================
//
// Tracks the last-seen tick timestamp and lifecycle state per exchange.
// Adapters' supervisors set Failed/Stopped; every tick touches the entry.
// Staleness is derived at read time, so there is no background task to keep
// in sync with the stale threshold.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::types::ExchangeId;

/// Externally visible exchange state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    NotStarted,
    Running,
    Stale,
    Failed,
    Stopped,
}

impl std::fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Stale => write!(f, "stale"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HealthEntry {
    last_tick_at: Option<DateTime<Utc>>,
    state: ExchangeState,
}

pub struct HealthMonitor {
    stale_after: Duration,
    entries: RwLock<HashMap<ExchangeId, HealthEntry>>,
}

impl HealthMonitor {
    pub fn new(stale_after_secs: u64) -> Self {
        Self {
            stale_after: Duration::seconds(stale_after_secs as i64),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register an exchange before its adapter starts.
    pub fn register(&self, exchange: ExchangeId) {
        self.entries.write().entry(exchange).or_insert(HealthEntry {
            last_tick_at: None,
            state: ExchangeState::NotStarted,
        });
    }

    /// Record a tick. Transitions NotStarted/Stale back to Running; Failed
    /// and Stopped are terminal for the supervisor to undo explicitly.
    pub fn touch(&self, exchange: ExchangeId) {
        let mut entries = self.entries.write();
        let entry = entries.entry(exchange).or_insert(HealthEntry {
            last_tick_at: None,
            state: ExchangeState::NotStarted,
        });
        entry.last_tick_at = Some(Utc::now());
        if !matches!(entry.state, ExchangeState::Failed | ExchangeState::Stopped) {
            entry.state = ExchangeState::Running;
        }
    }

    pub fn mark_failed(&self, exchange: ExchangeId) {
        self.set_state(exchange, ExchangeState::Failed);
    }

    pub fn mark_stopped(&self, exchange: ExchangeId) {
        self.set_state(exchange, ExchangeState::Stopped);
    }

    fn set_state(&self, exchange: ExchangeId, state: ExchangeState) {
        let mut entries = self.entries.write();
        let entry = entries.entry(exchange).or_insert(HealthEntry {
            last_tick_at: None,
            state: ExchangeState::NotStarted,
        });
        entry.state = state;
    }

    /// Current state of one exchange, with staleness derived from the last
    /// tick age.
    pub fn state_of(&self, exchange: ExchangeId) -> ExchangeState {
        let entries = self.entries.read();
        match entries.get(&exchange) {
            Some(entry) => self.derive(entry, Utc::now()),
            None => ExchangeState::NotStarted,
        }
    }

    /// Snapshot of all registered exchanges for the health endpoint.
    pub fn snapshot(&self) -> HashMap<ExchangeId, ExchangeState> {
        let now = Utc::now();
        self.entries
            .read()
            .iter()
            .map(|(ex, entry)| (*ex, self.derive(entry, now)))
            .collect()
    }

    fn derive(&self, entry: &HealthEntry, now: DateTime<Utc>) -> ExchangeState {
        if entry.state == ExchangeState::Running {
            match entry.last_tick_at {
                Some(at) if now - at > self.stale_after => ExchangeState::Stale,
                _ => ExchangeState::Running,
            }
        } else {
            entry.state
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_exchange_starts_not_started() {
        let monitor = HealthMonitor::new(120);
        monitor.register(ExchangeId::Bybit);
        assert_eq!(monitor.state_of(ExchangeId::Bybit), ExchangeState::NotStarted);
    }

    #[test]
    fn unknown_exchange_reports_not_started() {
        let monitor = HealthMonitor::new(120);
        assert_eq!(monitor.state_of(ExchangeId::GateIo), ExchangeState::NotStarted);
    }

    #[test]
    fn touch_transitions_to_running() {
        let monitor = HealthMonitor::new(120);
        monitor.register(ExchangeId::Bybit);
        monitor.touch(ExchangeId::Bybit);
        assert_eq!(monitor.state_of(ExchangeId::Bybit), ExchangeState::Running);
    }

    #[test]
    fn silence_derives_stale() {
        // Zero stale threshold: any touch is instantly stale on read.
        let monitor = HealthMonitor::new(0);
        monitor.touch(ExchangeId::Bybit);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(monitor.state_of(ExchangeId::Bybit), ExchangeState::Stale);
    }

    #[test]
    fn failed_is_sticky_across_touches() {
        let monitor = HealthMonitor::new(120);
        monitor.touch(ExchangeId::Bybit);
        monitor.mark_failed(ExchangeId::Bybit);
        monitor.touch(ExchangeId::Bybit);
        assert_eq!(monitor.state_of(ExchangeId::Bybit), ExchangeState::Failed);
    }

    #[test]
    fn snapshot_covers_all_registered() {
        let monitor = HealthMonitor::new(120);
        monitor.register(ExchangeId::Bybit);
        monitor.register(ExchangeId::GateIo);
        monitor.touch(ExchangeId::GateIo);
        monitor.mark_stopped(ExchangeId::Bybit);

        let snap = monitor.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[&ExchangeId::Bybit], ExchangeState::Stopped);
        assert_eq!(snap[&ExchangeId::GateIo], ExchangeState::Running);
    }
}
