// =============================================================================
// Signals Module
// =============================================================================
//
// Converts cross-exchange deviation readings into entry/exit signals with
// hysteresis thresholds, per-symbol cooldown, and TTL-forced exits.

pub mod detector;

pub use detector::{ActiveSignal, ExitReason, SignalDetector, SignalStats, SignalTransition};
