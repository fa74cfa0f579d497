// =============================================================================
// Rolling-Window Module
// =============================================================================
//
// Cross-exchange rolling analytics:
// - Per-pair windows of as-of merged spread samples, horizon-pruned
// - Targeted per-window event delivery to registered handlers
// - LRU-bounded window and latest-tick indices

pub mod quantile;
pub mod store;
pub mod window;

pub use store::{HandlerId, RollingWindowStore, StoreStats, WindowHandler};
pub use window::RollingWindow;
