pub mod channel;
pub mod normalize;
pub mod spread;

// Re-export the channel halves for convenient access
// (e.g. `use crate::market_data::TickSender`).
pub use channel::{tick_channel, TickReceiver, TickSender};
pub use normalize::normalize_symbol;
pub use spread::spread_pct;
