// =============================================================================
// Symbol selection — pure volume/quote filter
// =============================================================================

use rust_decimal::prelude::ToPrimitive;

use crate::market_data::normalize::{normalize_symbol, split_symbol};
use crate::runtime_config::VolumeFilterConfig;
use crate::types::TickerInfo;

/// Select the venue-raw symbols to subscribe to.
///
/// A symbol is retained when its normalized quote asset is in the configured
/// set AND its 24h quote volume lies within `[min_usd_volume,
/// max_usd_volume]`. Symbols that fail normalization are skipped outright.
/// The returned list preserves the snapshot order and the venue's raw
/// spelling (that is what the subscribe call needs).
pub fn select_symbols(tickers: &[TickerInfo], filter: &VolumeFilterConfig) -> Vec<String> {
    tickers
        .iter()
        .filter(|t| {
            let Some(canonical) = normalize_symbol(&t.symbol) else {
                return false;
            };
            let Some((_, quote)) = split_symbol(&canonical) else {
                return false;
            };
            if !filter.quote_assets.iter().any(|q| q == quote) {
                return false;
            }
            let Some(volume) = t.quote_volume_24h.to_f64() else {
                return false;
            };
            volume >= filter.min_usd_volume && volume <= filter.max_usd_volume
        })
        .map(|t| t.symbol.clone())
        .collect()
}
