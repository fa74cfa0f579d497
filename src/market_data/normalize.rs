// =============================================================================
// Symbol normalization — the single authoritative canonical form
// =============================================================================
//
// Every symbol stored, indexed, archived, or emitted by QuoteMesh is in the
// canonical `BASE_QUOTE` form produced here. Divergent per-subsystem
// normalizations silently misalign the live and archive sides, so there is
// exactly one function and everyone calls it.
// =============================================================================

/// Quote suffixes recognised for re-insertion of the `_` separator. Longer
/// suffixes are listed first so `..USDT` is never mis-split as `..USD` + `T`.
const QUOTE_ASSETS: &[&str] = &["USDT", "USDC", "BTC", "ETH"];

/// Normalize a raw venue symbol to canonical `BASE_QUOTE`.
///
/// Accepts any of the common venue spellings (`BTCUSDT`, `BTC/USDT`,
/// `BTC-USDT`, `btc_usdt`, `BTC USDT`) and returns `BTC_USDT`. Returns `None`
/// when the symbol does not end in a recognised quote asset or the base part
/// would be empty; the orchestrator drops such ticks.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let mut compact = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '/' | '-' | ' ' | '_' => {}
            _ => compact.extend(ch.to_uppercase()),
        }
    }

    for quote in QUOTE_ASSETS {
        if let Some(base) = compact.strip_suffix(quote) {
            if base.is_empty() {
                return None;
            }
            return Some(format!("{base}_{quote}"));
        }
    }
    None
}

/// Split a canonical `BASE_QUOTE` symbol into its parts.
///
/// Only meaningful for strings produced by [`normalize_symbol`].
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let (base, quote) = symbol.split_once('_')?;
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base, quote))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_concatenated_form() {
        assert_eq!(normalize_symbol("BTCUSDT").as_deref(), Some("BTC_USDT"));
        assert_eq!(normalize_symbol("ETHUSDC").as_deref(), Some("ETH_USDC"));
        assert_eq!(normalize_symbol("SOLBTC").as_deref(), Some("SOL_BTC"));
        assert_eq!(normalize_symbol("XRPETH").as_deref(), Some("XRP_ETH"));
    }

    #[test]
    fn separator_variants_collapse_to_one_form() {
        for raw in ["BTC/USDT", "BTC-USDT", "BTC_USDT", "BTC USDT", "btc_usdt"] {
            assert_eq!(normalize_symbol(raw).as_deref(), Some("BTC_USDT"), "raw={raw}");
        }
    }

    #[test]
    fn lowercase_input_is_uppercased() {
        assert_eq!(normalize_symbol("ethusdt").as_deref(), Some("ETH_USDT"));
    }

    #[test]
    fn unknown_quote_is_rejected() {
        assert_eq!(normalize_symbol("BTCEUR"), None);
        assert_eq!(normalize_symbol("BTCUSD"), None);
        assert_eq!(normalize_symbol(""), None);
    }

    #[test]
    fn bare_quote_has_no_base() {
        assert_eq!(normalize_symbol("USDT"), None);
        assert_eq!(normalize_symbol("/USDT"), None);
    }

    #[test]
    fn usdt_wins_over_shorter_suffixes() {
        // Must not split as base="ADAUSD" quote="T"-anything.
        assert_eq!(normalize_symbol("ADAUSDT").as_deref(), Some("ADA_USDT"));
        // A USDT/USDC cross keeps USDC as the quote.
        assert_eq!(normalize_symbol("USDTUSDC").as_deref(), Some("USDT_USDC"));
    }

    #[test]
    fn split_roundtrip() {
        let canon = normalize_symbol("BTC/USDT").unwrap();
        assert_eq!(split_symbol(&canon), Some(("BTC", "USDT")));
        assert_eq!(split_symbol("BTCUSDT"), None);
    }
}
