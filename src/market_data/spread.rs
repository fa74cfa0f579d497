// =============================================================================
// Spread calculator — pure top-of-book spread percentage
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Percentage spread between best ask and best bid: `(ask - bid) / ask * 100`.
///
/// Returns `None` for an empty or crossed-beyond-repair book (non-positive
/// prices); a locked book (bid == ask) is a valid 0.0.
pub fn spread_pct(best_bid: Decimal, best_ask: Decimal) -> Option<f64> {
    if best_bid <= Decimal::ZERO || best_ask <= Decimal::ZERO {
        return None;
    }
    let pct = (best_ask - best_bid) / best_ask * Decimal::ONE_HUNDRED;
    pct.to_f64()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn one_tick_spread() {
        // (50001 - 50000) / 50001 * 100 ≈ 0.002%
        let pct = spread_pct(dec!(50000), dec!(50001)).unwrap();
        assert!((pct - 0.00199996).abs() < 1e-6);
    }

    #[test]
    fn locked_book_is_zero() {
        assert_eq!(spread_pct(dec!(100), dec!(100)), Some(0.0));
    }

    #[test]
    fn crossed_book_is_negative() {
        let pct = spread_pct(dec!(101), dec!(100)).unwrap();
        assert!(pct < 0.0);
    }

    #[test]
    fn empty_book_rejected() {
        assert_eq!(spread_pct(dec!(0), dec!(100)), None);
        assert_eq!(spread_pct(dec!(100), dec!(0)), None);
        assert_eq!(spread_pct(dec!(-1), dec!(100)), None);
    }
}
