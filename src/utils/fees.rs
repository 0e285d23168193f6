//! Exchange fee arithmetic.
//!
//! Kalshi charges per-contract fees proportional to `p * (1 - p)`, the
//! price-implied variance of the contract. Both legs of a resting pair
//! pay the maker rate; the taker rate applies only to orders that cross.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Maker (resting order) fee rate.
pub const MAKER_RATE: Decimal = dec!(0.0175);
/// Taker (crossing order) fee rate.
pub const TAKER_RATE: Decimal = dec!(0.07);

/// Round a dollar amount up to the next whole cent.
pub fn round_up_to_cent(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::AwayFromZero)
}

/// Fee in dollars for `contracts` contracts at `price_cents`, at the given rate.
///
/// `rate * n * (p/100) * (1 - p/100)`, rounded up to the next cent.
fn fee(rate: Decimal, price_cents: i64, contracts: i64) -> Decimal {
    let p = Decimal::from(price_cents);
    let raw = rate * Decimal::from(contracts) * p * (Decimal::ONE_HUNDRED - p) / dec!(10000);
    round_up_to_cent(raw)
}

/// Maker fee in dollars for a resting order.
pub fn maker_fee(price_cents: i64, contracts: i64) -> Decimal {
    fee(MAKER_RATE, price_cents, contracts)
}

/// Taker fee in dollars for a crossing order.
pub fn taker_fee(price_cents: i64, contracts: i64) -> Decimal {
    fee(TAKER_RATE, price_cents, contracts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maker_fee_rounds_up_to_next_cent() {
        // 0.0175 * 1 * 0.48 * 0.52 = $0.004368 -> $0.01
        assert_eq!(maker_fee(48, 1), dec!(0.01));
        // 0.0175 * 10 * 0.48 * 0.52 = $0.04368 -> $0.05
        assert_eq!(maker_fee(48, 10), dec!(0.05));
        // 0.0175 * 100 * 0.50 * 0.50 = $0.4375 -> $0.44
        assert_eq!(maker_fee(50, 100), dec!(0.44));
    }

    #[test]
    fn test_exact_cent_amounts_do_not_round() {
        // 0.07 * 100 * 0.50 * 0.50 = $1.75 exactly
        assert_eq!(taker_fee(50, 100), dec!(1.75));
    }

    #[test]
    fn test_fee_symmetry() {
        // p * (1 - p) is symmetric around 50, so fee(p) == fee(100 - p)
        for p in 1..=99 {
            assert_eq!(maker_fee(p, 7), maker_fee(100 - p, 7), "price {}", p);
            assert_eq!(taker_fee(p, 7), taker_fee(100 - p, 7), "price {}", p);
        }
    }

    #[test]
    fn test_taker_rate_is_four_times_maker() {
        // Rates differ 0.07 / 0.0175 = 4x; at sizes where neither rounds,
        // the fees differ exactly 4x.
        assert_eq!(taker_fee(50, 400), maker_fee(50, 400) * dec!(4));
    }

    #[test]
    fn test_zero_contracts_zero_fee() {
        assert_eq!(maker_fee(48, 0), Decimal::ZERO);
    }
}
