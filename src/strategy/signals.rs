//! Quote selection: which books are worth pairing, and at what size.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, trace};
use uuid::Uuid;

use super::books::MarketBook;
use crate::config::TradingConfig;
use crate::utils::fees::maker_fee;

/// Books closer to resolution than this are never quoted; prices have
/// gone directional by then.
const MIN_SECONDS_TO_CLOSE: i64 = 600;
/// A best bid under this is a near-terminal market, not a quoting venue.
const MIN_BID_CENTS: i64 = 10;
/// Below this combined bid the market is too thin to make.
const MIN_COMBINED_BID: i64 = 85;

/// Decision to place one paired quote.
#[derive(Debug, Clone)]
pub struct PairSignal {
    pub pair_id: String,
    pub ticker: String,
    pub asset: String,
    pub market_question: String,
    pub yes_price: i64,
    pub no_price: i64,
    pub size: i64,
    /// Gross spread in cents at signal time.
    pub target_spread: i64,
    /// Net dollars if both legs fill at the bid.
    pub expected_profit: Decimal,
}

impl PairSignal {
    /// Dollar cost of both legs at their limit prices.
    pub fn cost(&self) -> Decimal {
        Decimal::from((self.yes_price + self.no_price) * self.size) / Decimal::ONE_HUNDRED
    }
}

#[derive(Debug, Clone, Copy)]
enum RejectReason {
    OneSided,
    NearResolution,
    Lopsided,
    ThinCombined,
    NoLiquidity,
    BelowThreshold,
    ZeroSize,
}

/// Pure filter from books to pair signals.
pub struct SpreadStrategy {
    config: TradingConfig,
}

impl SpreadStrategy {
    pub fn new(config: TradingConfig) -> Self {
        Self { config }
    }

    /// Evaluate a batch of books, tallying rejections for the log.
    pub fn evaluate(&self, books: &[&MarketBook]) -> Vec<PairSignal> {
        let mut signals = Vec::new();
        let mut rejected_one_sided = 0usize;
        let mut rejected_near_close = 0usize;
        let mut rejected_lopsided = 0usize;
        let mut rejected_thin = 0usize;
        let mut rejected_no_liquidity = 0usize;
        let mut rejected_below_threshold = 0usize;
        let mut rejected_zero_size = 0usize;

        for book in books {
            match self.evaluate_book(book) {
                Ok(signal) => signals.push(signal),
                Err(reason) => {
                    trace!(ticker = %book.ticker, reason = ?reason, "Book rejected");
                    match reason {
                        RejectReason::OneSided => rejected_one_sided += 1,
                        RejectReason::NearResolution => rejected_near_close += 1,
                        RejectReason::Lopsided => rejected_lopsided += 1,
                        RejectReason::ThinCombined => rejected_thin += 1,
                        RejectReason::NoLiquidity => rejected_no_liquidity += 1,
                        RejectReason::BelowThreshold => rejected_below_threshold += 1,
                        RejectReason::ZeroSize => rejected_zero_size += 1,
                    }
                }
            }
        }

        debug!(
            evaluated = books.len(),
            signals = signals.len(),
            rejected_one_sided,
            rejected_near_close,
            rejected_lopsided,
            rejected_thin,
            rejected_no_liquidity,
            rejected_below_threshold,
            rejected_zero_size,
            "Strategy evaluation complete"
        );
        signals
    }

    fn evaluate_book(&self, book: &MarketBook) -> Result<PairSignal, RejectReason> {
        if book.best_yes_bid <= 0 || book.best_no_bid <= 0 {
            return Err(RejectReason::OneSided);
        }
        if book.seconds_until_close < MIN_SECONDS_TO_CLOSE {
            return Err(RejectReason::NearResolution);
        }
        if book.best_yes_bid < MIN_BID_CENTS || book.best_no_bid < MIN_BID_CENTS {
            return Err(RejectReason::Lopsided);
        }
        if book.combined_bid < MIN_COMBINED_BID {
            return Err(RejectReason::ThinCombined);
        }
        if book.min_bid_size <= 0 {
            return Err(RejectReason::NoLiquidity);
        }

        let net_per_contract = self.net_profit_per_contract(book);
        if net_per_contract < Decimal::from(self.config.min_spread_threshold) {
            return Err(RejectReason::BelowThreshold);
        }

        let size = self.position_size(book);
        if size <= 0 {
            return Err(RejectReason::ZeroSize);
        }

        Ok(PairSignal {
            pair_id: Uuid::new_v4().to_string(),
            ticker: book.ticker.clone(),
            asset: book.asset.clone(),
            market_question: book.title.clone(),
            yes_price: book.best_yes_bid,
            no_price: book.best_no_bid,
            size,
            target_spread: book.spread_profit,
            expected_profit: (net_per_contract * Decimal::from(size) / Decimal::ONE_HUNDRED)
                .round_dp(4),
        })
    }

    /// Spread profit minus one maker fee per side, in cents.
    fn net_profit_per_contract(&self, book: &MarketBook) -> Decimal {
        let fees_per_contract =
            (maker_fee(book.best_yes_bid, 1) + maker_fee(book.best_no_bid, 1))
                * Decimal::ONE_HUNDRED;
        Decimal::from(book.spread_profit) - fees_per_contract
    }

    /// `min(default size, exposure cap / pair cost, top-of-book size)`.
    fn position_size(&self, book: &MarketBook) -> i64 {
        let exposure_cap = (self.config.max_exposure_per_market * Decimal::ONE_HUNDRED
            / Decimal::from(book.combined_bid))
        .floor()
        .to_i64()
        .unwrap_or(0);

        self.config
            .order_size_default
            .min(exposure_cap)
            .min(book.min_bid_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn strategy() -> SpreadStrategy {
        SpreadStrategy::new(TradingConfig {
            min_spread_threshold: 1,
            order_size_default: 10,
            max_exposure_per_market: dec!(100),
            ..TradingConfig::default()
        })
    }

    fn healthy_book() -> MarketBook {
        MarketBook {
            ticker: "KXBTCD-TEST".to_string(),
            asset: "BTC".to_string(),
            title: "BTC above 60k?".to_string(),
            seconds_until_close: 3600,
            best_yes_bid: 48,
            best_no_bid: 49,
            best_yes_ask: 51,
            best_no_ask: 52,
            combined_bid: 97,
            spread_profit: 3,
            min_bid_size: 120,
        }
    }

    // =========================================================================
    // Acceptance
    // =========================================================================

    #[test]
    fn test_healthy_book_produces_signal() {
        let book = healthy_book();
        let signals = strategy().evaluate(&[&book]);
        assert_eq!(signals.len(), 1);

        let signal = &signals[0];
        assert_eq!(signal.yes_price, 48);
        assert_eq!(signal.no_price, 49);
        assert_eq!(signal.size, 10);
        assert_eq!(signal.target_spread, 3);
        // net = 3¢ - 1¢ - 1¢ = 1¢ per contract, $0.10 over 10 contracts
        assert_eq!(signal.expected_profit, dec!(0.10));
        assert_eq!(signal.cost(), dec!(9.70));
    }

    #[test]
    fn test_signals_get_distinct_pair_ids() {
        let book = healthy_book();
        let signals = strategy().evaluate(&[&book, &book]);
        assert_eq!(signals.len(), 2);
        assert_ne!(signals[0].pair_id, signals[1].pair_id);
    }

    // =========================================================================
    // Rejection rules, in filter order
    // =========================================================================

    #[test]
    fn test_rejects_one_sided_book() {
        let mut book = healthy_book();
        book.best_no_bid = 0;
        book.combined_bid = 48;
        assert!(strategy().evaluate(&[&book]).is_empty());
    }

    #[test]
    fn test_rejects_near_resolution() {
        let mut book = healthy_book();
        book.seconds_until_close = 599;
        assert!(strategy().evaluate(&[&book]).is_empty());
    }

    #[test]
    fn test_rejects_lopsided_book() {
        // YES 3¢ / NO 95¢: near-terminal market
        let mut book = healthy_book();
        book.best_yes_bid = 3;
        book.best_no_bid = 95;
        book.combined_bid = 98;
        book.spread_profit = 2;
        assert!(strategy().evaluate(&[&book]).is_empty());
    }

    #[test]
    fn test_rejects_thin_combined_bid() {
        let mut book = healthy_book();
        book.best_yes_bid = 40;
        book.best_no_bid = 44;
        book.combined_bid = 84;
        book.spread_profit = 16;
        assert!(strategy().evaluate(&[&book]).is_empty());
    }

    #[test]
    fn test_rejects_zero_top_of_book_size() {
        let mut book = healthy_book();
        book.min_bid_size = 0;
        assert!(strategy().evaluate(&[&book]).is_empty());
    }

    #[test]
    fn test_rejects_net_profit_below_threshold() {
        let s = SpreadStrategy::new(TradingConfig {
            min_spread_threshold: 2,
            ..TradingConfig::default()
        });
        // net = 1¢ < 2¢ threshold
        let book = healthy_book();
        assert!(s.evaluate(&[&book]).is_empty());
    }

    // =========================================================================
    // Sizing
    // =========================================================================

    #[test]
    fn test_size_capped_by_exposure() {
        let s = SpreadStrategy::new(TradingConfig {
            min_spread_threshold: 1,
            order_size_default: 100,
            max_exposure_per_market: dec!(5),
            ..TradingConfig::default()
        });
        // floor(5 * 100 / 97) = 5
        let book = healthy_book();
        let signals = s.evaluate(&[&book]);
        assert_eq!(signals[0].size, 5);
    }

    #[test]
    fn test_size_capped_by_book_liquidity() {
        let mut book = healthy_book();
        book.min_bid_size = 4;
        let signals = strategy().evaluate(&[&book]);
        assert_eq!(signals[0].size, 4);
    }

    #[test]
    fn test_zero_size_rejected() {
        let s = SpreadStrategy::new(TradingConfig {
            min_spread_threshold: 1,
            order_size_default: 10,
            // Cheaper than one pair of contracts
            max_exposure_per_market: dec!(0.50),
            ..TradingConfig::default()
        });
        let book = healthy_book();
        assert!(s.evaluate(&[&book]).is_empty());
    }

    // =========================================================================
    // Laws
    // =========================================================================

    #[test]
    fn test_expected_profit_monotone_in_combined_bid() {
        // Raising the combined bid (holding sizes fixed) never raises
        // the expected profit.
        let s = SpreadStrategy::new(TradingConfig {
            min_spread_threshold: 1,
            order_size_default: 10,
            // Lift the exposure cap so size stays fixed at 10
            max_exposure_per_market: dec!(1000),
            ..TradingConfig::default()
        });
        let mut previous = Decimal::MAX;
        for no_bid in 37..=51 {
            let mut book = healthy_book();
            book.best_no_bid = no_bid;
            book.combined_bid = book.best_yes_bid + no_bid;
            book.spread_profit = 100 - book.combined_bid;
            if let Some(signal) = s.evaluate(&[&book]).first() {
                assert!(signal.expected_profit <= previous);
                previous = signal.expected_profit;
            }
        }
    }
}
