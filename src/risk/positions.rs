//! The pair state machine.
//!
//! Drives every OPEN pair toward a terminal state each cycle: completes
//! pairs whose legs both filled, force-cancels pairs near resolution,
//! cuts one-sided fills after the timeout, and halts trading after too
//! many consecutive one-sided outcomes. In paper mode it also simulates
//! fills against the current book before classifying the pair.

use anyhow::{anyhow, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::persistence::{
    Ledger, Order, OrderStatus, Pair, PairStatus, PnlRecord, Side,
};
use crate::strategy::{MarketBook, PairExecutor};
use crate::utils::fees::maker_fee;

use super::capital::CapitalBook;

/// The subset of configuration the state machine needs.
#[derive(Debug, Clone)]
pub struct PositionSettings {
    pub paper: bool,
    pub pair_timeout_seconds: i64,
    pub cancel_deadline_seconds: i64,
    pub max_one_sided_fills_before_halt: u32,
}

impl PositionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            paper: config.trading.paper_trade,
            pair_timeout_seconds: config.trading.pair_timeout_seconds,
            cancel_deadline_seconds: config.risk.cancel_deadline_seconds,
            max_one_sided_fills_before_halt: config.risk.max_one_sided_fills_before_halt,
        }
    }
}

/// A pair's two legs, reconstituted from the ledger. Constructing one
/// proves the two-leg invariant held for this pair.
#[derive(Debug, Clone)]
struct LegPair {
    yes: Order,
    no: Order,
}

impl LegPair {
    /// Exactly one YES and one NO leg of equal size, or nothing.
    fn from_rows(mut rows: Vec<Order>) -> Option<Self> {
        if rows.len() != 2 {
            return None;
        }
        let second = rows.pop()?;
        let first = rows.pop()?;
        let (yes, no) = match (first.side, second.side) {
            (Side::Yes, Side::No) => (first, second),
            (Side::No, Side::Yes) => (second, first),
            _ => return None,
        };
        if yes.size != no.size {
            return None;
        }
        Some(Self { yes, no })
    }

    fn phase(&self) -> PairPhase {
        match (self.yes.status, self.no.status) {
            (OrderStatus::Filled, OrderStatus::Filled) => PairPhase::BothFilled,
            (OrderStatus::Filled, _) => PairPhase::OneSided { filled: Side::Yes },
            (_, OrderStatus::Filled) => PairPhase::OneSided { filled: Side::No },
            _ => PairPhase::BothOpen,
        }
    }

    fn leg(&self, side: Side) -> &Order {
        match side {
            Side::Yes => &self.yes,
            Side::No => &self.no,
        }
    }

    fn open_legs(&self) -> impl Iterator<Item = &Order> {
        [&self.yes, &self.no]
            .into_iter()
            .filter(|leg| leg.status == OrderStatus::Open)
    }
}

/// Fill state of a pair, with illegal combinations ruled out up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairPhase {
    BothOpen,
    OneSided { filled: Side },
    BothFilled,
}

/// Per-leg fill probability for the paper simulation.
///
/// An ask at or through our resting price fills immediately. A price at
/// or above the best bid rests at the front and fills with a probability
/// that decays as the quoted spread widens. A derived ask of 100 means
/// the opposing side has no bids, i.e. the ask is unknown.
fn fill_probability(leg_price: i64, best_bid: i64, best_ask: i64) -> f64 {
    let known_ask = (best_ask > 0 && best_ask < 100).then_some(best_ask);

    if let Some(ask) = known_ask {
        if ask <= leg_price {
            return 1.0;
        }
    }
    if best_bid > 0 && leg_price >= best_bid {
        let spread = known_ask.map(|ask| ask - best_bid).unwrap_or(10);
        return match spread {
            i64::MIN..=2 => 0.35,
            3..=5 => 0.25,
            _ => 0.15,
        };
    }
    0.0
}

/// Drives open pairs through their lifecycle.
pub struct PositionManager {
    settings: PositionSettings,
    rng: StdRng,
    consecutive_one_sided: u32,
    halted: bool,
}

impl PositionManager {
    /// The RNG feeds the paper-fill simulation; tests pass a seeded one.
    pub fn new(settings: PositionSettings, rng: StdRng) -> Self {
        Self {
            settings,
            rng,
            consecutive_one_sided: 0,
            halted: false,
        }
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn consecutive_one_sided(&self) -> u32 {
        self.consecutive_one_sided
    }

    /// Advance every OPEN pair one step. Per-pair failures are recorded
    /// as events and the pair is left for the next cycle.
    pub async fn check_pairs(
        &mut self,
        ledger: &Ledger,
        capital: &mut CapitalBook,
        executor: &PairExecutor,
        books: &HashMap<String, MarketBook>,
    ) -> Result<()> {
        if self.halted {
            return Ok(());
        }

        for pair in ledger.open_pairs()? {
            if self.halted {
                break;
            }
            if let Err(e) = self
                .check_pair(ledger, capital, executor, &pair, books.get(&pair.ticker))
                .await
            {
                warn!(pair_id = %pair.pair_id, error = %e, "Pair check failed, leaving for next cycle");
                let _ = ledger.append_event(
                    "pair_error",
                    json!({ "pair_id": pair.pair_id, "error": e.to_string() }),
                );
            }
        }
        Ok(())
    }

    async fn check_pair(
        &mut self,
        ledger: &Ledger,
        capital: &mut CapitalBook,
        executor: &PairExecutor,
        pair: &Pair,
        book: Option<&MarketBook>,
    ) -> Result<()> {
        let Some(mut legs) = LegPair::from_rows(ledger.orders_for_pair(&pair.pair_id)?) else {
            warn!(pair_id = %pair.pair_id, "Pair does not have exactly one YES and one NO leg");
            ledger.append_event(
                "broken_invariant",
                json!({ "pair_id": pair.pair_id, "ticker": pair.ticker }),
            )?;
            return Ok(());
        };

        if self.settings.paper {
            if let Some(book) = book {
                self.simulate_fills(ledger, &legs, book)?;
                legs = LegPair::from_rows(ledger.orders_for_pair(&pair.pair_id)?)
                    .ok_or_else(|| anyhow!("legs vanished during simulation"))?;
            }
        }

        let phase = legs.phase();

        if phase == PairPhase::BothFilled {
            return self.complete_pair(ledger, capital, pair, &legs);
        }

        if let Some(book) = book {
            if book.seconds_until_close <= self.settings.cancel_deadline_seconds {
                return match phase {
                    // Sunk exposure: the filled leg's cost is already
                    // spent, so book it as a one-sided loss rather
                    // than a zero-PnL cancel.
                    PairPhase::OneSided { filled } => {
                        self.handle_one_sided(
                            ledger,
                            capital,
                            executor,
                            pair,
                            &legs,
                            filled,
                            "resolution_deadline",
                        )
                        .await
                    }
                    _ => {
                        self.cancel_pair(ledger, capital, executor, pair, &legs)
                            .await
                    }
                };
            }
        }

        if let PairPhase::OneSided { filled } = phase {
            let age = (Utc::now() - pair.created_at).num_seconds();
            if age >= self.settings.pair_timeout_seconds {
                return self
                    .handle_one_sided(ledger, capital, executor, pair, &legs, filled, "timeout")
                    .await;
            }
        }

        Ok(())
    }

    /// Draw a fill for each open leg against the current book.
    fn simulate_fills(&mut self, ledger: &Ledger, legs: &LegPair, book: &MarketBook) -> Result<()> {
        for leg in legs.open_legs() {
            let (best_bid, best_ask) = match leg.side {
                Side::Yes => (book.best_yes_bid, book.best_yes_ask),
                Side::No => (book.best_no_bid, book.best_no_ask),
            };
            let probability = fill_probability(leg.price, best_bid, best_ask);
            if probability <= 0.0 {
                continue;
            }
            if self.rng.gen::<f64>() < probability {
                ledger.update_order_status(&leg.order_id, OrderStatus::Filled, Some(leg.size))?;
                info!(
                    order_id = %leg.order_id,
                    ticker = %leg.ticker,
                    side = %leg.side,
                    price = leg.price,
                    size = leg.size,
                    "Paper fill"
                );
                ledger.append_event(
                    "paper_fill",
                    json!({
                        "order_id": leg.order_id,
                        "pair_id": leg.pair_id,
                        "side": leg.side.as_str(),
                        "price": leg.price,
                        "size": leg.size,
                    }),
                )?;
            }
        }
        Ok(())
    }

    /// Both legs filled: book the realized spread.
    fn complete_pair(
        &mut self,
        ledger: &Ledger,
        capital: &mut CapitalBook,
        pair: &Pair,
        legs: &LegPair,
    ) -> Result<()> {
        let yes_price = legs.yes.price;
        let no_price = legs.no.price;
        let size = legs.yes.size;

        ledger.update_pair_status(&pair.pair_id, PairStatus::Filled)?;

        let fees = maker_fee(yes_price, size) + maker_fee(no_price, size);
        let gross =
            Decimal::from((100 - yes_price - no_price) * size) / Decimal::ONE_HUNDRED;
        let combined_cost = Decimal::from((yes_price + no_price) * size) / Decimal::ONE_HUNDRED;
        let net_pnl = gross - fees;

        ledger.append_pnl(&PnlRecord {
            pair_id: pair.pair_id.clone(),
            ticker: pair.ticker.clone(),
            yes_fill_price: yes_price,
            no_fill_price: no_price,
            size,
            combined_cost,
            gross_profit: gross,
            fees,
            realized_pnl: net_pnl,
            timestamp: Utc::now(),
        })?;
        ledger.append_event(
            "pair_complete",
            json!({
                "pair_id": pair.pair_id,
                "ticker": pair.ticker,
                "yes_price": yes_price,
                "no_price": no_price,
                "size": size,
                "realized_pnl": net_pnl.to_string(),
            }),
        )?;

        if let Err(e) = capital.release(&pair.pair_id, net_pnl) {
            warn!(pair_id = %pair.pair_id, error = %e, "No allocation to release on completion");
        }
        self.consecutive_one_sided = 0;

        info!(
            pair_id = %pair.pair_id,
            ticker = %pair.ticker,
            yes = yes_price,
            no = no_price,
            size,
            gross = %gross,
            fees = %fees,
            net = %net_pnl,
            "Pair complete"
        );
        Ok(())
    }

    /// Nothing filled by the deadline: walk away clean.
    async fn cancel_pair(
        &mut self,
        ledger: &Ledger,
        capital: &mut CapitalBook,
        executor: &PairExecutor,
        pair: &Pair,
        legs: &LegPair,
    ) -> Result<()> {
        for leg in legs.open_legs() {
            executor.cancel_order(leg).await?;
        }
        ledger.update_pair_status(&pair.pair_id, PairStatus::Cancelled)?;
        if let Err(e) = capital.release(&pair.pair_id, Decimal::ZERO) {
            warn!(pair_id = %pair.pair_id, error = %e, "No allocation to release on cancel");
        }
        ledger.append_event(
            "pair_cancelled",
            json!({
                "pair_id": pair.pair_id,
                "ticker": pair.ticker,
                "reason": "resolution_deadline",
            }),
        )?;
        info!(pair_id = %pair.pair_id, ticker = %pair.ticker, "Pair cancelled at resolution deadline");
        Ok(())
    }

    /// One leg filled, the other abandoned: cut the open leg, book the
    /// filled leg's full cost as loss, and count toward the halt.
    async fn handle_one_sided(
        &mut self,
        ledger: &Ledger,
        capital: &mut CapitalBook,
        executor: &PairExecutor,
        pair: &Pair,
        legs: &LegPair,
        filled: Side,
        reason: &str,
    ) -> Result<()> {
        for leg in legs.open_legs() {
            executor.cancel_order(leg).await?;
        }
        ledger.update_pair_status(&pair.pair_id, PairStatus::Partial)?;

        self.consecutive_one_sided += 1;

        let filled_leg = legs.leg(filled);
        // Worst-case resolution pays 0, so the whole cost is at risk.
        let exposure =
            Decimal::from(filled_leg.price * filled_leg.size) / Decimal::ONE_HUNDRED;
        if let Err(e) = capital.release(&pair.pair_id, -exposure) {
            warn!(pair_id = %pair.pair_id, error = %e, "No allocation to release on one-sided fill");
        }

        ledger.append_event(
            "one_sided_fill",
            json!({
                "pair_id": pair.pair_id,
                "ticker": pair.ticker,
                "filled_side": filled.as_str(),
                "price": filled_leg.price,
                "size": filled_leg.size,
                "exposure": exposure.to_string(),
                "reason": reason,
                "consecutive": self.consecutive_one_sided,
            }),
        )?;
        warn!(
            pair_id = %pair.pair_id,
            ticker = %pair.ticker,
            filled_side = %filled,
            %exposure,
            reason,
            consecutive = self.consecutive_one_sided,
            "One-sided fill"
        );

        if self.consecutive_one_sided >= self.settings.max_one_sided_fills_before_halt {
            self.halted = true;
            ledger.append_event(
                "trading_halted",
                json!({ "consecutive_one_sided": self.consecutive_one_sided }),
            )?;
            error!(
                consecutive = self.consecutive_one_sided,
                "Too many consecutive one-sided fills, halting trading"
            );
            executor.cancel_all_open().await;
        }
        Ok(())
    }
}
