//! The trading cycle driver.
//!
//! One cycle runs scan -> fetch -> manage -> evaluate -> place, in that
//! order, so every open pair is reconciled against fresh books before
//! any new pair is created. The engine is a single task; the only
//! concurrency is the bounded fan-out inside the book fetcher.

use anyhow::{Context, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::exchange::ExchangeApi;
use crate::persistence::{Ledger, Order, OrderStatus, Pair, PairStatus, PnlRecord, Side};
use crate::risk::{CapitalBook, PositionManager, PositionSettings};
use crate::strategy::{
    BookFetcher, Contract, MarketBook, MarketScanner, PairExecutor, PairSignal, SpreadStrategy,
};
use crate::utils::fees::maker_fee;

/// Shutdown-flag polling granularity during the inter-cycle sleep.
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);
/// Cycles between summary log lines.
const SUMMARY_EVERY: u64 = 10;

/// Owns every component and drives the main loop.
pub struct TradingEngine {
    config: Config,
    exchange: Arc<dyn ExchangeApi>,
    ledger: Arc<Ledger>,
    capital: CapitalBook,
    scanner: MarketScanner,
    fetcher: BookFetcher,
    strategy: SpreadStrategy,
    executor: PairExecutor,
    manager: PositionManager,
    shutdown: Arc<AtomicBool>,
    trading_enabled: bool,
    cycle_count: u64,
}

impl TradingEngine {
    pub fn new(
        config: Config,
        exchange: Arc<dyn ExchangeApi>,
        ledger: Arc<Ledger>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self::with_rng(config, exchange, ledger, shutdown, StdRng::from_entropy())
    }

    /// Like [`TradingEngine::new`] but with a caller-supplied RNG for
    /// the paper-fill simulation, so tests are reproducible.
    pub fn with_rng(
        config: Config,
        exchange: Arc<dyn ExchangeApi>,
        ledger: Arc<Ledger>,
        shutdown: Arc<AtomicBool>,
        rng: StdRng,
    ) -> Self {
        let capital = CapitalBook::new(config.risk.max_total_exposure);
        let scanner = MarketScanner::new(config.scanning.clone());
        let strategy = SpreadStrategy::new(config.trading.clone());
        let executor = PairExecutor::new(
            exchange.clone(),
            ledger.clone(),
            config.trading.paper_trade,
        );
        let manager = PositionManager::new(PositionSettings::from_config(&config), rng);
        let trading_enabled = config.trading.trading_enabled;

        Self {
            config,
            exchange,
            ledger,
            capital,
            scanner,
            fetcher: BookFetcher::new(),
            strategy,
            executor,
            manager,
            shutdown,
            trading_enabled,
            cycle_count: 0,
        }
    }

    /// Recover, then cycle until shutdown or a fatal error. Open legs
    /// are swept on the way out either way.
    pub async fn run(&mut self) -> Result<()> {
        self.recover().await.context("state recovery")?;

        let result = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, finishing up");
                break Ok(());
            }
            if let Err(e) = self.cycle().await {
                self.trading_enabled = false;
                error!(error = %e, "Cycle failed, disabling trading and shutting down");
                break Err(e);
            }
            self.sleep_between_cycles().await;
        };

        let cancelled = self.executor.cancel_all_open().await;
        let _ = self.ledger.append_event(
            "engine_stopped",
            json!({ "cancelled_legs": cancelled, "clean": result.is_ok() }),
        );
        info!(cancelled, "Engine stopped");
        result
    }

    /// Discard in-flight state from prior runs. Every formerly-open leg
    /// ends CANCELLED and no pair stays OPEN; pairs that already carry
    /// fills keep their realized outcome instead of losing it.
    async fn recover(&mut self) -> Result<()> {
        let open_pairs = self.ledger.open_pairs()?;
        if open_pairs.is_empty() {
            info!("No open pairs to recover");
            return Ok(());
        }
        info!(count = open_pairs.len(), "Recovering open pairs from previous run");

        for pair in open_pairs {
            let legs = self.ledger.orders_for_pair(&pair.pair_id)?;

            // Rebuild the allocation this pair held, then settle it.
            let cost: Decimal = legs
                .iter()
                .map(|leg| Decimal::from(leg.price * leg.size))
                .sum::<Decimal>()
                / Decimal::ONE_HUNDRED;
            if let Err(e) = self.capital.allocate(&pair.pair_id, cost) {
                warn!(pair_id = %pair.pair_id, error = %e, "Could not rebuild allocation");
            }

            for leg in legs.iter().filter(|leg| leg.status == OrderStatus::Open) {
                if let Err(e) = self.executor.cancel_order(leg).await {
                    warn!(order_id = %leg.order_id, error = %e, "Recovery cancel failed");
                }
            }

            let filled: Vec<&Order> = legs
                .iter()
                .filter(|leg| leg.status == OrderStatus::Filled)
                .collect();
            match filled.as_slice() {
                [] => self.recover_cancelled(&pair)?,
                [leg] => self.recover_one_sided(&pair, leg)?,
                both => self.recover_completed(&pair, both)?,
            }
        }

        info!(
            open_after = self.ledger.count_pairs_by_status(PairStatus::Open)?,
            available = %self.capital.available(),
            "Recovery complete"
        );
        Ok(())
    }

    fn recover_cancelled(&mut self, pair: &Pair) -> Result<()> {
        self.ledger
            .update_pair_status(&pair.pair_id, PairStatus::Cancelled)?;
        if let Err(e) = self.capital.release(&pair.pair_id, Decimal::ZERO) {
            warn!(pair_id = %pair.pair_id, error = %e, "Release failed during recovery");
        }
        self.ledger.append_event(
            "recovery",
            json!({ "pair_id": pair.pair_id, "outcome": "cancelled" }),
        )?;
        info!(pair_id = %pair.pair_id, ticker = %pair.ticker, "Recovered pair cancelled");
        Ok(())
    }

    /// One leg had filled before the crash: same accounting as the live
    /// one-sided path, so the exposure is not silently dropped.
    fn recover_one_sided(&mut self, pair: &Pair, filled: &Order) -> Result<()> {
        self.ledger
            .update_pair_status(&pair.pair_id, PairStatus::Partial)?;
        let exposure = Decimal::from(filled.price * filled.size) / Decimal::ONE_HUNDRED;
        if let Err(e) = self.capital.release(&pair.pair_id, -exposure) {
            warn!(pair_id = %pair.pair_id, error = %e, "Release failed during recovery");
        }
        self.ledger.append_event(
            "recovery",
            json!({
                "pair_id": pair.pair_id,
                "outcome": "one_sided",
                "filled_side": filled.side.as_str(),
                "exposure": exposure.to_string(),
            }),
        )?;
        warn!(
            pair_id = %pair.pair_id,
            ticker = %pair.ticker,
            filled_side = %filled.side,
            %exposure,
            "Recovered pair had a filled leg, booked as one-sided loss"
        );
        Ok(())
    }

    /// Both legs had filled before the crash: the spread was realized,
    /// only the bookkeeping is missing.
    fn recover_completed(&mut self, pair: &Pair, filled: &[&Order]) -> Result<()> {
        let (yes, no) = match filled {
            [a, b] if a.side != b.side => {
                if a.side == Side::Yes {
                    (*a, *b)
                } else {
                    (*b, *a)
                }
            }
            _ => {
                warn!(pair_id = %pair.pair_id, "Unrecoverable leg combination");
                self.ledger.append_event(
                    "broken_invariant",
                    json!({ "pair_id": pair.pair_id, "context": "recovery" }),
                )?;
                return Ok(());
            }
        };

        self.ledger
            .update_pair_status(&pair.pair_id, PairStatus::Filled)?;
        let fees = maker_fee(yes.price, yes.size) + maker_fee(no.price, no.size);
        let gross = Decimal::from((100 - yes.price - no.price) * yes.size) / Decimal::ONE_HUNDRED;
        let net_pnl = gross - fees;
        self.ledger.append_pnl(&PnlRecord {
            pair_id: pair.pair_id.clone(),
            ticker: pair.ticker.clone(),
            yes_fill_price: yes.price,
            no_fill_price: no.price,
            size: yes.size,
            combined_cost: Decimal::from((yes.price + no.price) * yes.size)
                / Decimal::ONE_HUNDRED,
            gross_profit: gross,
            fees,
            realized_pnl: net_pnl,
            timestamp: Utc::now(),
        })?;
        if let Err(e) = self.capital.release(&pair.pair_id, net_pnl) {
            warn!(pair_id = %pair.pair_id, error = %e, "Release failed during recovery");
        }
        self.ledger.append_event(
            "recovery",
            json!({
                "pair_id": pair.pair_id,
                "outcome": "completed",
                "realized_pnl": net_pnl.to_string(),
            }),
        )?;
        info!(pair_id = %pair.pair_id, net = %net_pnl, "Recovered pair completed");
        Ok(())
    }

    /// One scan -> fetch -> manage -> place pass.
    async fn cycle(&mut self) -> Result<()> {
        self.cycle_count += 1;

        let mut contracts = self.scanner.scan(self.exchange.as_ref()).await;
        if contracts.is_empty() {
            debug!("No eligible contracts this cycle");
            return Ok(());
        }
        contracts.sort_by_key(|contract| contract.seconds_until_close);

        // One contract per asset (the nearest), plus whatever backs an
        // open pair.
        let mut nearest_tickers = Vec::new();
        let mut fetch_set: HashMap<String, Contract> = HashMap::new();
        let mut assets_seen = HashSet::new();
        for contract in &contracts {
            if assets_seen.insert(contract.asset.clone()) {
                nearest_tickers.push(contract.ticker.clone());
                fetch_set.insert(contract.ticker.clone(), contract.clone());
            }
        }
        for pair in self.ledger.open_pairs()? {
            if fetch_set.contains_key(&pair.ticker) {
                continue;
            }
            let backing = contracts
                .iter()
                .find(|contract| contract.ticker == pair.ticker)
                .cloned()
                .or_else(|| self.scanner.cached(&pair.ticker));
            match backing {
                Some(contract) => {
                    fetch_set.insert(pair.ticker.clone(), contract);
                }
                None => warn!(
                    ticker = %pair.ticker,
                    pair_id = %pair.pair_id,
                    "No contract info for open pair; its book will be missing this cycle"
                ),
            }
        }

        let fetch_list: Vec<Contract> = fetch_set.into_values().collect();
        let books = self.fetcher.fetch_all(self.exchange.as_ref(), &fetch_list).await;

        self.manager
            .check_pairs(&self.ledger, &mut self.capital, &self.executor, &books)
            .await?;

        if self.trading_enabled && self.config.trading.trading_enabled && !self.manager.halted() {
            let candidates: Vec<&MarketBook> = nearest_tickers
                .iter()
                .filter_map(|ticker| books.get(ticker))
                .collect();
            let signals = self.strategy.evaluate(&candidates);
            for signal in signals {
                self.try_place(signal).await;
            }
        }

        if self.cycle_count % SUMMARY_EVERY == 1 {
            self.log_summary();
        }
        Ok(())
    }

    /// Allocate and place one signal, re-checking the one-pair-per-ticker
    /// rule against the ledger as it stands right now.
    async fn try_place(&mut self, signal: PairSignal) {
        let open_tickers: HashSet<String> = match self.ledger.open_pairs() {
            Ok(pairs) => pairs.into_iter().map(|pair| pair.ticker).collect(),
            Err(e) => {
                warn!(error = %e, "Could not list open pairs, skipping placement");
                return;
            }
        };
        if open_tickers.contains(&signal.ticker) {
            debug!(ticker = %signal.ticker, "Ticker already backs an open pair, skipping");
            return;
        }

        let cost = signal.cost();
        if !self.capital.can_allocate(cost) {
            debug!(
                ticker = %signal.ticker,
                %cost,
                available = %self.capital.available(),
                "Insufficient capital for signal"
            );
            return;
        }
        if let Err(e) = self.capital.allocate(&signal.pair_id, cost) {
            warn!(pair_id = %signal.pair_id, error = %e, "Allocation failed");
            return;
        }

        match self.executor.place_pair(&signal).await {
            Ok(true) => {
                info!(
                    pair_id = %signal.pair_id,
                    ticker = %signal.ticker,
                    expected_profit = %signal.expected_profit,
                    %cost,
                    "Pair placed"
                );
            }
            Ok(false) => {
                // The executor already marked the pair CANCELLED.
                if let Err(e) = self.capital.release(&signal.pair_id, Decimal::ZERO) {
                    warn!(pair_id = %signal.pair_id, error = %e, "Release after failed placement");
                }
            }
            Err(e) => {
                warn!(pair_id = %signal.pair_id, error = %e, "Placement error");
                if let Err(release_err) = self.capital.release(&signal.pair_id, Decimal::ZERO) {
                    warn!(pair_id = %signal.pair_id, error = %release_err, "Release after placement error");
                }
            }
        }
    }

    async fn sleep_between_cycles(&self) {
        let total = Duration::from_secs(self.config.scanning.scan_interval_seconds);
        let mut slept = Duration::ZERO;
        while slept < total {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let step = SHUTDOWN_POLL.min(total - slept);
            tokio::time::sleep(step).await;
            slept += step;
        }
    }

    fn log_summary(&self) {
        let capital = self.capital.summary();
        match self.ledger.pnl_summary() {
            Ok(pnl) => info!(
                cycle = self.cycle_count,
                available = %capital.available,
                deployed = %capital.deployed,
                open_pairs = capital.open_pairs,
                completed_pairs = pnl.pair_count,
                realized_pnl = %pnl.realized_total,
                fees_paid = %pnl.fees_total,
                halted = self.manager.halted(),
                "Engine summary"
            ),
            Err(e) => warn!(error = %e, "Could not read PnL summary"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Market, MockExchange, Orderbook};
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.kalshi.api_key = "test".to_string();
        config.trading.min_spread_threshold = 1;
        config.scanning.assets = vec!["BTC".to_string()];
        config
    }

    fn engine_with(config: Config, exchange: Arc<MockExchange>) -> (TradingEngine, Arc<Ledger>) {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let engine = TradingEngine::with_rng(
            config,
            exchange,
            ledger.clone(),
            Arc::new(AtomicBool::new(false)),
            StdRng::seed_from_u64(42),
        );
        (engine, ledger)
    }

    fn market(ticker: &str, closes_in_secs: i64) -> Market {
        Market {
            ticker: ticker.to_string(),
            event_ticker: String::new(),
            title: "BTC above 60k?".to_string(),
            yes_bid: 48,
            yes_ask: 52,
            no_bid: 49,
            no_ask: 51,
            last_price: 50,
            volume: 1000,
            open_interest: 500,
            status: "open".to_string(),
            close_time: (Utc::now() + ChronoDuration::seconds(closes_in_secs)).to_rfc3339(),
            expiration_time: None,
            result: None,
        }
    }

    fn two_sided_book() -> Orderbook {
        Orderbook {
            yes: Some(vec![[48, 120]]),
            no: Some(vec![[49, 120]]),
        }
    }

    fn seed_pair(ledger: &Ledger, pair_id: &str, ticker: &str) {
        ledger
            .insert_pair(&Pair {
                pair_id: pair_id.to_string(),
                ticker: ticker.to_string(),
                asset: "BTC".to_string(),
                target_spread: 3,
                status: PairStatus::Open,
                created_at: Utc::now(),
                market_question: "?".to_string(),
            })
            .unwrap();
        for (side, price) in [(Side::Yes, 48), (Side::No, 49)] {
            ledger
                .insert_order(&Order {
                    order_id: Uuid::new_v4().to_string(),
                    pair_id: pair_id.to_string(),
                    ticker: ticker.to_string(),
                    side,
                    price,
                    size: 10,
                    status: OrderStatus::Open,
                    exchange_order_id: None,
                    filled_size: 0,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    #[tokio::test]
    async fn test_recovery_cancels_unfilled_pair() {
        let exchange = Arc::new(MockExchange::new());
        let (mut engine, ledger) = engine_with(test_config(), exchange);
        seed_pair(&ledger, "p1", "T1");

        engine.recover().await.unwrap();

        assert_eq!(ledger.count_pairs_by_status(PairStatus::Open).unwrap(), 0);
        assert_eq!(
            ledger.count_pairs_by_status(PairStatus::Cancelled).unwrap(),
            1
        );
        assert!(ledger.open_orders().unwrap().is_empty());
        // Allocation rebuilt then released at zero PnL
        assert_eq!(engine.capital.available(), dec!(1000));
    }

    #[tokio::test]
    async fn test_recovery_books_filled_leg_as_loss() {
        let exchange = Arc::new(MockExchange::new());
        let (mut engine, ledger) = engine_with(test_config(), exchange);
        seed_pair(&ledger, "p1", "T1");

        // The NO leg filled before the crash
        let legs = ledger.orders_for_pair("p1").unwrap();
        let no = legs.iter().find(|o| o.side == Side::No).unwrap();
        ledger
            .update_order_status(&no.order_id, OrderStatus::Filled, Some(10))
            .unwrap();

        engine.recover().await.unwrap();

        assert_eq!(ledger.count_pairs_by_status(PairStatus::Open).unwrap(), 0);
        assert_eq!(
            ledger.count_pairs_by_status(PairStatus::Partial).unwrap(),
            1
        );
        let legs = ledger.orders_for_pair("p1").unwrap();
        let yes = legs.iter().find(|o| o.side == Side::Yes).unwrap();
        assert_eq!(yes.status, OrderStatus::Cancelled);

        // 49 * 10 / 100 = 4.90 booked as loss
        assert_eq!(engine.capital.available(), dec!(995.10));
    }

    #[tokio::test]
    async fn test_recovery_completes_fully_filled_pair() {
        let exchange = Arc::new(MockExchange::new());
        let (mut engine, ledger) = engine_with(test_config(), exchange);
        seed_pair(&ledger, "p1", "T1");

        for order in ledger.orders_for_pair("p1").unwrap() {
            ledger
                .update_order_status(&order.order_id, OrderStatus::Filled, Some(10))
                .unwrap();
        }

        engine.recover().await.unwrap();

        assert_eq!(ledger.count_pairs_by_status(PairStatus::Filled).unwrap(), 1);
        let pnl = ledger.recent_pnl(1).unwrap();
        assert_eq!(pnl[0].realized_pnl, dec!(0.20));
        assert_eq!(engine.capital.available(), dec!(1000.20));
    }

    // =========================================================================
    // Cycle behavior
    // =========================================================================

    #[tokio::test]
    async fn test_cycle_places_pair_for_healthy_market() {
        let exchange = Arc::new(MockExchange::new());
        exchange
            .set_markets("KXBTCD", vec![market("KXBTCD-X", 3600)])
            .await;
        exchange.set_book("KXBTCD-X", two_sided_book()).await;

        let (mut engine, ledger) = engine_with(test_config(), exchange);
        engine.cycle().await.unwrap();

        let open = ledger.open_pairs().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].ticker, "KXBTCD-X");
        // Cost 9.70 deployed
        assert_eq!(engine.capital.summary().deployed, dec!(9.70));
    }

    #[tokio::test]
    async fn test_duplicate_ticker_guard() {
        let exchange = Arc::new(MockExchange::new());
        exchange
            .set_markets("KXBTCD", vec![market("KXBTCD-X", 3600)])
            .await;
        exchange.set_book("KXBTCD-X", two_sided_book()).await;

        // Live mode so no fills are simulated and the pair stays OPEN
        let mut config = test_config();
        config.trading.paper_trade = false;
        let (mut engine, ledger) = engine_with(config, exchange);

        engine.cycle().await.unwrap();
        assert_eq!(ledger.open_pairs().unwrap().len(), 1);

        // Same market next cycle: the open pair blocks a second one
        engine.cycle().await.unwrap();
        assert_eq!(ledger.recent_pairs(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_scan_is_a_quiet_cycle() {
        let exchange = Arc::new(MockExchange::new());
        let (mut engine, ledger) = engine_with(test_config(), exchange);
        engine.cycle().await.unwrap();
        assert!(ledger.open_pairs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trading_disabled_blocks_placements() {
        let exchange = Arc::new(MockExchange::new());
        exchange
            .set_markets("KXBTCD", vec![market("KXBTCD-X", 3600)])
            .await;
        exchange.set_book("KXBTCD-X", two_sided_book()).await;

        let mut config = test_config();
        config.trading.trading_enabled = false;
        let (mut engine, ledger) = engine_with(config, exchange);

        engine.cycle().await.unwrap();
        assert!(ledger.open_pairs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_capital_blocks_placement() {
        let exchange = Arc::new(MockExchange::new());
        exchange
            .set_markets("KXBTCD", vec![market("KXBTCD-X", 3600)])
            .await;
        exchange.set_book("KXBTCD-X", two_sided_book()).await;

        let mut config = test_config();
        // Signal size floor(5 * 100 / 97) = 5 costs 4.85, but only $3
        // of capital exists
        config.trading.max_exposure_per_market = dec!(5);
        config.risk.max_total_exposure = dec!(3);
        let (mut engine, ledger) = engine_with(config, exchange);

        engine.cycle().await.unwrap();
        assert!(ledger.open_pairs().unwrap().is_empty());
        assert_eq!(engine.capital.available(), dec!(3));
    }
}
