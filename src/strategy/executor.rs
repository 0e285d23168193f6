//! Paired-quote placement and cancellation.
//!
//! In paper mode a pair exists only in the ledger; fills are simulated
//! by the position manager. In live mode the YES leg is submitted first,
//! and a NO-leg rejection unwinds the YES acknowledgement so the maker
//! is never knowingly one-sided at placement time.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::signals::PairSignal;
use crate::exchange::{CancelOutcome, ExchangeApi, OrderRequest};
use crate::persistence::{
    Ledger, LedgerError, Order, OrderStatus, Pair, PairStatus, Side,
};

/// Attempts per exchange cancel before giving up.
const CANCEL_ATTEMPTS: u32 = 3;
/// Pause between cancel attempts.
const CANCEL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Places and cancels pairs against the ledger and, in live mode, the
/// exchange.
pub struct PairExecutor {
    exchange: Arc<dyn ExchangeApi>,
    ledger: Arc<Ledger>,
    paper: bool,
}

impl PairExecutor {
    pub fn new(exchange: Arc<dyn ExchangeApi>, ledger: Arc<Ledger>, paper: bool) -> Self {
        Self {
            exchange,
            ledger,
            paper,
        }
    }

    fn leg_from_signal(signal: &PairSignal, side: Side) -> Order {
        let price = match side {
            Side::Yes => signal.yes_price,
            Side::No => signal.no_price,
        };
        Order {
            order_id: Uuid::new_v4().to_string(),
            pair_id: signal.pair_id.clone(),
            ticker: signal.ticker.clone(),
            side,
            price,
            size: signal.size,
            status: OrderStatus::Open,
            exchange_order_id: None,
            filled_size: 0,
            created_at: Utc::now(),
        }
    }

    /// Treat duplicate inserts as success; the row is already durable.
    fn tolerate_duplicate(result: Result<(), LedgerError>) -> Result<(), LedgerError> {
        match result {
            Err(LedgerError::Duplicate(id)) => {
                warn!(id, "Duplicate insert ignored");
                Ok(())
            }
            other => other,
        }
    }

    /// Place both legs of a pair. Returns false when a live placement
    /// was rejected and the pair ended CANCELLED.
    pub async fn place_pair(&self, signal: &PairSignal) -> Result<bool> {
        let pair = Pair {
            pair_id: signal.pair_id.clone(),
            ticker: signal.ticker.clone(),
            asset: signal.asset.clone(),
            target_spread: signal.target_spread,
            status: PairStatus::Open,
            created_at: Utc::now(),
            market_question: signal.market_question.clone(),
        };
        let yes_leg = Self::leg_from_signal(signal, Side::Yes);
        let no_leg = Self::leg_from_signal(signal, Side::No);

        match self.ledger.insert_pair(&pair) {
            Ok(()) => {}
            // Already durable from an earlier attempt, legs included;
            // re-placing would double up the pair.
            Err(LedgerError::Duplicate(_)) => {
                warn!(pair_id = %signal.pair_id, "Pair already recorded, skipping placement");
                return Ok(true);
            }
            Err(e) => return Err(e).context("insert pair"),
        }
        Self::tolerate_duplicate(self.ledger.insert_order(&yes_leg)).context("insert YES leg")?;
        Self::tolerate_duplicate(self.ledger.insert_order(&no_leg)).context("insert NO leg")?;

        if self.paper {
            info!(
                pair_id = %signal.pair_id,
                ticker = %signal.ticker,
                yes = signal.yes_price,
                no = signal.no_price,
                size = signal.size,
                "Paper pair recorded"
            );
            return Ok(true);
        }

        // Live: YES first, then NO; unwind YES if NO is rejected.
        let yes_request = OrderRequest::limit_buy(
            &signal.ticker,
            &yes_leg.order_id,
            Side::Yes,
            signal.yes_price,
            signal.size,
        );
        let yes_ack = match self.exchange.place_order(&yes_request).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(pair_id = %signal.pair_id, error = %e, "YES leg rejected");
                self.abandon_pair(signal, &yes_leg, &no_leg).await?;
                return Ok(false);
            }
        };
        self.ledger
            .set_exchange_order_id(&yes_leg.order_id, &yes_ack.order_id)?;

        let no_request = OrderRequest::limit_buy(
            &signal.ticker,
            &no_leg.order_id,
            Side::No,
            signal.no_price,
            signal.size,
        );
        match self.exchange.place_order(&no_request).await {
            Ok(no_ack) => {
                self.ledger
                    .set_exchange_order_id(&no_leg.order_id, &no_ack.order_id)?;
            }
            Err(e) => {
                warn!(pair_id = %signal.pair_id, error = %e, "NO leg rejected, unwinding YES");
                if let Err(cancel_err) = self.cancel_on_exchange(&yes_ack.order_id).await {
                    // The YES order may still be resting; recovery will
                    // sweep it on the next start.
                    error!(
                        pair_id = %signal.pair_id,
                        exchange_order_id = %yes_ack.order_id,
                        error = %cancel_err,
                        "Failed to unwind YES leg after NO rejection"
                    );
                }
                self.abandon_pair(signal, &yes_leg, &no_leg).await?;
                return Ok(false);
            }
        }

        info!(
            pair_id = %signal.pair_id,
            ticker = %signal.ticker,
            yes = signal.yes_price,
            no = signal.no_price,
            size = signal.size,
            "Pair placed"
        );
        Ok(true)
    }

    /// Mark a never-established pair CANCELLED in the ledger.
    async fn abandon_pair(
        &self,
        signal: &PairSignal,
        yes_leg: &Order,
        no_leg: &Order,
    ) -> Result<()> {
        self.ledger
            .update_order_status(&yes_leg.order_id, OrderStatus::Cancelled, None)?;
        self.ledger
            .update_order_status(&no_leg.order_id, OrderStatus::Cancelled, None)?;
        self.ledger
            .update_pair_status(&signal.pair_id, PairStatus::Cancelled)?;
        self.ledger.append_event(
            "pair_rejected",
            json!({ "pair_id": signal.pair_id, "ticker": signal.ticker }),
        )?;
        Ok(())
    }

    /// Cancel on the exchange with retry; a 404 means the order already
    /// no longer exists and counts as success.
    async fn cancel_on_exchange(&self, exchange_order_id: &str) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=CANCEL_ATTEMPTS {
            match self.exchange.cancel_order(exchange_order_id).await {
                Ok(CancelOutcome::Cancelled) => return Ok(()),
                Ok(CancelOutcome::AlreadyGone) => {
                    info!(exchange_order_id, "Order already gone at cancel");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        exchange_order_id,
                        attempt,
                        error = %e,
                        "Cancel attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < CANCEL_ATTEMPTS {
                        tokio::time::sleep(CANCEL_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_error.expect("at least one attempt ran").into())
    }

    /// Cancel one leg: on the exchange first (live mode, if it was ever
    /// acknowledged), then in the ledger.
    pub async fn cancel_order(&self, order: &Order) -> Result<()> {
        if !self.paper {
            if let Some(exchange_order_id) = &order.exchange_order_id {
                self.cancel_on_exchange(exchange_order_id).await?;
            }
        }
        self.ledger
            .update_order_status(&order.order_id, OrderStatus::Cancelled, None)?;
        info!(order_id = %order.order_id, ticker = %order.ticker, side = %order.side, "Leg cancelled");
        Ok(())
    }

    /// Cancel every leg the ledger still reports OPEN. Returns how many
    /// were cancelled; failures are logged and skipped.
    pub async fn cancel_all_open(&self) -> usize {
        let open = match self.ledger.open_orders() {
            Ok(orders) => orders,
            Err(e) => {
                error!(error = %e, "Failed to list open orders for cancel sweep");
                return 0;
            }
        };

        let mut cancelled = 0usize;
        for order in &open {
            match self.cancel_order(order).await {
                Ok(()) => cancelled += 1,
                Err(e) => {
                    error!(order_id = %order.order_id, error = %e, "Cancel failed during sweep")
                }
            }
        }
        if cancelled > 0 {
            info!(cancelled, "Open legs cancelled");
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;
    use rust_decimal_macros::dec;

    fn signal() -> PairSignal {
        PairSignal {
            pair_id: Uuid::new_v4().to_string(),
            ticker: "KXBTCD-TEST".to_string(),
            asset: "BTC".to_string(),
            market_question: "BTC above 60k?".to_string(),
            yes_price: 48,
            no_price: 49,
            size: 10,
            target_spread: 3,
            expected_profit: dec!(0.10),
        }
    }

    fn paper_executor() -> (PairExecutor, Arc<Ledger>, Arc<MockExchange>) {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let exchange = Arc::new(MockExchange::new());
        let executor = PairExecutor::new(exchange.clone(), ledger.clone(), true);
        (executor, ledger, exchange)
    }

    fn live_executor() -> (PairExecutor, Arc<Ledger>, Arc<MockExchange>) {
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let exchange = Arc::new(MockExchange::new());
        let executor = PairExecutor::new(exchange.clone(), ledger.clone(), false);
        (executor, ledger, exchange)
    }

    // =========================================================================
    // Paper mode
    // =========================================================================

    #[tokio::test]
    async fn test_paper_place_pair_writes_ledger_only() {
        let (executor, ledger, exchange) = paper_executor();
        let signal = signal();

        assert!(executor.place_pair(&signal).await.unwrap());

        let pairs = ledger.open_pairs().unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].ticker, "KXBTCD-TEST");

        let legs = ledger.orders_for_pair(&signal.pair_id).unwrap();
        assert_eq!(legs.len(), 2);
        assert!(legs.iter().any(|o| o.side == Side::Yes && o.price == 48));
        assert!(legs.iter().any(|o| o.side == Side::No && o.price == 49));
        assert_eq!(legs[0].size, legs[1].size);

        // Nothing reached the exchange
        assert!(exchange.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_paper_replay_is_idempotent() {
        let (executor, ledger, _) = paper_executor();
        let signal = signal();
        assert!(executor.place_pair(&signal).await.unwrap());
        // Same signal again: duplicates are tolerated, state unchanged
        assert!(executor.place_pair(&signal).await.unwrap());
        assert_eq!(ledger.open_pairs().unwrap().len(), 1);
        assert_eq!(ledger.orders_for_pair(&signal.pair_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_paper_cancel_all_open() {
        let (executor, ledger, _) = paper_executor();
        executor.place_pair(&signal()).await.unwrap();
        executor.place_pair(&signal()).await.unwrap();

        let cancelled = executor.cancel_all_open().await;
        assert_eq!(cancelled, 4);
        assert!(ledger.open_orders().unwrap().is_empty());
    }

    // =========================================================================
    // Live mode
    // =========================================================================

    #[tokio::test]
    async fn test_live_place_pair_submits_both_legs() {
        let (executor, ledger, exchange) = live_executor();
        let signal = signal();

        assert!(executor.place_pair(&signal).await.unwrap());

        let placed = exchange.placed_orders().await;
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].side, "yes");
        assert_eq!(placed[0].yes_price, Some(48));
        assert!(placed[0].post_only);
        assert_eq!(placed[1].side, "no");
        assert_eq!(placed[1].no_price, Some(49));

        // Acknowledgement ids recorded for both legs
        let legs = ledger.orders_for_pair(&signal.pair_id).unwrap();
        assert!(legs.iter().all(|o| o.exchange_order_id.is_some()));
    }

    #[tokio::test]
    async fn test_live_yes_leg_rejection_abandons_pair() {
        let (executor, ledger, exchange) = live_executor();
        let signal = signal();

        exchange.fail_placement(1);
        assert!(!executor.place_pair(&signal).await.unwrap());

        let legs = ledger.orders_for_pair(&signal.pair_id).unwrap();
        assert!(legs.iter().all(|o| o.status == OrderStatus::Cancelled));
        assert_eq!(
            ledger.count_pairs_by_status(PairStatus::Cancelled).unwrap(),
            1
        );
        // Nothing to unwind: the YES leg never rested
        assert!(exchange.cancelled_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_live_no_leg_rejection_unwinds_yes() {
        let (executor, ledger, exchange) = live_executor();
        let signal = signal();

        exchange.fail_placement(2);
        assert!(!executor.place_pair(&signal).await.unwrap());

        // The acknowledged YES order was cancelled on the exchange
        assert_eq!(exchange.cancelled_orders().await, vec!["EX-1".to_string()]);

        let legs = ledger.orders_for_pair(&signal.pair_id).unwrap();
        assert!(legs.iter().all(|o| o.status == OrderStatus::Cancelled));
        assert_eq!(
            ledger.count_pairs_by_status(PairStatus::Cancelled).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_treats_gone_order_as_success() {
        let (executor, ledger, exchange) = live_executor();
        let signal = signal();
        executor.place_pair(&signal).await.unwrap();

        let legs = ledger.orders_for_pair(&signal.pair_id).unwrap();
        let yes = legs.iter().find(|o| o.side == Side::Yes).unwrap();
        exchange
            .mark_order_gone(yes.exchange_order_id.as_deref().unwrap())
            .await;

        executor.cancel_order(yes).await.unwrap();
        assert_eq!(
            ledger.get_order(&yes.order_id).unwrap().status,
            OrderStatus::Cancelled
        );
    }
}
