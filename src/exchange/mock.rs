//! Scripted exchange for tests.
//!
//! Holds canned markets and orderbooks, records every placement and
//! cancel, and can be told to fail the next placement so the two-leg
//! unwind path can be exercised.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::traits::{ExchangeApi, ExchangeError};
use super::types::{CancelOutcome, ExchangeOrder, Market, Orderbook, OrderRequest};

/// In-memory stand-in for the Kalshi API.
#[derive(Default)]
pub struct MockExchange {
    markets: RwLock<HashMap<String, Vec<Market>>>,
    books: RwLock<HashMap<String, Orderbook>>,
    placed: RwLock<Vec<OrderRequest>>,
    cancelled: RwLock<Vec<String>>,
    place_attempts: AtomicU64,
    /// 1-based attempt number that should be rejected; 0 = never.
    fail_place_at: AtomicU64,
    gone_orders: RwLock<Vec<String>>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the markets returned for a series ticker.
    pub async fn set_markets(&self, series_ticker: &str, markets: Vec<Market>) {
        self.markets
            .write()
            .await
            .insert(series_ticker.to_string(), markets);
    }

    /// Script the orderbook for a contract ticker.
    pub async fn set_book(&self, ticker: &str, book: Orderbook) {
        self.books.write().await.insert(ticker.to_string(), book);
    }

    /// Reject the `n`th placement (1-based) with an API error.
    pub fn fail_placement(&self, n: u64) {
        self.fail_place_at.store(n, Ordering::SeqCst);
    }

    /// Treat this exchange order id as already gone (cancel returns 404).
    pub async fn mark_order_gone(&self, exchange_order_id: &str) {
        self.gone_orders
            .write()
            .await
            .push(exchange_order_id.to_string());
    }

    /// Every order placed so far.
    pub async fn placed_orders(&self) -> Vec<OrderRequest> {
        self.placed.read().await.clone()
    }

    /// Every exchange order id cancelled so far.
    pub async fn cancelled_orders(&self) -> Vec<String> {
        self.cancelled.read().await.clone()
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn open_markets(
        &self,
        series_ticker: &str,
        _limit: u32,
    ) -> Result<Vec<Market>, ExchangeError> {
        Ok(self
            .markets
            .read()
            .await
            .get(series_ticker)
            .cloned()
            .unwrap_or_default())
    }

    async fn orderbook(&self, ticker: &str) -> Result<Orderbook, ExchangeError> {
        self.books
            .read()
            .await
            .get(ticker)
            .cloned()
            .ok_or(ExchangeError::NotFound)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        let attempt = self.place_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.fail_place_at.load(Ordering::SeqCst) {
            return Err(ExchangeError::Api {
                status: 400,
                body: "order rejected".to_string(),
            });
        }
        self.placed.write().await.push(request.clone());
        Ok(ExchangeOrder {
            order_id: format!("EX-{attempt}"),
            status: "resting".to_string(),
        })
    }

    async fn cancel_order(
        &self,
        exchange_order_id: &str,
    ) -> Result<CancelOutcome, ExchangeError> {
        if self
            .gone_orders
            .read()
            .await
            .iter()
            .any(|id| id == exchange_order_id)
        {
            return Ok(CancelOutcome::AlreadyGone);
        }
        self.cancelled
            .write()
            .await
            .push(exchange_order_id.to_string());
        Ok(CancelOutcome::Cancelled)
    }
}
