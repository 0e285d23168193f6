//! Venue seam shared by the live client, the test mock, and anything
//! else that wants to stand in for the exchange.

use async_trait::async_trait;
use thiserror::Error;

use super::types::{CancelOutcome, ExchangeOrder, Market, Orderbook, OrderRequest};

/// Errors from exchange operations, classified so callers can branch:
/// auth failures skip the asset for a scan, 404 cancels count as done,
/// transport errors are retryable.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("authentication required or rejected")]
    Auth,

    #[error("not found")]
    NotFound,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("exchange returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("request signing failed: {0}")]
    Signing(String),
}

/// The four exchange operations the engine needs.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Currently-open markets in a series.
    async fn open_markets(
        &self,
        series_ticker: &str,
        limit: u32,
    ) -> Result<Vec<Market>, ExchangeError>;

    /// Bid levels for both sides of one contract.
    async fn orderbook(&self, ticker: &str) -> Result<Orderbook, ExchangeError>;

    /// Submit an order; returns the exchange acknowledgement.
    async fn place_order(&self, request: &OrderRequest) -> Result<ExchangeOrder, ExchangeError>;

    /// Cancel a resting order by its exchange id.
    async fn cancel_order(&self, exchange_order_id: &str)
        -> Result<CancelOutcome, ExchangeError>;
}
