//! Wire types for the Kalshi trade API.

use serde::{Deserialize, Serialize};

use crate::persistence::Side;

/// One market as returned by `GET /markets`.
#[derive(Debug, Clone, Deserialize)]
pub struct Market {
    pub ticker: String,
    #[serde(default)]
    pub event_ticker: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub yes_bid: i64,
    #[serde(default)]
    pub yes_ask: i64,
    #[serde(default)]
    pub no_bid: i64,
    #[serde(default)]
    pub no_ask: i64,
    #[serde(default)]
    pub last_price: i64,
    #[serde(default)]
    pub volume: i64,
    #[serde(default)]
    pub open_interest: i64,
    #[serde(default)]
    pub status: String,
    /// RFC3339; parsed by the scanner.
    pub close_time: String,
    #[serde(default)]
    pub expiration_time: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketsResponse {
    pub markets: Vec<Market>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Bid levels for both sides of one contract. Each level is
/// `[price_cents, size_contracts]`; the exchange sends `null` for an
/// empty side.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Orderbook {
    #[serde(default)]
    pub yes: Option<Vec<[i64; 2]>>,
    #[serde(default)]
    pub no: Option<Vec<[i64; 2]>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderbookResponse {
    pub orderbook: Orderbook,
}

impl Side {
    fn wire(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }
}

/// Body for `POST /portfolio/orders`. Always a post-only GTC limit buy;
/// the maker never takes liquidity.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub ticker: String,
    pub client_order_id: String,
    pub action: &'static str,
    pub side: &'static str,
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yes_price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_price: Option<i64>,
    pub time_in_force: &'static str,
    pub post_only: bool,
}

impl OrderRequest {
    /// Post-only limit buy resting at `price_cents` on `side`.
    pub fn limit_buy(
        ticker: &str,
        client_order_id: &str,
        side: Side,
        price_cents: i64,
        count: i64,
    ) -> Self {
        let (yes_price, no_price) = match side {
            Side::Yes => (Some(price_cents), None),
            Side::No => (None, Some(price_cents)),
        };
        Self {
            ticker: ticker.to_string(),
            client_order_id: client_order_id.to_string(),
            action: "buy",
            side: side.wire(),
            order_type: "limit",
            count,
            yes_price,
            no_price,
            time_in_force: "gtc",
            post_only: true,
        }
    }
}

/// Acknowledged order, from `POST /portfolio/orders`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub order: ExchangeOrder,
}

/// Result of a cancel request. A 404 means the order is already gone,
/// which callers treat the same as a successful cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyGone,
}
