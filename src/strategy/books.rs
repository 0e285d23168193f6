//! Order-book retrieval and best-price derivation.
//!
//! The exchange quotes bid levels for both sides directly. Ask prices
//! follow from the payout identity: a resting YES bid at `p` is exactly
//! a NO ask at `100 - p`, so `best_yes_ask = 100 - best_no_bid` and
//! symmetrically for NO.

use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::scanner::Contract;
use crate::exchange::{ExchangeApi, Orderbook};

/// Parallel book fetches in flight at once.
const FETCH_CONCURRENCY: usize = 8;

/// Derived top-of-book view of one contract.
#[derive(Debug, Clone)]
pub struct MarketBook {
    pub ticker: String,
    pub asset: String,
    pub title: String,
    pub seconds_until_close: i64,
    /// 0 when the side has no bids.
    pub best_yes_bid: i64,
    pub best_no_bid: i64,
    /// 100 when the opposing side has no bids.
    pub best_yes_ask: i64,
    pub best_no_ask: i64,
    /// What the maker pays for one pair of contracts, in cents.
    pub combined_bid: i64,
    /// Gross profit per contract in cents, before fees.
    pub spread_profit: i64,
    /// Liquidity at the smaller of the two best bids.
    pub min_bid_size: i64,
}

/// Fetches books for a batch of contracts with bounded fan-out.
pub struct BookFetcher {
    concurrency: usize,
}

impl Default for BookFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl BookFetcher {
    pub fn new() -> Self {
        Self {
            concurrency: FETCH_CONCURRENCY,
        }
    }

    /// Fetch each contract's book in parallel. Individual failures are
    /// logged and dropped; the rest of the batch still returns.
    pub async fn fetch_all(
        &self,
        exchange: &dyn ExchangeApi,
        contracts: &[Contract],
    ) -> HashMap<String, MarketBook> {
        let books: Vec<Option<MarketBook>> = stream::iter(contracts)
            .map(|contract| async move {
                match exchange.orderbook(&contract.ticker).await {
                    Ok(book) => Some(derive_book(contract, &book)),
                    Err(e) => {
                        warn!(ticker = %contract.ticker, error = %e, "Book fetch failed");
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let books: HashMap<String, MarketBook> = books
            .into_iter()
            .flatten()
            .map(|book| (book.ticker.clone(), book))
            .collect();
        debug!(fetched = books.len(), requested = contracts.len(), "Books fetched");
        books
    }
}

fn best_bid(levels: Option<&Vec<[i64; 2]>>) -> (i64, i64) {
    levels
        .into_iter()
        .flatten()
        .max_by_key(|level| level[0])
        .map(|level| (level[0], level[1]))
        .unwrap_or((0, 0))
}

/// Compute the derived quantities for one contract's book.
pub fn derive_book(contract: &Contract, book: &Orderbook) -> MarketBook {
    let (best_yes_bid, yes_bid_size) = best_bid(book.yes.as_ref());
    let (best_no_bid, no_bid_size) = best_bid(book.no.as_ref());

    let best_yes_ask = if best_no_bid > 0 { 100 - best_no_bid } else { 100 };
    let best_no_ask = if best_yes_bid > 0 { 100 - best_yes_bid } else { 100 };

    let combined_bid = best_yes_bid + best_no_bid;

    MarketBook {
        ticker: contract.ticker.clone(),
        asset: contract.asset.clone(),
        title: contract.title.clone(),
        seconds_until_close: contract.seconds_until_close,
        best_yes_bid,
        best_no_bid,
        best_yes_ask,
        best_no_ask,
        combined_bid,
        spread_profit: 100 - combined_bid,
        min_bid_size: yes_bid_size.min(no_bid_size),
    }
}
