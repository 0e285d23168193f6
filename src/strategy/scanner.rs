//! Market discovery for the configured asset set.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::exchange::{ExchangeApi, ExchangeError, Market};

/// A contract eligible for quoting, with its time-to-close populated at
/// scan time.
#[derive(Debug, Clone)]
pub struct Contract {
    pub ticker: String,
    pub asset: String,
    pub title: String,
    pub close_time: DateTime<Utc>,
    pub seconds_until_close: i64,
}

/// Why a returned market was not eligible this scan.
#[derive(Debug, Clone, Copy)]
enum RejectReason {
    WrongPrefix,
    BadCloseTime,
    InsideBuffer,
}

/// Discovers currently-open contracts across the configured assets.
///
/// The seen-cache suppresses repeated "discovered" logs and remembers
/// close times for contracts that have dropped out of the scan window
/// but still back an open pair. It may be rebuilt from scratch at any
/// time.
pub struct MarketScanner {
    config: ScanConfig,
    seen: HashMap<String, Contract>,
}

impl MarketScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            seen: HashMap::new(),
        }
    }

    /// Kalshi series ticker for an asset's hourly contracts.
    pub fn series_ticker(asset: &str) -> String {
        match asset {
            "BTC" => "KXBTCD".to_string(),
            "ETH" => "KXETHD".to_string(),
            "SOL" => "KXSOLD".to_string(),
            "XRP" => "KXXRPD".to_string(),
            other => format!("KX{other}D"),
        }
    }

    /// Query the exchange for open contracts in every configured asset.
    /// Per-asset failures are logged and skipped; the rest of the scan
    /// proceeds.
    pub async fn scan(&mut self, exchange: &dyn ExchangeApi) -> Vec<Contract> {
        let now = Utc::now();
        let mut contracts = Vec::new();
        let mut rejected_prefix = 0usize;
        let mut rejected_close_time = 0usize;
        let mut rejected_buffer = 0usize;

        for asset in self.config.assets.clone() {
            let series = Self::series_ticker(&asset);
            let markets = match exchange
                .open_markets(&series, self.config.market_limit)
                .await
            {
                Ok(markets) => markets,
                Err(ExchangeError::Auth) => {
                    warn!(asset, series, "Authentication rejected, skipping asset this scan");
                    continue;
                }
                Err(e) => {
                    warn!(asset, series, error = %e, "Market scan failed for asset");
                    continue;
                }
            };

            for market in markets {
                match self.screen_market(&market, &asset, &series, now) {
                    Ok(contract) => {
                        if !self.seen.contains_key(&contract.ticker) {
                            info!(
                                ticker = %contract.ticker,
                                asset = %contract.asset,
                                closes_in_s = contract.seconds_until_close,
                                "Discovered contract"
                            );
                        }
                        self.seen.insert(contract.ticker.clone(), contract.clone());
                        contracts.push(contract);
                    }
                    Err(RejectReason::WrongPrefix) => rejected_prefix += 1,
                    Err(RejectReason::BadCloseTime) => rejected_close_time += 1,
                    Err(RejectReason::InsideBuffer) => rejected_buffer += 1,
                }
            }
        }

        self.purge_expired(now);

        debug!(
            eligible = contracts.len(),
            rejected_prefix,
            rejected_close_time,
            rejected_buffer,
            "Scan complete"
        );
        contracts
    }

    /// Screen one market against the eligibility rules.
    fn screen_market(
        &self,
        market: &Market,
        asset: &str,
        series: &str,
        now: DateTime<Utc>,
    ) -> Result<Contract, RejectReason> {
        if !market.ticker.starts_with(series) {
            return Err(RejectReason::WrongPrefix);
        }

        let close_time = DateTime::parse_from_rfc3339(&market.close_time)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| RejectReason::BadCloseTime)?;

        let seconds_until_close = (close_time - now).num_seconds();
        if seconds_until_close <= self.config.resolution_buffer_seconds {
            return Err(RejectReason::InsideBuffer);
        }

        Ok(Contract {
            ticker: market.ticker.clone(),
            asset: asset.to_string(),
            title: market.title.clone(),
            close_time,
            seconds_until_close,
        })
    }

    /// A previously-seen contract, with its time-to-close recomputed.
    /// Used for contracts backing open pairs after they drop out of the
    /// scan window.
    pub fn cached(&self, ticker: &str) -> Option<Contract> {
        self.seen.get(ticker).map(|contract| {
            let mut contract = contract.clone();
            contract.seconds_until_close = (contract.close_time - Utc::now()).num_seconds();
            contract
        })
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.seen.retain(|_, contract| contract.close_time > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::config::ScanConfig;

    fn test_market(ticker: &str, closes_in: Duration) -> Market {
        Market {
            ticker: ticker.to_string(),
            event_ticker: String::new(),
            title: "Test market".to_string(),
            yes_bid: 48,
            yes_ask: 52,
            no_bid: 49,
            no_ask: 51,
            last_price: 50,
            volume: 1000,
            open_interest: 500,
            status: "open".to_string(),
            close_time: (Utc::now() + closes_in).to_rfc3339(),
            expiration_time: None,
            result: None,
        }
    }

    fn scanner() -> MarketScanner {
        MarketScanner::new(ScanConfig::default())
    }

    #[test]
    fn test_series_ticker_mapping() {
        assert_eq!(MarketScanner::series_ticker("BTC"), "KXBTCD");
        assert_eq!(MarketScanner::series_ticker("ETH"), "KXETHD");
        assert_eq!(MarketScanner::series_ticker("DOGE"), "KXDOGED");
    }

    #[test]
    fn test_screen_accepts_contract_outside_buffer() {
        let s = scanner();
        let market = test_market("KXBTCD-26AUG02H15-T60", Duration::seconds(3600));
        let contract = s
            .screen_market(&market, "BTC", "KXBTCD", Utc::now())
            .unwrap();
        assert_eq!(contract.asset, "BTC");
        assert!(contract.seconds_until_close > 3500);
    }

    #[test]
    fn test_screen_rejects_inside_resolution_buffer() {
        let s = scanner();
        // Default buffer is 120 s
        let market = test_market("KXBTCD-26AUG02H15-T60", Duration::seconds(100));
        assert!(s
            .screen_market(&market, "BTC", "KXBTCD", Utc::now())
            .is_err());
    }

    #[test]
    fn test_screen_rejects_wrong_prefix() {
        let s = scanner();
        let market = test_market("KXETHD-26AUG02H15-T3000", Duration::seconds(3600));
        assert!(s
            .screen_market(&market, "BTC", "KXBTCD", Utc::now())
            .is_err());
    }

    #[test]
    fn test_screen_rejects_unparseable_close_time() {
        let s = scanner();
        let mut market = test_market("KXBTCD-26AUG02H15-T60", Duration::seconds(3600));
        market.close_time = "not-a-timestamp".to_string();
        assert!(s
            .screen_market(&market, "BTC", "KXBTCD", Utc::now())
            .is_err());
    }

    #[test]
    fn test_cache_recomputes_time_to_close_and_purges() {
        let mut s = scanner();
        let now = Utc::now();
        let market = test_market("KXBTCD-26AUG02H15-T60", Duration::seconds(3600));
        let contract = s.screen_market(&market, "BTC", "KXBTCD", now).unwrap();
        s.seen.insert(contract.ticker.clone(), contract);

        let cached = s.cached("KXBTCD-26AUG02H15-T60").unwrap();
        assert!(cached.seconds_until_close <= 3600);
        assert!(cached.seconds_until_close > 3500);

        // Entries past their close time are dropped
        s.purge_expired(now + Duration::seconds(7200));
        assert!(s.cached("KXBTCD-26AUG02H15-T60").is_none());
    }
}
