//! Kalshi REST client with RSA-PSS signed authentication.
//!
//! Every request carries three headers:
//! - `KALSHI-ACCESS-KEY`: API key id
//! - `KALSHI-ACCESS-TIMESTAMP`: unix milliseconds
//! - `KALSHI-ACCESS-SIGNATURE`: base64(RSA-PSS-SHA256 over
//!   `{timestamp}{METHOD}{PATH}`), where PATH includes the
//!   `/trade-api/v2` prefix, the leading `/`, and any query string.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{Client, Method, StatusCode};
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::DecodePrivateKey,
    pss::SigningKey,
    signature::{RandomizedSigner, SignatureEncoding},
    RsaPrivateKey,
};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

use super::traits::{ExchangeApi, ExchangeError};
use super::types::{
    CancelOutcome, ExchangeOrder, Market, MarketsResponse, Orderbook, OrderbookResponse,
    OrderRequest, OrderResponse,
};
use crate::config::KalshiConfig;

const API_BASE: &str = "https://api.elections.kalshi.com/trade-api/v2";
const DEMO_API_BASE: &str = "https://demo-api.kalshi.co/trade-api/v2";
const API_PREFIX: &str = "/trade-api/v2";

/// Authenticated Kalshi REST client.
pub struct KalshiClient {
    http: Client,
    api_key: String,
    private_key: RsaPrivateKey,
    base_url: String,
}

impl std::fmt::Debug for KalshiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KalshiClient")
            .field("api_key", &self.api_key)
            .field("base_url", &self.base_url)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl KalshiClient {
    /// Build a client from configuration. The private key is accepted as
    /// PKCS#8 or PKCS#1 PEM, inline or via file path.
    pub fn new(config: &KalshiConfig) -> Result<Self, ExchangeError> {
        let pem = match (&config.private_key_pem, &config.private_key_path) {
            (Some(pem), _) => pem.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .map_err(|e| ExchangeError::Signing(format!("read {path}: {e}")))?,
            (None, None) => {
                return Err(ExchangeError::Signing(
                    "neither private_key_pem nor private_key_path is set".to_string(),
                ))
            }
        };
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| ExchangeError::Signing(format!("parse private key: {e}")))?;

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let base_url = if config.demo { DEMO_API_BASE } else { API_BASE }.to_string();

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            private_key,
            base_url,
        })
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64
    }

    /// Sign `{timestamp}{METHOD}{PATH}` with RSA-PSS-SHA256 (salt length
    /// = digest length, the crate default). Returns (signature, timestamp).
    fn sign(&self, method: &str, full_path: &str) -> (String, String) {
        let timestamp = Self::timestamp_ms().to_string();
        let message = format!("{timestamp}{method}{full_path}");

        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let mut rng = rsa::rand_core::OsRng;
        let signature = signing_key.sign_with_rng(&mut rng, message.as_bytes());

        (BASE64.encode(signature.to_bytes()), timestamp)
    }

    /// Build a signed request for `path` (which must include the leading
    /// `/` and any query string, but not the API prefix).
    fn signed_request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let full_path = format!("{API_PREFIX}{path}");
        let (signature, timestamp) = self.sign(method.as_str(), &full_path);
        let url = format!("{}{}", self.base_url, path);

        self.http
            .request(method, url)
            .header("KALSHI-ACCESS-KEY", &self.api_key)
            .header("KALSHI-ACCESS-TIMESTAMP", timestamp)
            .header("KALSHI-ACCESS-SIGNATURE", signature)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ExchangeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ExchangeError::Auth),
            StatusCode::NOT_FOUND => Err(ExchangeError::NotFound),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(ExchangeError::Api {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

#[async_trait]
impl ExchangeApi for KalshiClient {
    #[instrument(skip(self))]
    async fn open_markets(
        &self,
        series_ticker: &str,
        limit: u32,
    ) -> Result<Vec<Market>, ExchangeError> {
        let path = format!("/markets?series_ticker={series_ticker}&status=open&limit={limit}");
        let response = self.signed_request(Method::GET, &path).send().await?;
        let response = Self::check_status(response).await?;
        let parsed: MarketsResponse = response.json().await?;
        debug!(series_ticker, count = parsed.markets.len(), "Fetched markets");
        Ok(parsed.markets)
    }

    #[instrument(skip(self))]
    async fn orderbook(&self, ticker: &str) -> Result<Orderbook, ExchangeError> {
        let path = format!("/markets/{ticker}/orderbook");
        let response = self.signed_request(Method::GET, &path).send().await?;
        let response = Self::check_status(response).await?;
        let parsed: OrderbookResponse = response.json().await?;
        Ok(parsed.orderbook)
    }

    #[instrument(skip(self, request), fields(ticker = %request.ticker, side = request.side))]
    async fn place_order(&self, request: &OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        let response = self
            .signed_request(Method::POST, "/portfolio/orders")
            .json(request)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let parsed: OrderResponse = response.json().await?;
        debug!(order_id = %parsed.order.order_id, "Order acknowledged");
        Ok(parsed.order)
    }

    #[instrument(skip(self))]
    async fn cancel_order(
        &self,
        exchange_order_id: &str,
    ) -> Result<CancelOutcome, ExchangeError> {
        let path = format!("/portfolio/orders/{exchange_order_id}");
        let response = self.signed_request(Method::DELETE, &path).send().await?;
        match Self::check_status(response).await {
            Ok(_) => Ok(CancelOutcome::Cancelled),
            // The order no longer exists on the book; nothing to cancel.
            Err(ExchangeError::NotFound) => Ok(CancelOutcome::AlreadyGone),
            Err(e) => Err(e),
        }
    }
}
