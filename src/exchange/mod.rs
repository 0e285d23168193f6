//! Kalshi exchange integration.
//!
//! `KalshiClient` talks to the REST trade API with RSA-PSS signed
//! headers. `ExchangeApi` is the seam the engine programs against;
//! `MockExchange` implements it with scripted responses for tests.

mod client;
pub mod mock;
mod traits;
mod types;

pub use client::KalshiClient;
pub use mock::MockExchange;
pub use traits::{ExchangeApi, ExchangeError};
pub use types::*;
