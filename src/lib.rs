//! # Spread Maker
//!
//! An automated market maker for binary event contracts on Kalshi. It
//! rests post-only bids on both the YES and NO side of short-dated
//! contracts; when both legs fill for a combined price under 100 cents,
//! the spread is locked in regardless of how the contract resolves.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `exchange`: Kalshi REST client (RSA-PSS signed) and the venue seam
//! - `strategy`: Market scanning, book derivation, signal selection,
//!   and order execution
//! - `risk`: Capital accounting and the pair state machine
//! - `persistence`: SQLite ledger of pairs, legs, PnL, and events
//! - `engine`: Startup recovery and the scan/manage/place cycle
//! - `utils`: Fee arithmetic

pub mod config;
pub mod engine;
pub mod exchange;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
