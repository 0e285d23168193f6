//! Market discovery, book derivation, signal selection, and execution.
//!
//! One cycle flows left to right: the scanner finds eligible contracts,
//! the book fetcher derives top-of-book views, the strategy filters them
//! into pair signals, and the executor turns signals into resting
//! orders.

pub mod books;
pub mod executor;
pub mod scanner;
pub mod signals;

pub use books::{derive_book, BookFetcher, MarketBook};
pub use executor::PairExecutor;
pub use scanner::{Contract, MarketScanner};
pub use signals::{PairSignal, SpreadStrategy};
