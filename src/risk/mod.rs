//! Capital limits and position lifecycle.
//!
//! - `capital`: the in-memory book of available and deployed dollars
//! - `positions`: the per-pair state machine, paper-fill simulation,
//!   and the consecutive-one-sided halt

pub mod capital;
pub mod positions;

pub use capital::{CapitalBook, CapitalError, CapitalSummary};
pub use positions::{PositionManager, PositionSettings};
