//! Process-local capital accounting.
//!
//! Tracks the dollars available for new pairs and the dollars deployed
//! per open pair. The book is in-memory only; on restart it is rebuilt
//! by allocating the leg cost of every OPEN pair the ledger reports.

use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CapitalError {
    #[error("pair {0} already has an allocation")]
    DuplicateAllocation(String),

    #[error("insufficient capital: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    #[error("no allocation recorded for pair {0}")]
    UnknownPair(String),
}

/// Snapshot of the book, rounded to cents.
#[derive(Debug, Clone, PartialEq)]
pub struct CapitalSummary {
    pub available: Decimal,
    pub deployed: Decimal,
    pub open_pairs: usize,
}

/// Available/deployed balances with per-pair allocations.
///
/// Invariant: `available + Σ deployed = starting_balance + Σ released pnl`
/// across the lifetime of the book.
#[derive(Debug)]
pub struct CapitalBook {
    starting_balance: Decimal,
    available: Decimal,
    deployed: HashMap<String, Decimal>,
}

impl CapitalBook {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            starting_balance,
            available: starting_balance,
            deployed: HashMap::new(),
        }
    }

    pub fn starting_balance(&self) -> Decimal {
        self.starting_balance
    }

    pub fn available(&self) -> Decimal {
        self.available
    }

    pub fn total_deployed(&self) -> Decimal {
        self.deployed.values().copied().sum()
    }

    /// Whether `amount` dollars can be allocated right now.
    pub fn can_allocate(&self, amount: Decimal) -> bool {
        amount <= self.available
    }

    /// Reserve `amount` dollars against `pair_id`.
    pub fn allocate(&mut self, pair_id: &str, amount: Decimal) -> Result<(), CapitalError> {
        if self.deployed.contains_key(pair_id) {
            return Err(CapitalError::DuplicateAllocation(pair_id.to_string()));
        }
        if amount > self.available {
            return Err(CapitalError::InsufficientFunds {
                requested: amount,
                available: self.available,
            });
        }
        self.available -= amount;
        self.deployed.insert(pair_id.to_string(), amount);
        debug!(pair_id, %amount, available = %self.available, "Capital allocated");
        Ok(())
    }

    /// Return a pair's allocation plus its realized `pnl` (possibly
    /// negative) to the available balance.
    pub fn release(&mut self, pair_id: &str, pnl: Decimal) -> Result<Decimal, CapitalError> {
        let deployed = self
            .deployed
            .remove(pair_id)
            .ok_or_else(|| CapitalError::UnknownPair(pair_id.to_string()))?;
        let returned = deployed + pnl;
        self.available += returned;
        debug!(pair_id, %deployed, %pnl, available = %self.available, "Capital released");
        Ok(returned)
    }

    pub fn summary(&self) -> CapitalSummary {
        CapitalSummary {
            available: self.available.round_dp(2),
            deployed: self.total_deployed().round_dp(2),
            open_pairs: self.deployed.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_allocate_and_release_round_trip() {
        let mut book = CapitalBook::new(dec!(1000));
        assert!(book.can_allocate(dec!(9.70)));

        book.allocate("p1", dec!(9.70)).unwrap();
        assert_eq!(book.available(), dec!(990.30));
        assert_eq!(book.total_deployed(), dec!(9.70));

        let returned = book.release("p1", dec!(0.212)).unwrap();
        assert_eq!(returned, dec!(9.912));
        assert_eq!(book.available(), dec!(1000.212));
        assert_eq!(book.total_deployed(), Decimal::ZERO);
    }

    #[test]
    fn test_release_with_negative_pnl() {
        // One-sided loss: the whole filled-leg cost is booked against
        // the allocation.
        let mut book = CapitalBook::new(dec!(100));
        book.allocate("p1", dec!(9.70)).unwrap();
        book.release("p1", dec!(-4.80)).unwrap();
        assert_eq!(book.available(), dec!(95.20));
    }

    #[test]
    fn test_duplicate_allocation_rejected() {
        let mut book = CapitalBook::new(dec!(100));
        book.allocate("p1", dec!(10)).unwrap();
        let err = book.allocate("p1", dec!(10)).unwrap_err();
        assert!(matches!(err, CapitalError::DuplicateAllocation(_)));
        // Failed allocate must not touch the balance
        assert_eq!(book.available(), dec!(90));
    }

    #[test]
    fn test_insufficient_funds_rejected() {
        let mut book = CapitalBook::new(dec!(5));
        assert!(!book.can_allocate(dec!(9.70)));
        let err = book.allocate("p1", dec!(9.70)).unwrap_err();
        assert!(matches!(err, CapitalError::InsufficientFunds { .. }));
        assert_eq!(book.available(), dec!(5));
    }

    #[test]
    fn test_release_unknown_pair() {
        let mut book = CapitalBook::new(dec!(100));
        let err = book.release("nope", Decimal::ZERO).unwrap_err();
        assert!(matches!(err, CapitalError::UnknownPair(_)));
    }

    #[test]
    fn test_conservation_invariant() {
        // available + deployed == starting + realized, at every step
        let mut book = CapitalBook::new(dec!(500));
        let mut realized = Decimal::ZERO;

        book.allocate("p1", dec!(50)).unwrap();
        book.allocate("p2", dec!(75)).unwrap();
        assert_eq!(book.available() + book.total_deployed(), dec!(500) + realized);

        book.release("p1", dec!(1.25)).unwrap();
        realized += dec!(1.25);
        assert_eq!(book.available() + book.total_deployed(), dec!(500) + realized);

        book.release("p2", dec!(-36)).unwrap();
        realized += dec!(-36);
        assert_eq!(book.available() + book.total_deployed(), dec!(500) + realized);
    }

    #[test]
    fn test_summary_rounds_to_cents() {
        let mut book = CapitalBook::new(dec!(100));
        book.allocate("p1", dec!(33.333)).unwrap();
        let summary = book.summary();
        assert_eq!(summary.available, dec!(66.67));
        assert_eq!(summary.deployed, dec!(33.33));
        assert_eq!(summary.open_pairs, 1);
    }
}
