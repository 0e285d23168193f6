//! SQLite ledger for pairs, legs, realized PnL, and the event log.
//!
//! The ledger is the only durable state in the system. Every write is
//! committed before the call returns, so a crash immediately after a
//! logical operation re-reads the same state. Reads are point-in-time
//! snapshots. The database opens in WAL mode so the dashboard process can
//! read the same file while the engine writes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Errors surfaced by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("duplicate id: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {0} -> {1}")]
    InvalidTransition(String, String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Lifecycle of a pair. FILLED, PARTIAL, and CANCELLED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PairStatus {
    Open,
    Filled,
    Partial,
    Cancelled,
}

impl PairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairStatus::Open => "OPEN",
            PairStatus::Filled => "FILLED",
            PairStatus::Partial => "PARTIAL",
            PairStatus::Cancelled => "CANCELLED",
        }
    }

    fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "OPEN" => Ok(PairStatus::Open),
            "FILLED" => Ok(PairStatus::Filled),
            "PARTIAL" => Ok(PairStatus::Partial),
            "CANCELLED" => Ok(PairStatus::Cancelled),
            other => Err(LedgerError::NotFound(format!("pair status {other}"))),
        }
    }

    /// Terminal statuses only re-accept themselves.
    fn can_become(&self, next: PairStatus) -> bool {
        *self == next || *self == PairStatus::Open
    }
}

impl fmt::Display for PairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "OPEN",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "OPEN" => Ok(OrderStatus::Open),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(LedgerError::NotFound(format!("order status {other}"))),
        }
    }

    fn can_become(&self, next: OrderStatus) -> bool {
        *self == next || *self == OrderStatus::Open
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract side a leg rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

    fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "YES" => Ok(Side::Yes),
            "NO" => Ok(Side::No),
            other => Err(LedgerError::NotFound(format!("side {other}"))),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of trading intent: two opposing legs on one contract.
#[derive(Debug, Clone)]
pub struct Pair {
    pub pair_id: String,
    pub ticker: String,
    pub asset: String,
    /// Gross spread in cents at signal time.
    pub target_spread: i64,
    pub status: PairStatus,
    pub created_at: DateTime<Utc>,
    pub market_question: String,
}

/// A single resting limit order (one leg of a pair).
#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: String,
    pub pair_id: String,
    pub ticker: String,
    pub side: Side,
    /// Limit price in cents, 1..=99.
    pub price: i64,
    pub size: i64,
    pub status: OrderStatus,
    pub exchange_order_id: Option<String>,
    pub filled_size: i64,
    pub created_at: DateTime<Utc>,
}

/// Realized outcome of a completed pair. Dollar amounts.
#[derive(Debug, Clone)]
pub struct PnlRecord {
    pub pair_id: String,
    pub ticker: String,
    pub yes_fill_price: i64,
    pub no_fill_price: i64,
    pub size: i64,
    pub combined_cost: Decimal,
    pub gross_profit: Decimal,
    pub fees: Decimal,
    pub realized_pnl: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Audit-log entry.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub event_type: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate view over the PnL log.
#[derive(Debug, Clone)]
pub struct PnlSummary {
    pub pair_count: u64,
    pub gross_total: Decimal,
    pub fees_total: Decimal,
    pub realized_total: Decimal,
    pub average_realized: Decimal,
}

/// Durable store over SQLite. All methods are atomic; writes are flushed
/// before returning.
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open (creating if needed) the ledger at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, LedgerError> {
        let conn = Connection::open(db_path.as_ref())?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        info!(path = ?db_path.as_ref(), "Ledger opened");
        Ok(ledger)
    }

    /// In-memory ledger for tests.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        // WAL lets the dashboard read while the engine writes; FULL sync
        // makes each commit durable before the call returns.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pairs (
                pair_id TEXT PRIMARY KEY,
                ticker TEXT NOT NULL,
                asset TEXT NOT NULL,
                target_spread INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                market_question TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pairs_status ON pairs(status);
            CREATE INDEX IF NOT EXISTS idx_pairs_ticker ON pairs(ticker);

            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                pair_id TEXT NOT NULL REFERENCES pairs(pair_id),
                ticker TEXT NOT NULL,
                side TEXT NOT NULL,
                price INTEGER NOT NULL,
                size INTEGER NOT NULL,
                status TEXT NOT NULL,
                exchange_order_id TEXT,
                filled_size INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_pair ON orders(pair_id);
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);

            CREATE TABLE IF NOT EXISTS pnl_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pair_id TEXT NOT NULL,
                ticker TEXT NOT NULL,
                yes_fill_price INTEGER NOT NULL,
                no_fill_price INTEGER NOT NULL,
                size INTEGER NOT NULL,
                combined_cost TEXT NOT NULL,
                gross_profit TEXT NOT NULL,
                fees TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pnl_timestamp ON pnl_log(timestamp);

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                details_json TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
            "#,
        )?;
        debug!("Ledger schema initialized");
        Ok(())
    }

    fn is_pk_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
        )
    }

    // ==================== Writes ====================

    /// Insert a new pair. Fails with `Duplicate` if the pair id exists.
    pub fn insert_pair(&self, pair: &Pair) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            r#"
            INSERT INTO pairs (pair_id, ticker, asset, target_spread, status, created_at, market_question)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                pair.pair_id,
                pair.ticker,
                pair.asset,
                pair.target_spread,
                pair.status.as_str(),
                pair.created_at.to_rfc3339(),
                pair.market_question,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if Self::is_pk_violation(&e) => {
                Err(LedgerError::Duplicate(pair.pair_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Insert a new leg. Fails with `Duplicate` if the order id exists.
    pub fn insert_order(&self, order: &Order) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            r#"
            INSERT INTO orders (order_id, pair_id, ticker, side, price, size, status,
                                exchange_order_id, filled_size, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                order.order_id,
                order.pair_id,
                order.ticker,
                order.side.as_str(),
                order.price,
                order.size,
                order.status.as_str(),
                order.exchange_order_id,
                order.filled_size,
                order.created_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if Self::is_pk_violation(&e) => {
                Err(LedgerError::Duplicate(order.order_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move a pair to `new_status`. Idempotent; terminal states only
    /// re-accept themselves.
    pub fn update_pair_status(
        &self,
        pair_id: &str,
        new_status: PairStatus,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM pairs WHERE pair_id = ?1",
                params![pair_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = PairStatus::parse(
            &current.ok_or_else(|| LedgerError::NotFound(format!("pair {pair_id}")))?,
        )?;
        if current == new_status {
            return Ok(());
        }
        if !current.can_become(new_status) {
            return Err(LedgerError::InvalidTransition(
                current.to_string(),
                new_status.to_string(),
            ));
        }
        conn.execute(
            "UPDATE pairs SET status = ?1 WHERE pair_id = ?2",
            params![new_status.as_str(), pair_id],
        )?;
        Ok(())
    }

    /// Move a leg to `new_status`, optionally recording the filled size.
    pub fn update_order_status(
        &self,
        order_id: &str,
        new_status: OrderStatus,
        filled_size: Option<i64>,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM orders WHERE order_id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = OrderStatus::parse(
            &current.ok_or_else(|| LedgerError::NotFound(format!("order {order_id}")))?,
        )?;
        if current != new_status && !current.can_become(new_status) {
            return Err(LedgerError::InvalidTransition(
                current.to_string(),
                new_status.to_string(),
            ));
        }
        match filled_size {
            Some(filled) => conn.execute(
                "UPDATE orders SET status = ?1, filled_size = ?2 WHERE order_id = ?3",
                params![new_status.as_str(), filled, order_id],
            )?,
            None => conn.execute(
                "UPDATE orders SET status = ?1 WHERE order_id = ?2",
                params![new_status.as_str(), order_id],
            )?,
        };
        Ok(())
    }

    /// Record the exchange acknowledgement id for a leg.
    pub fn set_exchange_order_id(
        &self,
        order_id: &str,
        exchange_order_id: &str,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE orders SET exchange_order_id = ?1 WHERE order_id = ?2",
            params![exchange_order_id, order_id],
        )?;
        if updated == 0 {
            return Err(LedgerError::NotFound(format!("order {order_id}")));
        }
        Ok(())
    }

    /// Append a realized-PnL row.
    pub fn append_pnl(&self, record: &PnlRecord) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO pnl_log (pair_id, ticker, yes_fill_price, no_fill_price, size,
                                 combined_cost, gross_profit, fees, realized_pnl, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.pair_id,
                record.ticker,
                record.yes_fill_price,
                record.no_fill_price,
                record.size,
                record.combined_cost.to_string(),
                record.gross_profit.to_string(),
                record.fees.to_string(),
                record.realized_pnl.to_string(),
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Append a named event with a JSON detail payload.
    pub fn append_event(
        &self,
        event_type: &str,
        details: serde_json::Value,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (event_type, details_json, timestamp) VALUES (?1, ?2, ?3)",
            params![event_type, details.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ==================== Reads ====================

    fn pair_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pair> {
        Ok(Pair {
            pair_id: row.get(0)?,
            ticker: row.get(1)?,
            asset: row.get(2)?,
            target_spread: row.get(3)?,
            status: PairStatus::parse(&row.get::<_, String>(4)?)
                .unwrap_or(PairStatus::Cancelled),
            created_at: parse_timestamp(&row.get::<_, String>(5)?),
            market_question: row.get(6)?,
        })
    }

    fn order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
        Ok(Order {
            order_id: row.get(0)?,
            pair_id: row.get(1)?,
            ticker: row.get(2)?,
            side: Side::parse(&row.get::<_, String>(3)?).unwrap_or(Side::Yes),
            price: row.get(4)?,
            size: row.get(5)?,
            status: OrderStatus::parse(&row.get::<_, String>(6)?)
                .unwrap_or(OrderStatus::Cancelled),
            exchange_order_id: row.get(7)?,
            filled_size: row.get(8)?,
            created_at: parse_timestamp(&row.get::<_, String>(9)?),
        })
    }

    const PAIR_COLUMNS: &'static str =
        "pair_id, ticker, asset, target_spread, status, created_at, market_question";
    const ORDER_COLUMNS: &'static str = "order_id, pair_id, ticker, side, price, size, status, \
                                         exchange_order_id, filled_size, created_at";

    /// All pairs currently OPEN.
    pub fn open_pairs(&self) -> Result<Vec<Pair>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pairs WHERE status = 'OPEN' ORDER BY created_at",
            Self::PAIR_COLUMNS
        ))?;
        let pairs = stmt
            .query_map([], Self::pair_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pairs)
    }

    /// Both legs (in insertion order) of a pair.
    pub fn orders_for_pair(&self, pair_id: &str) -> Result<Vec<Order>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM orders WHERE pair_id = ?1 ORDER BY created_at, order_id",
            Self::ORDER_COLUMNS
        ))?;
        let orders = stmt
            .query_map(params![pair_id], Self::order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    /// All legs currently OPEN, across all pairs.
    pub fn open_orders(&self) -> Result<Vec<Order>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM orders WHERE status = 'OPEN' ORDER BY created_at",
            Self::ORDER_COLUMNS
        ))?;
        let orders = stmt
            .query_map([], Self::order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    /// Fetch one leg by id.
    pub fn get_order(&self, order_id: &str) -> Result<Order, LedgerError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {} FROM orders WHERE order_id = ?1",
                Self::ORDER_COLUMNS
            ),
            params![order_id],
            Self::order_from_row,
        )
        .optional()?
        .ok_or_else(|| LedgerError::NotFound(format!("order {order_id}")))
    }

    /// Totals and averages over the PnL log.
    pub fn pnl_summary(&self) -> Result<PnlSummary, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT gross_profit, fees, realized_pnl FROM pnl_log")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut summary = PnlSummary {
            pair_count: 0,
            gross_total: Decimal::ZERO,
            fees_total: Decimal::ZERO,
            realized_total: Decimal::ZERO,
            average_realized: Decimal::ZERO,
        };
        for (gross, fees, realized) in rows {
            summary.pair_count += 1;
            summary.gross_total += Decimal::from_str(&gross).unwrap_or_default();
            summary.fees_total += Decimal::from_str(&fees).unwrap_or_default();
            summary.realized_total += Decimal::from_str(&realized).unwrap_or_default();
        }
        if summary.pair_count > 0 {
            summary.average_realized =
                (summary.realized_total / Decimal::from(summary.pair_count)).round_dp(4);
        }
        Ok(summary)
    }

    /// Most recent pairs, newest first.
    pub fn recent_pairs(&self, limit: usize) -> Result<Vec<Pair>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pairs ORDER BY created_at DESC LIMIT ?1",
            Self::PAIR_COLUMNS
        ))?;
        let pairs = stmt
            .query_map(params![limit], Self::pair_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pairs)
    }

    /// Most recent PnL rows, newest first.
    pub fn recent_pnl(&self, limit: usize) -> Result<Vec<PnlRecord>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT pair_id, ticker, yes_fill_price, no_fill_price, size,
                   combined_cost, gross_profit, fees, realized_pnl, timestamp
            FROM pnl_log ORDER BY id DESC LIMIT ?1
            "#,
        )?;
        let records = stmt
            .query_map(params![limit], |row| {
                Ok(PnlRecord {
                    pair_id: row.get(0)?,
                    ticker: row.get(1)?,
                    yes_fill_price: row.get(2)?,
                    no_fill_price: row.get(3)?,
                    size: row.get(4)?,
                    combined_cost: Decimal::from_str(&row.get::<_, String>(5)?)
                        .unwrap_or_default(),
                    gross_profit: Decimal::from_str(&row.get::<_, String>(6)?)
                        .unwrap_or_default(),
                    fees: Decimal::from_str(&row.get::<_, String>(7)?).unwrap_or_default(),
                    realized_pnl: Decimal::from_str(&row.get::<_, String>(8)?)
                        .unwrap_or_default(),
                    timestamp: parse_timestamp(&row.get::<_, String>(9)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Most recent events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_type, details_json, timestamp FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit], |row| {
                Ok(EventRecord {
                    event_type: row.get(0)?,
                    details: serde_json::from_str(&row.get::<_, String>(1)?)
                        .unwrap_or(serde_json::Value::Null),
                    timestamp: parse_timestamp(&row.get::<_, String>(2)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// How many pairs carry the given status.
    pub fn count_pairs_by_status(&self, status: PairStatus) -> Result<u64, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pairs WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
