//! Sqlite-backed persistent store.
//!
//! Single shared connection behind a fast mutex, WAL mode for concurrent
//! reads during writes, one transaction per logical operation. Every
//! subsystem goes through this handle; it is the only cross-subsystem shared
//! state.

use crate::models::{
    AccountSnapshot, DailyPick, Execution, Order, OrderBookTop, OrderStatus, Position, Quote,
    ResultClass, Side, TradeFeedback, TrapKind, TrapPatternWeight, Venue,
};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{info, warn};

pub const TRAP_WEIGHT_MIN: f64 = 0.30;
pub const TRAP_WEIGHT_MAX: f64 = 0.99;

/// Initial pattern weights before any learning has happened.
fn default_trap_weight(kind: TrapKind) -> f64 {
    match kind {
        TrapKind::FakeRise => 0.95,
        TrapKind::GapOverheat => 0.90,
        TrapKind::ProgramDump => 0.85,
        TrapKind::SellOnNews => 0.80,
        TrapKind::HollowRise => 0.75,
        TrapKind::SellWall => 0.70,
        TrapKind::SectorDecouple => 0.65,
        TrapKind::FxShock => 0.60,
        TrapKind::MaResistance => 0.55,
        TrapKind::DilutionDay => 0.90,
    }
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS positions (
    symbol TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    avg_price INTEGER NOT NULL,
    entered_at TEXT NOT NULL,
    max_price INTEGER NOT NULL,
    partial_stage INTEGER NOT NULL DEFAULT 0,
    pyramid_stage INTEGER NOT NULL DEFAULT 0,
    strategy TEXT NOT NULL DEFAULT 'intraday'
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS orders (
    order_no TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    name TEXT NOT NULL,
    side TEXT NOT NULL,
    venue TEXT NOT NULL,
    qty INTEGER NOT NULL,
    price INTEGER NOT NULL,
    status TEXT NOT NULL,
    filled_qty INTEGER NOT NULL DEFAULT 0,
    avg_fill_price INTEGER NOT NULL DEFAULT 0,
    placed_at TEXT NOT NULL,
    executed_at TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_orders_placed_at ON orders(placed_at DESC);
CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol, placed_at DESC);

CREATE TABLE IF NOT EXISTS executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_no TEXT NOT NULL,
    qty INTEGER NOT NULL,
    price INTEGER NOT NULL,
    amount INTEGER NOT NULL,
    ts TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_executions_order ON executions(order_no, ts);

CREATE TABLE IF NOT EXISTS account_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    cash INTEGER NOT NULL,
    total_equity INTEGER NOT NULL,
    realized_pnl_today INTEGER NOT NULL,
    cumulative_return_pct REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_ts ON account_snapshots(ts DESC);

CREATE TABLE IF NOT EXISTS trade_feedback (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    entry_price INTEGER NOT NULL,
    exit_price INTEGER NOT NULL,
    return_pct REAL NOT NULL,
    hold_days INTEGER NOT NULL,
    exit_reason TEXT NOT NULL,
    quant_score INTEGER NOT NULL,
    ai_score INTEGER NOT NULL,
    final_score INTEGER NOT NULL,
    class TEXT NOT NULL,
    detail TEXT NOT NULL,
    lesson TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_feedback_created ON trade_feedback(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_feedback_symbol ON trade_feedback(symbol, created_at DESC);

CREATE TABLE IF NOT EXISTS trap_pattern_weights (
    kind TEXT PRIMARY KEY,
    weight REAL NOT NULL,
    total INTEGER NOT NULL DEFAULT 0,
    correct INTEGER NOT NULL DEFAULT 0,
    accuracy REAL NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS daily_picks (
    date TEXT NOT NULL,
    rank INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    name TEXT NOT NULL,
    ai_score INTEGER NOT NULL,
    comment TEXT NOT NULL,
    expected_entry INTEGER NOT NULL,
    executed INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (date, symbol)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS system_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS decision_log (
    id TEXT PRIMARY KEY,
    ts TEXT NOT NULL,
    symbol TEXT NOT NULL,
    action TEXT NOT NULL,
    confidence INTEGER NOT NULL,
    risk TEXT NOT NULL,
    veto_reason TEXT,
    reasoning TEXT NOT NULL,
    context_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS quotes (
    symbol TEXT PRIMARY KEY,
    price INTEGER NOT NULL,
    change_pct REAL NOT NULL,
    volume INTEGER NOT NULL,
    ts TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS orderbook_tops (
    symbol TEXT PRIMARY KEY,
    bid_price INTEGER NOT NULL,
    ask_price INTEGER NOT NULL,
    bid_qty INTEGER NOT NULL,
    ask_qty INTEGER NOT NULL,
    ts TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS trap_avoidances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    kind TEXT NOT NULL,
    price_at INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS market_context (
    symbol TEXT PRIMARY KEY,
    open_price INTEGER NOT NULL DEFAULT 0,
    prev_close INTEGER NOT NULL DEFAULT 0,
    volume_ratio REAL NOT NULL DEFAULT 0,
    foreign_net INTEGER NOT NULL DEFAULT 0,
    inst_net INTEGER NOT NULL DEFAULT 0,
    program_net INTEGER NOT NULL DEFAULT 0,
    program_slope REAL NOT NULL DEFAULT 0,
    sector_name TEXT NOT NULL DEFAULT '',
    sector_change_pct REAL NOT NULL DEFAULT 0,
    ma120 INTEGER NOT NULL DEFAULT 0,
    ma200 INTEGER NOT NULL DEFAULT 0,
    ts TEXT NOT NULL
) WITHOUT ROWID;
"#;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let conn = Connection::open(path).with_context(|| format!("open database {path}"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.seed_trap_weights()?;
        info!("database ready");
        Ok(db)
    }

    fn seed_trap_weights(&self) -> Result<()> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        for kind in TrapKind::all() {
            conn.execute(
                "INSERT OR IGNORE INTO trap_pattern_weights (kind, weight, total, correct, accuracy, updated_at)
                 VALUES (?1, ?2, 0, 0, 0, ?3)",
                params![kind.as_str(), default_trap_weight(kind), now],
            )?;
        }
        Ok(())
    }

    // ---------- quotes / order book (write-through, latest only) ----------

    pub fn upsert_quote(&self, quote: &Quote) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO quotes (symbol, price, change_pct, volume, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(symbol) DO UPDATE SET
                 price = excluded.price,
                 change_pct = excluded.change_pct,
                 volume = excluded.volume,
                 ts = excluded.ts
             WHERE excluded.ts >= quotes.ts",
            params![
                quote.symbol,
                quote.price,
                quote.change_pct,
                quote.volume,
                quote.ts.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn latest_quote(&self, symbol: &str) -> Result<Option<Quote>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT symbol, price, change_pct, volume, ts FROM quotes WHERE symbol = ?1",
                params![symbol],
                |r| {
                    Ok(Quote {
                        symbol: r.get(0)?,
                        price: r.get(1)?,
                        change_pct: r.get(2)?,
                        volume: r.get(3)?,
                        ts: parse_ts(&r.get::<_, String>(4)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert_orderbook(&self, book: &OrderBookTop) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orderbook_tops (symbol, bid_price, ask_price, bid_qty, ask_qty, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(symbol) DO UPDATE SET
                 bid_price = excluded.bid_price,
                 ask_price = excluded.ask_price,
                 bid_qty = excluded.bid_qty,
                 ask_qty = excluded.ask_qty,
                 ts = excluded.ts
             WHERE excluded.ts >= orderbook_tops.ts",
            params![
                book.symbol,
                book.bid_price,
                book.ask_price,
                book.bid_qty,
                book.ask_qty,
                book.ts.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn latest_orderbook(&self, symbol: &str) -> Result<Option<OrderBookTop>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT symbol, bid_price, ask_price, bid_qty, ask_qty, ts
                 FROM orderbook_tops WHERE symbol = ?1",
                params![symbol],
                |r| {
                    Ok(OrderBookTop {
                        symbol: r.get(0)?,
                        bid_price: r.get(1)?,
                        ask_price: r.get(2)?,
                        bid_qty: r.get(3)?,
                        ask_qty: r.get(4)?,
                        ts: parse_ts(&r.get::<_, String>(5)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert_market_context(&self, context: &crate::broker::MarketContext) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO market_context
             (symbol, open_price, prev_close, volume_ratio, foreign_net, inst_net,
              program_net, program_slope, sector_name, sector_change_pct, ma120, ma200, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(symbol) DO UPDATE SET
                 open_price = excluded.open_price,
                 prev_close = excluded.prev_close,
                 volume_ratio = excluded.volume_ratio,
                 foreign_net = excluded.foreign_net,
                 inst_net = excluded.inst_net,
                 program_net = excluded.program_net,
                 program_slope = excluded.program_slope,
                 sector_name = excluded.sector_name,
                 sector_change_pct = excluded.sector_change_pct,
                 ma120 = excluded.ma120,
                 ma200 = excluded.ma200,
                 ts = excluded.ts",
            params![
                context.symbol,
                context.open_price,
                context.prev_close,
                context.volume_ratio,
                context.foreign_net,
                context.inst_net,
                context.program_net,
                context.program_slope,
                context.sector_name,
                context.sector_change_pct,
                context.ma120,
                context.ma200,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn latest_market_context(
        &self,
        symbol: &str,
    ) -> Result<Option<crate::broker::MarketContext>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT symbol, open_price, prev_close, volume_ratio, foreign_net, inst_net,
                        program_net, program_slope, sector_name, sector_change_pct, ma120, ma200
                 FROM market_context WHERE symbol = ?1",
                params![symbol],
                |r| {
                    Ok(crate::broker::MarketContext {
                        symbol: r.get(0)?,
                        open_price: r.get(1)?,
                        prev_close: r.get(2)?,
                        volume_ratio: r.get(3)?,
                        foreign_net: r.get(4)?,
                        inst_net: r.get(5)?,
                        program_net: r.get(6)?,
                        program_slope: r.get(7)?,
                        sector_name: r.get(8)?,
                        sector_change_pct: r.get(9)?,
                        ma120: r.get(10)?,
                        ma200: r.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ---------- positions ----------

    pub fn positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, name, quantity, avg_price, entered_at, max_price,
                    partial_stage, pyramid_stage, strategy
             FROM positions WHERE quantity > 0 ORDER BY symbol",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Position {
                    symbol: r.get(0)?,
                    name: r.get(1)?,
                    quantity: r.get(2)?,
                    avg_price: r.get(3)?,
                    entered_at: parse_ts(&r.get::<_, String>(4)?),
                    max_price: r.get(5)?,
                    partial_stage: r.get::<_, i64>(6)? as u8,
                    pyramid_stage: r.get::<_, i64>(7)? as u8,
                    strategy: r.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn position(&self, symbol: &str) -> Result<Option<Position>> {
        Ok(self
            .positions()?
            .into_iter()
            .find(|p| p.symbol == symbol))
    }

    /// Replace the whole position table from a broker balance snapshot.
    /// Keeps local-only fields (entry time, max price, partial stage) for
    /// symbols that survive the sync.
    pub fn sync_positions(&self, holdings: &[Position]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let existing: Vec<(String, String, i64, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT symbol, entered_at, max_price, partial_stage FROM positions",
                )?;
                let rows = stmt
                    .query_map([], |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };

            tx.execute("DELETE FROM positions", [])?;
            for pos in holdings.iter().filter(|p| p.quantity > 0) {
                let carried = existing.iter().find(|(s, _, _, _)| s == &pos.symbol);
                let entered_at = carried
                    .map(|(_, t, _, _)| t.clone())
                    .unwrap_or_else(|| pos.entered_at.to_rfc3339());
                let max_price = carried
                    .map(|(_, _, m, _)| (*m).max(pos.max_price))
                    .unwrap_or(pos.max_price);
                let partial_stage = carried
                    .map(|(_, _, _, s)| *s)
                    .unwrap_or(pos.partial_stage as i64);
                tx.execute(
                    "INSERT INTO positions
                     (symbol, name, quantity, avg_price, entered_at, max_price,
                      partial_stage, pyramid_stage, strategy)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        pos.symbol,
                        pos.name,
                        pos.quantity,
                        pos.avg_price,
                        entered_at,
                        max_price,
                        partial_stage,
                        pos.pyramid_stage as i64,
                        pos.strategy
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Raise the max-price watermark; never lowers it.
    pub fn update_position_max_price(&self, symbol: &str, price: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE positions SET max_price = MAX(max_price, ?2) WHERE symbol = ?1",
            params![symbol, price],
        )?;
        Ok(())
    }

    pub fn set_partial_stage(&self, symbol: &str, stage: u8) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE positions SET partial_stage = ?2 WHERE symbol = ?1",
            params![symbol, stage as i64],
        )?;
        Ok(())
    }

    // ---------- orders / executions ----------

    pub fn record_order(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO orders
             (order_no, symbol, name, side, venue, qty, price, status,
              filled_qty, avg_fill_price, placed_at, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                order.order_no,
                order.symbol,
                order.name,
                order.side.as_str(),
                order.venue.as_str(),
                order.qty,
                order.price,
                order.status.as_str(),
                order.filled_qty,
                order.avg_fill_price,
                order.placed_at.to_rfc3339(),
                order.executed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn order(&self, order_no: &str) -> Result<Option<Order>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT order_no, symbol, name, side, venue, qty, price, status,
                        filled_qty, avg_fill_price, placed_at, executed_at
                 FROM orders WHERE order_no = ?1",
                params![order_no],
                Self::map_order,
            )
            .optional()?;
        Ok(row)
    }

    pub fn open_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT order_no, symbol, name, side, venue, qty, price, status,
                    filled_qty, avg_fill_price, placed_at, executed_at
             FROM orders WHERE status IN ('PENDING', 'PARTIALLY_FILLED')
             ORDER BY placed_at",
        )?;
        let rows = stmt
            .query_map([], Self::map_order)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn orders_placed_on(&self, date: NaiveDate) -> Result<i64> {
        let conn = self.conn.lock();
        let prefix = format!("{date}%");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE placed_at LIKE ?1",
            params![prefix],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    fn map_order(r: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
        Ok(Order {
            order_no: r.get(0)?,
            symbol: r.get(1)?,
            name: r.get(2)?,
            side: if r.get::<_, String>(3)? == "SELL" {
                Side::Sell
            } else {
                Side::Buy
            },
            venue: Venue::parse(&r.get::<_, String>(4)?),
            qty: r.get(5)?,
            price: r.get(6)?,
            status: OrderStatus::parse(&r.get::<_, String>(7)?),
            filled_qty: r.get(8)?,
            avg_fill_price: r.get(9)?,
            placed_at: parse_ts(&r.get::<_, String>(10)?),
            executed_at: r
                .get::<_, Option<String>>(11)?
                .map(|s| parse_ts(&s)),
        })
    }

    pub fn mark_order_status(&self, order_no: &str, status: OrderStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET status = ?2 WHERE order_no = ?1",
            params![order_no, status.as_str()],
        )?;
        Ok(())
    }

    /// Apply one execution notice as a single transaction: append the fill,
    /// advance the order, and update the position (cost-weighted average on
    /// buys, reduce-or-delete on sells). An unknown order is a data
    /// inconsistency: warn, drop, mutate nothing.
    pub fn apply_execution(&self, exec: &Execution) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let order = tx
            .query_row(
                "SELECT symbol, name, side, qty, filled_qty, avg_fill_price
                 FROM orders WHERE order_no = ?1",
                params![exec.order_no],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, i64>(4)?,
                        r.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((symbol, name, side, order_qty, filled_qty, avg_fill_price)) = order else {
            warn!(order_no = %exec.order_no, "execution notice for unknown order, dropped");
            return Ok(false);
        };

        tx.execute(
            "INSERT INTO executions (order_no, qty, price, amount, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                exec.order_no,
                exec.qty,
                exec.price,
                exec.amount,
                exec.ts.to_rfc3339()
            ],
        )?;

        let new_filled = filled_qty + exec.qty;
        let new_avg_fill = if new_filled > 0 {
            (avg_fill_price * filled_qty + exec.price * exec.qty) / new_filled
        } else {
            0
        };
        let status = if new_filled >= order_qty {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        tx.execute(
            "UPDATE orders SET filled_qty = ?2, avg_fill_price = ?3, status = ?4, executed_at = ?5
             WHERE order_no = ?1",
            params![
                exec.order_no,
                new_filled,
                new_avg_fill,
                status.as_str(),
                exec.ts.to_rfc3339()
            ],
        )?;

        let position = tx
            .query_row(
                "SELECT quantity, avg_price, max_price FROM positions WHERE symbol = ?1",
                params![symbol],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?)),
            )
            .optional()?;

        if side == "BUY" {
            match position {
                Some((qty, avg, max_price)) => {
                    let new_qty = qty + exec.qty;
                    let new_avg = (avg * qty + exec.price * exec.qty) / new_qty;
                    tx.execute(
                        "UPDATE positions SET quantity = ?2, avg_price = ?3, max_price = ?4
                         WHERE symbol = ?1",
                        params![symbol, new_qty, new_avg, max_price.max(exec.price)],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO positions
                         (symbol, name, quantity, avg_price, entered_at, max_price,
                          partial_stage, pyramid_stage, strategy)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, 'intraday')",
                        params![
                            symbol,
                            name,
                            exec.qty,
                            exec.price,
                            exec.ts.to_rfc3339(),
                            exec.price
                        ],
                    )?;
                }
            }
        } else if let Some((qty, _, _)) = position {
            let remaining = qty - exec.qty;
            if remaining > 0 {
                tx.execute(
                    "UPDATE positions SET quantity = ?2 WHERE symbol = ?1",
                    params![symbol, remaining],
                )?;
            } else {
                tx.execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])?;
            }
        } else {
            warn!(symbol = %symbol, "sell execution without a position, dropped");
        }

        tx.commit()?;
        Ok(true)
    }

    // ---------- account snapshots ----------

    pub fn insert_account_snapshot(&self, snap: &AccountSnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO account_snapshots (ts, cash, total_equity, realized_pnl_today, cumulative_return_pct)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snap.ts.to_rfc3339(),
                snap.cash,
                snap.total_equity,
                snap.realized_pnl_today,
                snap.cumulative_return_pct
            ],
        )?;
        Ok(())
    }

    pub fn latest_account_snapshot(&self) -> Result<Option<AccountSnapshot>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT ts, cash, total_equity, realized_pnl_today, cumulative_return_pct
                 FROM account_snapshots ORDER BY ts DESC LIMIT 1",
                [],
                |r| {
                    Ok(AccountSnapshot {
                        ts: parse_ts(&r.get::<_, String>(0)?),
                        cash: r.get(1)?,
                        total_equity: r.get(2)?,
                        realized_pnl_today: r.get(3)?,
                        cumulative_return_pct: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ---------- trade feedback ----------

    pub fn insert_feedback(&self, fb: &TradeFeedback) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trade_feedback
             (symbol, entry_price, exit_price, return_pct, hold_days, exit_reason,
              quant_score, ai_score, final_score, class, detail, lesson, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                fb.symbol,
                fb.entry_price,
                fb.exit_price,
                fb.return_pct,
                fb.hold_days,
                fb.exit_reason,
                fb.quant_score,
                fb.ai_score,
                fb.final_score,
                fb.class.as_str(),
                fb.detail.as_str(),
                fb.lesson,
                fb.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn recent_feedback_classes(&self, limit: usize) -> Result<Vec<ResultClass>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT class FROM trade_feedback ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.iter().map(|s| ResultClass::parse(s)).collect())
    }

    /// Win rate / average return over stored feedback, preferring the
    /// symbol's own history when it is thick enough.
    pub fn feedback_performance(&self, symbol: &str) -> Result<Option<(i64, f64, f64)>> {
        let conn = self.conn.lock();
        let per_symbol: (i64, f64, f64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(AVG(CASE WHEN class = 'SUCCESS' THEN 100.0 ELSE 0.0 END), 0),
                    COALESCE(AVG(return_pct), 0)
             FROM trade_feedback WHERE symbol = ?1",
            params![symbol],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        if per_symbol.0 >= 10 {
            return Ok(Some(per_symbol));
        }
        let global: (i64, f64, f64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(AVG(CASE WHEN class = 'SUCCESS' THEN 100.0 ELSE 0.0 END), 0),
                    COALESCE(AVG(return_pct), 0)
             FROM trade_feedback",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        if global.0 == 0 {
            Ok(None)
        } else {
            Ok(Some(global))
        }
    }

    // ---------- trap pattern weights ----------

    pub fn trap_weight(&self, kind: TrapKind) -> Result<f64> {
        let conn = self.conn.lock();
        let weight = conn
            .query_row(
                "SELECT weight FROM trap_pattern_weights WHERE kind = ?1",
                params![kind.as_str()],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or_else(|| default_trap_weight(kind));
        Ok(weight)
    }

    pub fn trap_weights(&self) -> Result<Vec<TrapPatternWeight>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, weight, total, correct, accuracy FROM trap_pattern_weights",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, f64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, f64>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(kind, weight, total, correct, accuracy)| {
                TrapKind::parse(&kind).map(|kind| TrapPatternWeight {
                    kind,
                    weight,
                    total,
                    correct,
                    accuracy,
                })
            })
            .collect())
    }

    /// Reinforce (+0.01) or weaken (-0.02) a pattern and refresh its stats.
    /// The weight stays clipped to [0.30, 0.99].
    pub fn update_trap_weight(&self, kind: TrapKind, correct: bool) -> Result<f64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let (weight, total, correct_count): (f64, i64, i64) = tx
            .query_row(
                "SELECT weight, total, correct FROM trap_pattern_weights WHERE kind = ?1",
                params![kind.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?
            .unwrap_or((default_trap_weight(kind), 0, 0));

        let delta = if correct { 0.01 } else { -0.02 };
        let new_weight = (weight + delta).clamp(TRAP_WEIGHT_MIN, TRAP_WEIGHT_MAX);
        let new_total = total + 1;
        let new_correct = correct_count + if correct { 1 } else { 0 };
        let accuracy = new_correct as f64 / new_total as f64 * 100.0;

        tx.execute(
            "INSERT INTO trap_pattern_weights (kind, weight, total, correct, accuracy, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(kind) DO UPDATE SET
                 weight = excluded.weight,
                 total = excluded.total,
                 correct = excluded.correct,
                 accuracy = excluded.accuracy,
                 updated_at = excluded.updated_at",
            params![
                kind.as_str(),
                new_weight,
                new_total,
                new_correct,
                accuracy,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(new_weight)
    }

    // ---------- trap avoidances ----------

    /// Remember that a trap kept us out of a symbol, so the pattern can be
    /// scored against what the price actually did.
    pub fn insert_trap_avoidance(&self, symbol: &str, kind: TrapKind, price: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trap_avoidances (symbol, kind, price_at, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![symbol, kind.as_str(), price, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn unresolved_trap_avoidances(&self) -> Result<Vec<(i64, String, TrapKind, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, symbol, kind, price_at FROM trap_avoidances WHERE resolved = 0",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, symbol, kind, price)| {
                TrapKind::parse(&kind).map(|kind| (id, symbol, kind, price))
            })
            .collect())
    }

    pub fn resolve_trap_avoidance(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trap_avoidances SET resolved = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // ---------- daily picks ----------

    pub fn replace_daily_picks(&self, date: NaiveDate, picks: &[DailyPick]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM daily_picks WHERE date = ?1",
            params![date.to_string()],
        )?;
        for pick in picks {
            tx.execute(
                "INSERT INTO daily_picks (date, rank, symbol, name, ai_score, comment, expected_entry)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    date.to_string(),
                    pick.rank,
                    pick.symbol,
                    pick.name,
                    pick.ai_score,
                    pick.comment,
                    pick.expected_entry
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn daily_picks_for(&self, date: NaiveDate, limit: usize) -> Result<Vec<DailyPick>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT date, rank, symbol, name, ai_score, comment, expected_entry
             FROM daily_picks WHERE date = ?1 AND executed = 0
             ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![date.to_string(), limit as i64], |r| {
                Ok(DailyPick {
                    date: r.get::<_, String>(0)?.parse().unwrap_or_default(),
                    rank: r.get(1)?,
                    symbol: r.get(2)?,
                    name: r.get(3)?,
                    ai_score: r.get(4)?,
                    comment: r.get(5)?,
                    expected_entry: r.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_pick_executed(&self, date: NaiveDate, symbol: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE daily_picks SET executed = 1 WHERE date = ?1 AND symbol = ?2",
            params![date.to_string(), symbol],
        )?;
        Ok(())
    }

    // ---------- system config / decision log ----------

    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM system_config WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO system_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_decision(
        &self,
        id: &str,
        symbol: &str,
        action: &str,
        confidence: i32,
        risk: &str,
        veto_reason: Option<&str>,
        reasoning: &str,
        context_json: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO decision_log
             (id, ts, symbol, action, confidence, risk, veto_reason, reasoning, context_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                Utc::now().to_rfc3339(),
                symbol,
                action,
                confidence,
                risk,
                veto_reason,
                reasoning,
                context_json
            ],
        )?;
        Ok(())
    }

    pub fn decisions_on(&self, date: NaiveDate) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let prefix = format!("{date}%");
        let mut stmt = conn.prepare(
            "SELECT symbol, action FROM decision_log WHERE ts LIKE ?1 ORDER BY ts",
        )?;
        let rows = stmt
            .query_map(params![prefix], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResultDetail;

    fn db() -> Db {
        Db::open_in_memory().unwrap()
    }

    fn order(no: &str, symbol: &str, side: Side, qty: i64) -> Order {
        Order {
            order_no: no.into(),
            symbol: symbol.into(),
            name: symbol.into(),
            side,
            venue: Venue::Krx,
            qty,
            price: 0,
            status: OrderStatus::Pending,
            filled_qty: 0,
            avg_fill_price: 0,
            placed_at: Utc::now(),
            executed_at: None,
        }
    }

    fn fill(no: &str, qty: i64, price: i64) -> Execution {
        Execution {
            order_no: no.into(),
            qty,
            price,
            amount: qty * price,
            ts: Utc::now(),
        }
    }

    #[test]
    fn buy_fill_creates_and_averages_position() {
        let db = db();
        db.record_order(&order("A1", "005930", Side::Buy, 10)).unwrap();
        assert!(db.apply_execution(&fill("A1", 10, 70_000)).unwrap());

        let pos = db.position("005930").unwrap().unwrap();
        assert_eq!(pos.quantity, 10);
        assert_eq!(pos.avg_price, 70_000);

        db.record_order(&order("A2", "005930", Side::Buy, 10)).unwrap();
        db.apply_execution(&fill("A2", 10, 80_000)).unwrap();

        let pos = db.position("005930").unwrap().unwrap();
        assert_eq!(pos.quantity, 20);
        assert_eq!(pos.avg_price, 75_000);
        assert_eq!(pos.max_price, 80_000);
    }

    #[test]
    fn full_sell_deletes_the_position_row() {
        let db = db();
        db.record_order(&order("B1", "035720", Side::Buy, 5)).unwrap();
        db.apply_execution(&fill("B1", 5, 50_000)).unwrap();

        db.record_order(&order("B2", "035720", Side::Sell, 5)).unwrap();
        db.apply_execution(&fill("B2", 5, 52_000)).unwrap();

        assert!(db.position("035720").unwrap().is_none());
        let order = db.order("B2").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[test]
    fn partial_fill_advances_order_status() {
        let db = db();
        db.record_order(&order("C1", "000660", Side::Buy, 10)).unwrap();
        db.apply_execution(&fill("C1", 4, 120_000)).unwrap();

        let order = db.order("C1").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_qty, 4);
    }

    #[test]
    fn execution_for_unknown_order_is_dropped() {
        let db = db();
        assert!(!db.apply_execution(&fill("GHOST", 1, 1_000)).unwrap());
        assert!(db.position("GHOST").unwrap().is_none());
    }

    #[test]
    fn max_price_is_monotonic() {
        let db = db();
        db.record_order(&order("D1", "005930", Side::Buy, 1)).unwrap();
        db.apply_execution(&fill("D1", 1, 100_000)).unwrap();

        db.update_position_max_price("005930", 105_000).unwrap();
        db.update_position_max_price("005930", 101_000).unwrap();

        let pos = db.position("005930").unwrap().unwrap();
        assert_eq!(pos.max_price, 105_000);
    }

    #[test]
    fn trap_weight_updates_stay_clipped() {
        let db = db();
        for _ in 0..60 {
            db.update_trap_weight(TrapKind::MaResistance, false).unwrap();
        }
        assert!((db.trap_weight(TrapKind::MaResistance).unwrap() - TRAP_WEIGHT_MIN).abs() < 1e-9);

        for _ in 0..200 {
            db.update_trap_weight(TrapKind::MaResistance, true).unwrap();
        }
        assert!(db.trap_weight(TrapKind::MaResistance).unwrap() <= TRAP_WEIGHT_MAX + 1e-9);
    }

    #[test]
    fn trap_weight_arithmetic_matches_closed_form() {
        let db = db();
        let w0 = db.trap_weight(TrapKind::SellWall).unwrap();
        // 3 correct, 2 wrong.
        db.update_trap_weight(TrapKind::SellWall, true).unwrap();
        db.update_trap_weight(TrapKind::SellWall, true).unwrap();
        db.update_trap_weight(TrapKind::SellWall, false).unwrap();
        db.update_trap_weight(TrapKind::SellWall, true).unwrap();
        let w = db.update_trap_weight(TrapKind::SellWall, false).unwrap();
        let expected = (w0 + 0.01 * 3.0 - 0.02 * 2.0).clamp(TRAP_WEIGHT_MIN, TRAP_WEIGHT_MAX);
        assert!((w - expected).abs() < 1e-9);
    }

    #[test]
    fn feedback_roundtrip_and_streak_order() {
        let db = db();
        for (i, class) in [ResultClass::Success, ResultClass::Failure, ResultClass::Failure]
            .iter()
            .enumerate()
        {
            db.insert_feedback(&TradeFeedback {
                symbol: format!("SYM{i}"),
                entry_price: 10_000,
                exit_price: 9_000,
                return_pct: -10.0,
                hold_days: 1,
                exit_reason: "stop-loss".into(),
                quant_score: 70,
                ai_score: 70,
                final_score: 70,
                class: *class,
                detail: ResultDetail::StopLoss,
                lesson: None,
                created_at: Utc::now(),
            })
            .unwrap();
        }

        let classes = db.recent_feedback_classes(10).unwrap();
        // Most recent first.
        assert_eq!(
            classes,
            vec![ResultClass::Failure, ResultClass::Failure, ResultClass::Success]
        );
    }

    #[test]
    fn quote_write_through_keeps_latest() {
        let db = db();
        let mut quote = Quote {
            symbol: "005930".into(),
            price: 70_000,
            change_pct: 1.0,
            volume: 100,
            ts: Utc::now(),
        };
        db.upsert_quote(&quote).unwrap();
        quote.price = 71_000;
        quote.ts = Utc::now();
        db.upsert_quote(&quote).unwrap();

        assert_eq!(db.latest_quote("005930").unwrap().unwrap().price, 71_000);
    }

    #[test]
    fn config_roundtrip() {
        let db = db();
        assert!(db.config_get("min_score").unwrap().is_none());
        db.config_set("min_score", "73").unwrap();
        assert_eq!(db.config_get("min_score").unwrap().unwrap(), "73");
    }
}
