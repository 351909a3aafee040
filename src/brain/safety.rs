//! Hard pre-order limits.
//!
//! Five gates, all of which must pass before a buy reaches the broker.
//! Gates that depend on a broker call err on the side of approval when the
//! call itself fails; a dead balance endpoint must not strand the strategy.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Weekday};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::broker::Brokerage;
use crate::storage::Db;

pub const MAX_HOLDINGS: usize = 5;
pub const MAX_DAILY_TRADES: i64 = 4;
pub const FRIDAY_CUTOFF_HOUR: u32 = 14;
pub const FRIDAY_CUTOFF_MINUTE: u32 = 30;
pub const MAX_ACCOUNT_LOSS_PCT: f64 = -2.0;
pub const MAX_POSITION_WEIGHT_PCT: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct SafetyReport {
    pub approved: bool,
    pub reason: String,
    pub checks: Vec<CheckResult>,
}

/// True when buying is still allowed at this wall-clock moment: everything
/// except Friday at or past the weekend-risk cutoff.
pub fn friday_cutoff_ok(weekday: Weekday, hour: u32, minute: u32) -> bool {
    weekday != Weekday::Fri
        || hour < FRIDAY_CUTOFF_HOUR
        || (hour == FRIDAY_CUTOFF_HOUR && minute < FRIDAY_CUTOFF_MINUTE)
}

pub struct SafetyChecker {
    db: Db,
    broker: Arc<dyn Brokerage>,
}

impl SafetyChecker {
    pub fn new(db: Db, broker: Arc<dyn Brokerage>) -> Self {
        Self { db, broker }
    }

    pub async fn check_buy(
        &self,
        symbol: &str,
        qty: i64,
        price: i64,
        now: DateTime<Tz>,
    ) -> SafetyReport {
        let mut checks = Vec::with_capacity(5);

        let holdings = self.db.positions().map(|p| p.len()).unwrap_or(0);
        checks.push(CheckResult {
            name: "holdings_count",
            passed: holdings < MAX_HOLDINGS,
            detail: format!("holdings {holdings}/{MAX_HOLDINGS}"),
        });

        let trades_today = self
            .db
            .orders_placed_on(now.date_naive())
            .unwrap_or(MAX_DAILY_TRADES);
        checks.push(CheckResult {
            name: "daily_trades",
            passed: trades_today < MAX_DAILY_TRADES,
            detail: format!("orders today {trades_today}/{MAX_DAILY_TRADES}"),
        });

        let cutoff_ok = friday_cutoff_ok(now.weekday(), now.hour(), now.minute());
        checks.push(CheckResult {
            name: "friday_cutoff",
            passed: cutoff_ok,
            detail: if cutoff_ok {
                "not inside the weekend-risk window".to_string()
            } else {
                format!("no buys after Friday {FRIDAY_CUTOFF_HOUR}:{FRIDAY_CUTOFF_MINUTE:02}")
            },
        });

        // Gates 4 and 5 need the broker; failures there approve.
        match self.broker.combined_balance().await {
            Ok(balance) => {
                let pnl = balance.summary.cumulative_return_pct;
                checks.push(CheckResult {
                    name: "account_loss",
                    passed: pnl > MAX_ACCOUNT_LOSS_PCT,
                    detail: format!("account P&L {pnl:+.2}% (limit {MAX_ACCOUNT_LOSS_PCT}%)"),
                });

                let equity = balance.summary.total_equity;
                if equity > 0 {
                    let weight = (qty * price) as f64 / equity as f64 * 100.0;
                    checks.push(CheckResult {
                        name: "position_weight",
                        passed: weight <= MAX_POSITION_WEIGHT_PCT,
                        detail: format!(
                            "order weight {weight:.2}% (limit {MAX_POSITION_WEIGHT_PCT}%)"
                        ),
                    });
                } else {
                    checks.push(CheckResult {
                        name: "position_weight",
                        passed: false,
                        detail: "total equity is zero".to_string(),
                    });
                }
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "balance check unavailable, passing gates 4-5");
                checks.push(CheckResult {
                    name: "account_loss",
                    passed: true,
                    detail: "balance unavailable, passed".to_string(),
                });
                checks.push(CheckResult {
                    name: "position_weight",
                    passed: true,
                    detail: "balance unavailable, passed".to_string(),
                });
            }
        }

        let approved = checks.iter().all(|c| c.passed);
        let reason = if approved {
            "all safety checks passed".to_string()
        } else {
            let failed: Vec<&str> = checks
                .iter()
                .filter(|c| !c.passed)
                .map(|c| c.name)
                .collect();
            format!("failed checks: {}", failed.join(", "))
        };

        info!(symbol = %symbol, approved, reason = %reason, "safety check");
        SafetyReport {
            approved,
            reason,
            checks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        BalanceSummary, CombinedBalance, MarketContext, OrderAck, RankedSymbol,
    };
    use crate::models::{Order, OrderBookTop, OrderStatus, Position, Quote, Side, Venue};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use chrono_tz::Asia::Seoul;

    struct StubBroker {
        balance: Option<CombinedBalance>,
    }

    #[async_trait]
    impl Brokerage for StubBroker {
        async fn current_price(&self, _symbol: &str) -> Result<Quote> {
            Err(anyhow!("unused"))
        }

        async fn orderbook_top(&self, _symbol: &str) -> Result<OrderBookTop> {
            Err(anyhow!("unused"))
        }

        async fn market_context(&self, _symbol: &str) -> Result<MarketContext> {
            Err(anyhow!("unused"))
        }

        async fn combined_balance(&self) -> Result<CombinedBalance> {
            self.balance.clone().ok_or_else(|| anyhow!("balance down"))
        }

        async fn place_order(
            &self,
            _side: Side,
            _symbol: &str,
            _qty: i64,
            _price: i64,
            _venue: Venue,
        ) -> Result<OrderAck> {
            Err(anyhow!("unused"))
        }

        async fn open_orders(&self) -> Result<Vec<Order>> {
            Ok(vec![])
        }

        async fn top_gainers(&self, _limit: usize) -> Result<Vec<RankedSymbol>> {
            Ok(vec![])
        }

        async fn top_volume(&self, _limit: usize) -> Result<Vec<RankedSymbol>> {
            Ok(vec![])
        }

        async fn stream_approval_key(&self) -> Result<String> {
            Ok("key".into())
        }
    }

    fn balance(equity: i64, pnl: f64) -> CombinedBalance {
        CombinedBalance {
            holdings: vec![],
            summary: BalanceSummary {
                cash: equity,
                orderable_cash: equity,
                total_equity: equity,
                realized_pnl_today: 0,
                cumulative_return_pct: pnl,
            },
        }
    }

    fn checker(db: &Db, balance: Option<CombinedBalance>) -> SafetyChecker {
        SafetyChecker::new(db.clone(), Arc::new(StubBroker { balance }))
    }

    fn monday_morning() -> DateTime<Tz> {
        // 2025-06-02 is a Monday.
        Seoul.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap()
    }

    fn hold(db: &Db, symbol: &str) {
        db.sync_positions(
            &db.positions()
                .unwrap()
                .into_iter()
                .chain(std::iter::once(Position {
                    symbol: symbol.into(),
                    name: symbol.into(),
                    quantity: 1,
                    avg_price: 10_000,
                    entered_at: Utc::now(),
                    max_price: 10_000,
                    partial_stage: 0,
                    pyramid_stage: 0,
                    strategy: "intraday".into(),
                }))
                .collect::<Vec<_>>(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn clean_state_passes_all_five_gates() {
        let db = Db::open_in_memory().unwrap();
        let checker = checker(&db, Some(balance(100_000_000, 1.0)));
        let report = checker
            .check_buy("005930", 10, 70_000, monday_morning())
            .await;
        assert!(report.approved);
        assert_eq!(report.checks.len(), 5);
    }

    #[tokio::test]
    async fn five_holdings_block_new_buys() {
        let db = Db::open_in_memory().unwrap();
        for i in 0..5 {
            hold(&db, &format!("SYM{i}"));
        }
        let checker = checker(&db, Some(balance(100_000_000, 1.0)));
        let report = checker
            .check_buy("005930", 10, 70_000, monday_morning())
            .await;
        assert!(!report.approved);
        assert!(report.reason.contains("holdings_count"));
    }

    #[tokio::test]
    async fn fourth_daily_order_is_refused() {
        let db = Db::open_in_memory().unwrap();
        let now = monday_morning();
        for i in 0..4 {
            db.record_order(&Order {
                order_no: format!("O{i}"),
                symbol: "005930".into(),
                name: "Samsung".into(),
                side: Side::Buy,
                venue: Venue::Krx,
                qty: 1,
                price: 0,
                status: OrderStatus::Filled,
                filled_qty: 1,
                avg_fill_price: 70_000,
                placed_at: now.with_timezone(&Utc),
                executed_at: None,
            })
            .unwrap();
        }
        let checker = checker(&db, Some(balance(100_000_000, 1.0)));
        let report = checker.check_buy("005930", 10, 70_000, now).await;
        assert!(!report.approved);
        assert!(report.reason.contains("daily_trades"));
    }

    #[test]
    fn friday_cutoff_boundaries() {
        assert!(friday_cutoff_ok(Weekday::Fri, 14, 29));
        assert!(!friday_cutoff_ok(Weekday::Fri, 14, 30));
        assert!(!friday_cutoff_ok(Weekday::Fri, 15, 0));
        assert!(friday_cutoff_ok(Weekday::Thu, 15, 0));
    }

    #[tokio::test]
    async fn account_loss_beyond_two_percent_blocks() {
        let db = Db::open_in_memory().unwrap();
        let checker = checker(&db, Some(balance(100_000_000, -2.5)));
        let report = checker
            .check_buy("005930", 10, 70_000, monday_morning())
            .await;
        assert!(!report.approved);
        assert!(report.reason.contains("account_loss"));
    }

    #[tokio::test]
    async fn oversized_order_fails_the_weight_gate() {
        let db = Db::open_in_memory().unwrap();
        let checker = checker(&db, Some(balance(10_000_000, 1.0)));
        // 20 x 70,000 = 1.4M on 10M equity = 14% > 10%.
        let report = checker
            .check_buy("005930", 20, 70_000, monday_morning())
            .await;
        assert!(!report.approved);
        assert!(report.reason.contains("position_weight"));
    }

    #[tokio::test]
    async fn broker_outage_passes_the_balance_gates() {
        let db = Db::open_in_memory().unwrap();
        let checker = checker(&db, None);
        let report = checker
            .check_buy("005930", 10, 70_000, monday_morning())
            .await;
        assert!(report.approved);
    }
}
