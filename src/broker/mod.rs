//! Brokerage interfaces.
//!
//! The rest of the process talks to the broker exclusively through the
//! `Brokerage` trait so the pipeline and its gates can run against in-memory
//! fakes in tests.

pub mod rest;

use crate::models::{Order, OrderBookTop, Quote, Side, Venue};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub name: String,
    pub quantity: i64,
    pub avg_price: i64,
    pub current_price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub cash: i64,
    pub orderable_cash: i64,
    pub total_equity: i64,
    pub realized_pnl_today: i64,
    pub cumulative_return_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedBalance {
    pub holdings: Vec<Holding>,
    pub summary: BalanceSummary,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_no: String,
}

/// One row of a market ranking scan (gainers / volume leaders).
#[derive(Debug, Clone)]
pub struct RankedSymbol {
    pub symbol: String,
    pub name: String,
    pub price: i64,
    pub change_pct: f64,
    pub volume: i64,
}

/// Daily tape context behind the trap detector and the quant score:
/// investor flows, session anchors and long moving averages. Fields an
/// endpoint cannot supply stay at their zero defaults.
#[derive(Debug, Clone, Default)]
pub struct MarketContext {
    pub symbol: String,
    pub open_price: i64,
    pub prev_close: i64,
    pub volume_ratio: f64,
    pub foreign_net: i64,
    pub inst_net: i64,
    pub program_net: i64,
    pub program_slope: f64,
    pub sector_name: String,
    pub sector_change_pct: f64,
    pub ma120: i64,
    pub ma200: i64,
}

#[async_trait]
pub trait Brokerage: Send + Sync {
    async fn current_price(&self, symbol: &str) -> Result<Quote>;
    async fn orderbook_top(&self, symbol: &str) -> Result<OrderBookTop>;
    async fn market_context(&self, symbol: &str) -> Result<MarketContext>;
    async fn combined_balance(&self) -> Result<CombinedBalance>;
    async fn place_order(
        &self,
        side: Side,
        symbol: &str,
        qty: i64,
        price: i64,
        venue: Venue,
    ) -> Result<OrderAck>;
    async fn open_orders(&self) -> Result<Vec<Order>>;
    async fn top_gainers(&self, limit: usize) -> Result<Vec<RankedSymbol>>;
    async fn top_volume(&self, limit: usize) -> Result<Vec<RankedSymbol>>;
    /// Ephemeral stream handshake key; fetched fresh on every connect.
    async fn stream_approval_key(&self) -> Result<String>;
}

/// The alternate venue rejects market orders, so a price of 0 there is
/// replaced with the best opposite-side quote.
pub fn resolve_order_price(venue: Venue, side: Side, price: i64, book: &OrderBookTop) -> i64 {
    if price != 0 || venue != Venue::Nxt {
        return price;
    }
    match side {
        Side::Buy => book.ask_price,
        Side::Sell => book.bid_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn book() -> OrderBookTop {
        OrderBookTop {
            symbol: "005930".into(),
            bid_price: 69_900,
            ask_price: 70_000,
            bid_qty: 100,
            ask_qty: 100,
            ts: Utc::now(),
        }
    }

    #[test]
    fn market_order_on_alternate_venue_takes_opposite_side() {
        let book = book();
        assert_eq!(resolve_order_price(Venue::Nxt, Side::Buy, 0, &book), 70_000);
        assert_eq!(resolve_order_price(Venue::Nxt, Side::Sell, 0, &book), 69_900);
    }

    #[test]
    fn limit_orders_and_primary_venue_pass_through() {
        let book = book();
        assert_eq!(resolve_order_price(Venue::Krx, Side::Buy, 0, &book), 0);
        assert_eq!(
            resolve_order_price(Venue::Nxt, Side::Buy, 68_000, &book),
            68_000
        );
    }
}
