//! Order submission path shared by the pipeline's execute stage and the
//! portfolio manager. Places the order at the broker, records it, announces
//! it on the bus and tells the operator. Fills arrive later through the
//! execution-notice stream and are applied by the storage layer.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::broker::Brokerage;
use crate::events::{Event, EventBus, EventKind};
use crate::models::{Order, OrderStatus, Side, Venue};
use crate::notify::Notifier;
use crate::storage::Db;

pub struct OrderService {
    broker: Arc<dyn Brokerage>,
    db: Db,
    bus: Arc<EventBus>,
    notifier: Arc<Notifier>,
}

impl OrderService {
    pub fn new(
        broker: Arc<dyn Brokerage>,
        db: Db,
        bus: Arc<EventBus>,
        notifier: Arc<Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            db,
            bus,
            notifier,
        })
    }

    /// Submit one order. A price of 0 is a market order (the broker layer
    /// substitutes a limit on the alternate venue).
    pub async fn place(
        &self,
        side: Side,
        symbol: &str,
        name: &str,
        qty: i64,
        price: i64,
        venue: Venue,
        reason: &str,
    ) -> Result<Order> {
        let ack = self
            .broker
            .place_order(side, symbol, qty, price, venue)
            .await
            .with_context(|| format!("place {} {}", side.as_str(), symbol))?;

        let order = Order {
            order_no: ack.order_no,
            symbol: symbol.to_string(),
            name: name.to_string(),
            side,
            venue,
            qty,
            price,
            status: OrderStatus::Pending,
            filled_qty: 0,
            avg_fill_price: 0,
            placed_at: Utc::now(),
            executed_at: None,
        };
        self.db.record_order(&order)?;

        info!(
            symbol = %symbol,
            side = side.as_str(),
            qty,
            price,
            reason = %reason,
            order_no = %order.order_no,
            "order submitted"
        );

        self.bus
            .publish(Event::new(
                EventKind::OrderSubmitted,
                Some(symbol),
                serde_json::json!({
                    "order_no": order.order_no,
                    "side": side.as_str(),
                    "qty": qty,
                    "price": price,
                    "reason": reason,
                }),
            ))
            .await;

        self.notifier
            .send(&format!(
                "{} {} x{} @ {} ({})",
                side.as_str(),
                name,
                qty,
                if price == 0 { "market".to_string() } else { price.to_string() },
                reason
            ))
            .await;

        Ok(order)
    }
}
