//! Event-driven fetch dispatcher.
//!
//! Translates bus events into targeted single-symbol refreshes. The debounce
//! here is the minimum the whole system relies on: a symbol already being
//! fetched, or fetched less than ten seconds ago, is suppressed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::Brokerage;
use crate::events::{Event, EventHandler, EventKind};
use crate::storage::Db;
use crate::stream::StreamHandle;

pub const MIN_FETCH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Default)]
struct DispatchState {
    in_flight: HashSet<String>,
    last_started: HashMap<String, Instant>,
}

#[derive(Debug, Clone)]
pub struct DispatcherStatus {
    pub running: usize,
    pub running_symbols: Vec<String>,
    pub total_triggered: usize,
}

pub struct Dispatcher {
    state: Mutex<DispatchState>,
    broker: Arc<dyn Brokerage>,
    db: Db,
    stream: Option<StreamHandle>,
    /// Nudges the pipeline owner on a portfolio-wide recheck.
    recheck_tx: Option<mpsc::Sender<()>>,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn Brokerage>,
        db: Db,
        stream: Option<StreamHandle>,
        recheck_tx: Option<mpsc::Sender<()>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DispatchState::default()),
            broker,
            db,
            stream,
            recheck_tx,
        })
    }

    /// Claim the symbol for a fetch. False means suppressed: either a fetch
    /// is in flight or the last one started inside the debounce window.
    pub fn try_begin(&self, symbol: &str) -> bool {
        let mut state = self.state.lock();
        if state.in_flight.contains(symbol) {
            debug!(symbol = %symbol, "fetch already running, skipped");
            return false;
        }
        if let Some(started) = state.last_started.get(symbol) {
            if started.elapsed() < MIN_FETCH_INTERVAL {
                debug!(symbol = %symbol, "fetch throttled");
                return false;
            }
        }
        state.in_flight.insert(symbol.to_string());
        state.last_started.insert(symbol.to_string(), Instant::now());
        true
    }

    pub fn finish(&self, symbol: &str) {
        self.state.lock().in_flight.remove(symbol);
    }

    /// Trigger a single-symbol refresh. Runs in its own task; success or
    /// failure, the in-flight claim is released. No retry at this layer.
    pub fn trigger(self: &Arc<Self>, symbol: &str, reason: &str, priority: &str) -> bool {
        if !self.try_begin(symbol) {
            return false;
        }
        info!(symbol = %symbol, reason = %reason, priority = %priority, "fetch triggered");

        let this = self.clone();
        let symbol = symbol.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.fetch_single(&symbol).await {
                warn!(symbol = %symbol, error = %e, "fetch failed");
            }
            this.finish(&symbol);
        });
        true
    }

    async fn fetch_single(&self, symbol: &str) -> Result<()> {
        let quote = self.broker.current_price(symbol).await?;
        self.db.upsert_quote(&quote)?;
        match self.broker.orderbook_top(symbol).await {
            Ok(book) => self.db.upsert_orderbook(&book)?,
            Err(e) => debug!(symbol = %symbol, error = %e, "orderbook refresh skipped"),
        }
        match self.broker.market_context(symbol).await {
            Ok(context) => self.db.upsert_market_context(&context)?,
            Err(e) => debug!(symbol = %symbol, error = %e, "context refresh skipped"),
        }
        Ok(())
    }

    /// Regime shifts re-check the whole book instead of one symbol: realign
    /// priority-1 subscriptions with holdings and nudge the pipeline.
    pub async fn portfolio_recheck(&self, reason: &str) {
        warn!(reason = %reason, "market regime change, portfolio-wide recheck");
        if let Some(stream) = &self.stream {
            match self.db.positions() {
                Ok(positions) => {
                    let holdings = positions
                        .into_iter()
                        .map(|p| (p.symbol, p.name))
                        .collect::<Vec<_>>();
                    stream.sync_with_positions(holdings).await;
                }
                Err(e) => warn!(error = %e, "position read failed during recheck"),
            }
        }
        if let Some(tx) = &self.recheck_tx {
            let _ = tx.try_send(());
        }
    }

    pub fn status(&self) -> DispatcherStatus {
        let state = self.state.lock();
        DispatcherStatus {
            running: state.in_flight.len(),
            running_symbols: state.in_flight.iter().cloned().collect(),
            total_triggered: state.last_started.len(),
        }
    }
}

/// Bus adapter: one handler covering every kind the dispatcher reacts to.
pub struct DispatchEvents {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchEvents {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self { dispatcher })
    }

    pub const KINDS: [EventKind; 5] = [
        EventKind::ExecutionFill,
        EventKind::BreakingNews,
        EventKind::HotSymbol,
        EventKind::Disclosure,
        EventKind::RegimeChange,
    ];
}

#[async_trait]
impl EventHandler for DispatchEvents {
    fn name(&self) -> &str {
        "fetcher_dispatcher"
    }

    async fn handle(&self, event: Event) -> Result<()> {
        if event.kind == EventKind::RegimeChange {
            let reason = event
                .payload
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("regime change");
            self.dispatcher.portfolio_recheck(reason).await;
            return Ok(());
        }

        let Some(symbol) = event.symbol.as_deref() else {
            warn!(kind = event.kind.as_str(), "event without symbol, skipped");
            return Ok(());
        };
        let priority = match event.kind {
            EventKind::ExecutionFill | EventKind::BreakingNews => "HIGH",
            _ => "MEDIUM",
        };
        self.dispatcher.trigger(symbol, event.kind.as_str(), priority);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        BalanceSummary, CombinedBalance, MarketContext, OrderAck, RankedSymbol,
    };
    use crate::models::{Order, OrderBookTop, Quote, Side, Venue};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBroker {
        price_calls: AtomicUsize,
    }

    #[async_trait]
    impl Brokerage for CountingBroker {
        async fn current_price(&self, symbol: &str) -> Result<Quote> {
            self.price_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Quote {
                symbol: symbol.to_string(),
                price: 70_000,
                change_pct: 0.5,
                volume: 1_000,
                ts: Utc::now(),
            })
        }

        async fn orderbook_top(&self, symbol: &str) -> Result<OrderBookTop> {
            Ok(OrderBookTop {
                symbol: symbol.to_string(),
                bid_price: 69_900,
                ask_price: 70_000,
                bid_qty: 10,
                ask_qty: 10,
                ts: Utc::now(),
            })
        }

        async fn market_context(&self, symbol: &str) -> Result<MarketContext> {
            Ok(MarketContext {
                symbol: symbol.to_string(),
                ..MarketContext::default()
            })
        }

        async fn combined_balance(&self) -> Result<CombinedBalance> {
            Ok(CombinedBalance {
                holdings: vec![],
                summary: BalanceSummary {
                    cash: 0,
                    orderable_cash: 0,
                    total_equity: 0,
                    realized_pnl_today: 0,
                    cumulative_return_pct: 0.0,
                },
            })
        }

        async fn place_order(
            &self,
            _side: Side,
            _symbol: &str,
            _qty: i64,
            _price: i64,
            _venue: Venue,
        ) -> Result<OrderAck> {
            unreachable!("dispatcher never places orders")
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

    fn dispatcher() -> (Arc<Dispatcher>, Arc<CountingBroker>) {
        let broker = Arc::new(CountingBroker {
            price_calls: AtomicUsize::new(0),
        });
        let db = Db::open_in_memory().unwrap();
        (
            Dispatcher::new(broker.clone(), db, None, None),
            broker,
        )
    }

    #[test]
    fn second_claim_within_window_is_suppressed() {
        let (dispatcher, _) = dispatcher();
        assert!(dispatcher.try_begin("005930"));
        // In flight.
        assert!(!dispatcher.try_begin("005930"));
        dispatcher.finish("005930");
        // Finished but still inside the 10 s window.
        assert!(!dispatcher.try_begin("005930"));
        // A different symbol is unaffected.
        assert!(dispatcher.try_begin("035720"));
    }

    #[tokio::test]
    async fn burst_of_triggers_fetches_once() {
        let (dispatcher, broker) = dispatcher();
        for _ in 0..5 {
            dispatcher.trigger("005930", "breaking_news", "HIGH");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.price_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_writes_through_to_storage() {
        let broker = Arc::new(CountingBroker {
            price_calls: AtomicUsize::new(0),
        });
        let db = Db::open_in_memory().unwrap();
        let dispatcher = Dispatcher::new(broker, db.clone(), None, None);

        dispatcher.trigger("005930", "hot_symbol", "MEDIUM");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(db.latest_quote("005930").unwrap().unwrap().price, 70_000);
        assert!(db.latest_orderbook("005930").unwrap().is_some());
    }

    #[tokio::test]
    async fn status_reflects_in_flight_work() {
        let (dispatcher, _) = dispatcher();
        dispatcher.try_begin("005930");
        let status = dispatcher.status();
        assert_eq!(status.running, 1);
        assert_eq!(status.running_symbols, vec!["005930".to_string()]);
    }
}
