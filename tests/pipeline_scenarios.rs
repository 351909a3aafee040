//! End-to-end scenarios over the staged pipeline, driven by an in-memory
//! broker and canned reasoners. Each test wires the real gates together and
//! checks what reaches the (fake) wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use chrono_tz::Asia::Seoul;
use parking_lot::Mutex;

use horangi_backend::brain::analyzer::Analyzer;
use horangi_backend::brain::commander::CommanderGate;
use horangi_backend::brain::portfolio::PortfolioManager;
use horangi_backend::brain::safety::SafetyChecker;
use horangi_backend::brain::traps::TrapDetector;
use horangi_backend::brain::validator::ScenarioValidator;
use horangi_backend::broker::{
    BalanceSummary, Brokerage, CombinedBalance, Holding, MarketContext, OrderAck, RankedSymbol,
};
use horangi_backend::events::EventBus;
use horangi_backend::feedback::{ExitInfo, FeedbackEngine};
use horangi_backend::feeds::disclosures::DisclosureState;
use horangi_backend::feeds::macro_feed::MacroState;
use horangi_backend::feeds::news::NewsState;
use horangi_backend::llm::{Reasoner, ReasonerReply};
use horangi_backend::models::{
    DailyPick, Order, OrderBookTop, Quote, Regime, Side, Venue,
};
use horangi_backend::notify::Notifier;
use horangi_backend::orders::OrderService;
use horangi_backend::pipeline::IntradayPipeline;
use horangi_backend::storage::Db;

#[derive(Debug, Clone, PartialEq)]
struct PlacedOrder {
    side: Side,
    symbol: String,
    qty: i64,
    price: i64,
}

struct FakeBroker {
    cash: i64,
    equity: i64,
    pnl_pct: f64,
    holdings: Vec<Holding>,
    prices: HashMap<String, (i64, f64)>,
    contexts: HashMap<String, MarketContext>,
    placed: Mutex<Vec<PlacedOrder>>,
    next_order: AtomicUsize,
}

impl FakeBroker {
    fn new(cash: i64, equity: i64) -> Self {
        Self {
            cash,
            equity,
            pnl_pct: 0.0,
            holdings: vec![],
            prices: HashMap::new(),
            contexts: HashMap::new(),
            placed: Mutex::new(vec![]),
            next_order: AtomicUsize::new(1),
        }
    }

    fn with_price(mut self, symbol: &str, price: i64, change_pct: f64) -> Self {
        self.prices.insert(symbol.to_string(), (price, change_pct));
        self
    }

    fn with_context(mut self, symbol: &str, foreign_net: i64, inst_net: i64) -> Self {
        self.contexts.insert(
            symbol.to_string(),
            MarketContext {
                symbol: symbol.to_string(),
                volume_ratio: 1.0,
                foreign_net,
                inst_net,
                ..MarketContext::default()
            },
        );
        self
    }

    fn with_holding(mut self, symbol: &str, quantity: i64, avg_price: i64) -> Self {
        let current = self
            .prices
            .get(symbol)
            .map(|(p, _)| *p)
            .unwrap_or(avg_price);
        self.holdings.push(Holding {
            symbol: symbol.to_string(),
            name: format!("{symbol} Corp"),
            quantity,
            avg_price,
            current_price: current,
        });
        self
    }

    fn placed(&self) -> Vec<PlacedOrder> {
        self.placed.lock().clone()
    }
}

#[async_trait]
impl Brokerage for FakeBroker {
    async fn current_price(&self, symbol: &str) -> Result<Quote> {
        let (price, change_pct) = self
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("unknown symbol {symbol}"))?;
        Ok(Quote {
            symbol: symbol.to_string(),
            price,
            change_pct,
            volume: 1_000_000,
            ts: Utc::now(),
        })
    }

    async fn orderbook_top(&self, symbol: &str) -> Result<OrderBookTop> {
        let (price, _) = self
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("unknown symbol {symbol}"))?;
        Ok(OrderBookTop {
            symbol: symbol.to_string(),
            bid_price: price - 100,
            ask_price: price,
            bid_qty: 1_000,
            ask_qty: 1_000,
            ts: Utc::now(),
        })
    }

    async fn market_context(&self, symbol: &str) -> Result<MarketContext> {
        Ok(self
            .contexts
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| MarketContext {
                symbol: symbol.to_string(),
                ..MarketContext::default()
            }))
    }

    async fn combined_balance(&self) -> Result<CombinedBalance> {
        Ok(CombinedBalance {
            holdings: self.holdings.clone(),
            summary: BalanceSummary {
                cash: self.cash,
                orderable_cash: self.cash,
                total_equity: self.equity,
                realized_pnl_today: 0,
                cumulative_return_pct: self.pnl_pct,
            },
        })
    }

    async fn place_order(
        &self,
        side: Side,
        symbol: &str,
        qty: i64,
        price: i64,
        _venue: Venue,
    ) -> Result<OrderAck> {
        self.placed.lock().push(PlacedOrder {
            side,
            symbol: symbol.to_string(),
            qty,
            price,
        });
        let n = self.next_order.fetch_add(1, Ordering::SeqCst);
        Ok(OrderAck {
            order_no: format!("ORD{n:05}"),
        })
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
        Ok("approval".into())
    }
}

/// Commander replies with BUY, the risk reviewer approves, lessons come back
/// as plain JSON.
struct ScriptedReasoner;

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn chat(&self, _system: &str, _prompt: &str) -> Result<String> {
        Ok(r#"{"decision": "BUY", "confidence": 88, "reasoning": "setup is clean",
               "risk": "LOW", "veto_reason": null}"#
            .to_string())
    }

    async fn reason(&self, _system: &str, _prompt: &str) -> Result<ReasonerReply> {
        let answer = r#"{"approved": true, "confidence": 80, "reason": "numbers hold",
                         "lesson": "size down after gaps"}"#
            .to_string();
        Ok(ReasonerReply {
            reasoning: String::new(),
            answer: answer.clone(),
            raw: answer,
        })
    }
}

struct Env {
    db: Db,
    broker: Arc<FakeBroker>,
    feedback: Arc<FeedbackEngine>,
    macro_state: Arc<MacroState>,
    pipeline: Arc<IntradayPipeline>,
}

fn build_env(broker: FakeBroker) -> Env {
    let db = Db::open_in_memory().unwrap();
    let broker = Arc::new(broker);
    let reasoner: Arc<dyn Reasoner> = Arc::new(ScriptedReasoner);
    let bus = Arc::new(EventBus::new());
    let notifier = Arc::new(Notifier::disabled());
    let macro_state = MacroState::new();
    let disclosures = DisclosureState::new();
    let news = NewsState::new();

    let feedback = Arc::new(FeedbackEngine::new(
        db.clone(),
        reasoner.clone(),
        notifier.clone(),
    ));
    let orders = OrderService::new(broker.clone(), db.clone(), bus.clone(), notifier);
    let portfolio = Arc::new(PortfolioManager::new(
        db.clone(),
        orders.clone(),
        feedback.clone(),
    ));

    let pipeline = IntradayPipeline::new(
        db.clone(),
        broker.clone(),
        Analyzer::new(TrapDetector::new(db.clone()), reasoner.clone()),
        ScenarioValidator::with_seed(db.clone(), reasoner.clone(), 42),
        CommanderGate::new(reasoner.clone(), feedback.thresholds(), db.clone()),
        SafetyChecker::new(db.clone(), broker.clone()),
        portfolio,
        orders,
        bus,
        macro_state.clone(),
        disclosures,
        news,
    );

    // Pin the clock to a mid-session Monday so the weekday gates are inert.
    pipeline.override_clock(Seoul.with_ymd_and_hms(2025, 6, 2, 10, 30, 0).unwrap());

    Env {
        db,
        broker,
        feedback,
        macro_state,
        pipeline,
    }
}

fn seed_pick(db: &Db, symbol: &str, ai_score: i32, expected_entry: i64) {
    db.replace_daily_picks(
        Utc::now().date_naive(),
        &[DailyPick {
            date: Utc::now().date_naive(),
            rank: 1,
            symbol: symbol.to_string(),
            name: format!("{symbol} Corp"),
            ai_score,
            comment: "morning pick".into(),
            expected_entry,
        }],
    )
    .unwrap();
}

fn fail_exit(n: usize) -> ExitInfo {
    let date = Utc::now().date_naive();
    ExitInfo {
        symbol: format!("LOSS{n}"),
        entry_price: 100_000,
        exit_price: 96_000,
        entry_date: date,
        exit_date: date,
        exit_reason: "stop-loss".into(),
        quant_score: 70,
        ai_score: 70,
        final_score: 70,
    }
}

#[tokio::test]
async fn clean_buy_path_places_one_sized_order() {
    // Empty book, 10M cash, one candidate at quant 80 / ai 80.
    let broker = FakeBroker::new(10_000_000, 100_000_000)
        .with_price("005930", 50_000, 0.5)
        .with_context("005930", 120_000, 80_000);
    let env = build_env(broker);
    seed_pick(&env.db, "005930", 80, 50_000);

    let report = env.pipeline.run().await;

    assert!(report.ran);
    assert!(report.failure.is_none());
    assert_eq!(report.candidates, 1);
    assert_eq!(report.validated, 1);
    assert_eq!(report.buy_orders.len(), 1);

    // Stage order is exactly the six-stage sequence.
    let stages: Vec<&str> = report.timings.iter().map(|t| t.stage).collect();
    assert_eq!(
        stages,
        vec!["fetch", "persist", "analyze", "validate", "command", "execute"]
    );

    // qty = floor((10,000,000 / 5) / 50,000) = 40 at the current price.
    let placed = env.broker.placed();
    assert_eq!(
        placed,
        vec![PlacedOrder {
            side: Side::Buy,
            symbol: "005930".into(),
            qty: 40,
            price: 50_000,
        }]
    );

    // The commander decision is on the books.
    let decisions = env.db.decisions_on(Utc::now().date_naive()).unwrap();
    assert!(decisions.iter().any(|(s, a)| s == "005930" && a == "BUY"));

    // And the order row exists with a broker id.
    let order = env.db.order(&report.buy_orders[0]).unwrap().unwrap();
    assert_eq!(order.qty, 40);
}

#[tokio::test]
async fn uncertainty_gap_forces_hold_and_nothing_trades() {
    // quant 80 vs ai 45: |diff| = 35 forces hold at the analyze stage.
    let broker = FakeBroker::new(10_000_000, 100_000_000)
        .with_price("005930", 50_000, 0.5)
        .with_context("005930", 120_000, 80_000);
    let env = build_env(broker);
    seed_pick(&env.db, "005930", 45, 50_000);

    let report = env.pipeline.run().await;

    assert_eq!(report.candidates, 1);
    assert_eq!(report.validated, 0);
    assert!(report.buy_orders.is_empty());
    assert!(env.broker.placed().is_empty());
}

#[tokio::test]
async fn iron_shield_vetoes_an_overheated_score() {
    // quant 80 / ai 95 -> final 86 > 80, regime iron-shield.
    let broker = FakeBroker::new(10_000_000, 100_000_000)
        .with_price("005930", 50_000, 0.5)
        .with_context("005930", 120_000, 80_000);
    let env = build_env(broker);
    seed_pick(&env.db, "005930", 95, 50_000);
    env.macro_state.set_regime(Regime::IronShield);

    let report = env.pipeline.run().await;

    assert_eq!(report.validated, 1);
    assert!(report.buy_orders.is_empty());
    assert!(env.broker.placed().is_empty());

    let decisions = env.db.decisions_on(Utc::now().date_naive()).unwrap();
    assert!(decisions.iter().any(|(s, a)| s == "005930" && a == "HOLD"));
}

#[tokio::test]
async fn stop_loss_exit_sells_the_full_position_at_market() {
    // Held at avg 100,000; current 96,900 = -3.1%.
    let broker = FakeBroker::new(10_000_000, 100_000_000)
        .with_price("035720", 96_900, -3.1)
        .with_holding("035720", 10, 100_000);
    let env = build_env(broker);

    let report = env.pipeline.run().await;

    assert_eq!(report.sell_orders, 1);
    let placed = env.broker.placed();
    assert_eq!(
        placed,
        vec![PlacedOrder {
            side: Side::Sell,
            symbol: "035720".into(),
            qty: 10,
            price: 0,
        }]
    );
}

#[tokio::test]
async fn circuit_breaker_blocks_an_otherwise_clean_buy() {
    let broker = FakeBroker::new(10_000_000, 100_000_000)
        .with_price("005930", 50_000, 0.5)
        .with_context("005930", 120_000, 80_000);
    let env = build_env(broker);
    seed_pick(&env.db, "005930", 80, 50_000);

    // Three straight failures bump the acceptance threshold to 73.
    for n in 0..3 {
        env.feedback.process_trade_exit(fail_exit(n)).await;
    }
    assert_eq!(env.feedback.thresholds().min_score(), 73);

    // Two more arm the breaker.
    for n in 3..5 {
        env.feedback.process_trade_exit(fail_exit(n)).await;
    }
    assert!(env.feedback.thresholds().circuit_breaker_active());

    // The sixth attempt passes every validator but is refused.
    let report = env.pipeline.run().await;
    assert_eq!(report.validated, 1);
    assert!(report.buy_orders.is_empty());
    assert!(env.broker.placed().is_empty());

    // Settlement clears the latch and the same setup trades again.
    env.feedback.on_daily_settlement().await;
    assert!(!env.feedback.thresholds().circuit_breaker_active());
    let report = env.pipeline.run().await;
    assert_eq!(report.buy_orders.len(), 1);
}

#[tokio::test]
async fn concurrent_invocations_coalesce_to_one() {
    let broker = FakeBroker::new(10_000_000, 100_000_000)
        .with_price("005930", 50_000, 0.5)
        .with_context("005930", 120_000, 80_000);
    let env = build_env(broker);
    seed_pick(&env.db, "005930", 80, 50_000);

    let (a, b) = tokio::join!(env.pipeline.run(), env.pipeline.run());

    // Exactly one of the two ticks ran; the other was coalesced away.
    assert!(a.ran ^ b.ran);
    assert_eq!(env.broker.placed().len(), 1);
}
