//! The six-stage decision pipeline.
//!
//! One invocation walks Fetch -> Persist -> Analyze -> Validate -> Command
//! -> Execute in strict order. A stage failure short-circuits the rest of
//! that invocation and is reported in the result; the next tick starts
//! clean. At most one invocation is ever in flight, so a tick landing while
//! the previous run is still working is coalesced away.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use chrono_tz::Asia::Seoul;
use tracing::{debug, info, warn};

use crate::brain::analyzer::{Analyzer, Candidate};
use crate::brain::commander::CommanderGate;
use crate::brain::portfolio::PortfolioManager;
use crate::brain::safety::SafetyChecker;
use crate::brain::traps::TrapInput;
use crate::brain::validator::ScenarioValidator;
use crate::broker::{Brokerage, CombinedBalance};
use crate::events::{Event, EventBus, EventKind};
use crate::feeds::disclosures::DisclosureState;
use crate::feeds::macro_feed::MacroState;
use crate::feeds::news::NewsState;
use crate::models::{
    AccountSnapshot, Decision, Position, Side, TradeAction, TradeSignal, ValidationVerdict, Venue,
};
use crate::orders::OrderService;
use crate::storage::Db;

/// Available cash is split evenly across this many prospective entries.
pub const BUDGET_SPLIT: i64 = 5;
const CANDIDATE_LIMIT: usize = 10;
const MIN_ORDERABLE_CASH: i64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct StageTiming {
    pub stage: &'static str,
    pub ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// False when this tick was coalesced into a still-running invocation.
    pub ran: bool,
    pub candidates: usize,
    pub validated: usize,
    pub buy_orders: Vec<String>,
    pub sell_orders: usize,
    pub timings: Vec<StageTiming>,
    pub failure: Option<(&'static str, String)>,
}

pub struct IntradayPipeline {
    db: Db,
    broker: Arc<dyn Brokerage>,
    analyzer: Analyzer,
    validator: ScenarioValidator,
    commander: CommanderGate,
    safety: SafetyChecker,
    portfolio: Arc<PortfolioManager>,
    orders: Arc<OrderService>,
    bus: Arc<EventBus>,
    macro_state: Arc<MacroState>,
    disclosures: Arc<DisclosureState>,
    news: Arc<NewsState>,
    running: tokio::sync::Mutex<()>,
    /// Fixed wall clock for deterministic replays; None follows real time.
    clock_override: parking_lot::RwLock<Option<chrono::DateTime<chrono_tz::Tz>>>,
}

impl IntradayPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        broker: Arc<dyn Brokerage>,
        analyzer: Analyzer,
        validator: ScenarioValidator,
        commander: CommanderGate,
        safety: SafetyChecker,
        portfolio: Arc<PortfolioManager>,
        orders: Arc<OrderService>,
        bus: Arc<EventBus>,
        macro_state: Arc<MacroState>,
        disclosures: Arc<DisclosureState>,
        news: Arc<NewsState>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            broker,
            analyzer,
            validator,
            commander,
            safety,
            portfolio,
            orders,
            bus,
            macro_state,
            disclosures,
            news,
            running: tokio::sync::Mutex::new(()),
            clock_override: parking_lot::RwLock::new(None),
        })
    }

    pub fn override_clock(&self, now: chrono::DateTime<chrono_tz::Tz>) {
        *self.clock_override.write() = Some(now);
    }

    fn now_seoul(&self) -> chrono::DateTime<chrono_tz::Tz> {
        self.clock_override
            .read()
            .clone()
            .unwrap_or_else(|| Utc::now().with_timezone(&Seoul))
    }

    /// True when no invocation currently holds the run lock; used by the
    /// shutdown drain.
    pub fn run_lock_free(&self) -> bool {
        self.running.try_lock().is_ok()
    }

    pub async fn run(&self) -> PipelineReport {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("pipeline tick coalesced, previous invocation still running");
            return PipelineReport::default();
        };

        let mut report = PipelineReport {
            ran: true,
            ..Default::default()
        };
        info!("pipeline invocation started");

        // 1. Fetch: refresh everything downstream stages will read.
        let started = Instant::now();
        let balance = match self.fetch_stage().await {
            Ok(balance) => balance,
            Err(e) => return self.fail(report, "fetch", started, e),
        };
        push_timing(&mut report, "fetch", started);

        // 2. Persist: the fence; stage-3 reads must see stage-1 effects.
        let started = Instant::now();
        if let Err(e) = self.persist_stage(&balance) {
            return self.fail(report, "persist", started, e);
        }
        push_timing(&mut report, "persist", started);

        // 3. Analyze: score candidates, keep the buys.
        let started = Instant::now();
        let signals = self.analyze_stage(&mut report).await;
        push_timing(&mut report, "analyze", started);

        // 4. Validate: the three-method risk gate.
        let started = Instant::now();
        let mut validated = Vec::with_capacity(signals.len());
        for signal in signals {
            let verdict = self.validator.validate(&signal).await;
            if verdict.approved {
                validated.push((signal, verdict));
            } else {
                debug!(symbol = %signal.symbol, reason = %verdict.reason, "validation reject");
            }
        }
        report.validated = validated.len();
        push_timing(&mut report, "validate", started);

        // 5. Command: final approval per candidate.
        let started = Instant::now();
        let regime = self.macro_state.regime();
        let mut approved = Vec::with_capacity(validated.len());
        for (signal, verdict) in validated {
            let decision = self.commander.decide(&signal, &verdict, regime).await;
            if decision.action == TradeAction::Buy {
                approved.push((signal, verdict, decision));
            }
        }
        push_timing(&mut report, "command", started);

        // 6. Execute: exits first, then the approved buys.
        let started = Instant::now();
        self.execute_stage(&balance, approved, &mut report).await;
        push_timing(&mut report, "execute", started);

        info!(
            candidates = report.candidates,
            validated = report.validated,
            buys = report.buy_orders.len(),
            sells = report.sell_orders,
            "pipeline invocation complete"
        );
        self.bus
            .publish(Event::new(
                EventKind::PipelineComplete,
                None,
                serde_json::json!({
                    "candidates": report.candidates,
                    "validated": report.validated,
                    "buys": report.buy_orders.len(),
                    "sells": report.sell_orders,
                }),
            ))
            .await;
        report
    }

    fn fail(
        &self,
        mut report: PipelineReport,
        stage: &'static str,
        started: Instant,
        error: anyhow::Error,
    ) -> PipelineReport {
        push_timing(&mut report, stage, started);
        warn!(stage, error = %error, "pipeline short-circuited");
        report.failure = Some((stage, error.to_string()));
        report
    }

    /// Balance and holdings from the broker, pending order acks, and fresh
    /// quotes for every symbol the later stages will look at.
    async fn fetch_stage(&self) -> Result<CombinedBalance> {
        let balance = self
            .broker
            .combined_balance()
            .await
            .context("combined balance")?;

        let now = Utc::now();
        let holdings: Vec<Position> = balance
            .holdings
            .iter()
            .map(|h| Position {
                symbol: h.symbol.clone(),
                name: h.name.clone(),
                quantity: h.quantity,
                avg_price: h.avg_price,
                entered_at: now,
                max_price: h.current_price.max(h.avg_price),
                partial_stage: 0,
                pyramid_stage: 0,
                strategy: "intraday".into(),
            })
            .collect();
        self.db.sync_positions(&holdings).context("position sync")?;

        match self.broker.open_orders().await {
            Ok(open) => {
                for order in open {
                    if self.db.order(&order.order_no).ok().flatten().is_none() {
                        self.db.record_order(&order)?;
                    }
                }
            }
            Err(e) => debug!(error = %e, "open order sync skipped"),
        }

        let mut symbols: Vec<String> = holdings.iter().map(|p| p.symbol.clone()).collect();
        for pick in self
            .db
            .daily_picks_for(now.date_naive(), CANDIDATE_LIMIT)
            .unwrap_or_default()
        {
            if !symbols.contains(&pick.symbol) {
                symbols.push(pick.symbol);
            }
        }
        for symbol in symbols {
            match self.broker.current_price(&symbol).await {
                Ok(quote) => self.db.upsert_quote(&quote)?,
                Err(e) => debug!(symbol = %symbol, error = %e, "quote refresh failed"),
            }
            if let Ok(book) = self.broker.orderbook_top(&symbol).await {
                self.db.upsert_orderbook(&book)?;
            }
            if let Ok(context) = self.broker.market_context(&symbol).await {
                self.db.upsert_market_context(&context)?;
            }
        }

        Ok(balance)
    }

    /// Commit the snapshot and verify read-your-writes before analysis runs.
    fn persist_stage(&self, balance: &CombinedBalance) -> Result<()> {
        let snapshot = AccountSnapshot {
            ts: Utc::now(),
            cash: balance.summary.cash,
            total_equity: balance.summary.total_equity,
            realized_pnl_today: balance.summary.realized_pnl_today,
            cumulative_return_pct: balance.summary.cumulative_return_pct,
        };
        self.db
            .insert_account_snapshot(&snapshot)
            .context("account snapshot")?;
        self.db
            .latest_account_snapshot()
            .context("snapshot read-back")?
            .context("snapshot missing after write")?;
        Ok(())
    }

    async fn analyze_stage(&self, report: &mut PipelineReport) -> Vec<TradeSignal> {
        let today = Utc::now().date_naive();
        let picks = self.db.daily_picks_for(today, CANDIDATE_LIMIT).unwrap_or_default();
        report.candidates = picks.len();

        let mut seen = HashSet::new();
        let mut signals = Vec::new();
        for pick in picks {
            if !seen.insert(pick.symbol.clone()) {
                continue;
            }
            let quote = self.db.latest_quote(&pick.symbol).ok().flatten();
            let current_price = quote
                .as_ref()
                .map(|q| q.price)
                .filter(|p| *p > 0)
                .unwrap_or(pick.expected_entry);
            if current_price <= 0 {
                continue;
            }

            let candidate = Candidate {
                symbol: pick.symbol.clone(),
                name: pick.name.clone(),
                current_price,
                prior_ai_score: Some(pick.ai_score),
                source: "daily_picks".into(),
            };
            let input = self.trap_input(&pick.symbol, current_price);
            let signal = self.analyzer.analyze(&candidate, &input).await;

            if signal.action == TradeAction::Buy {
                signals.push(signal);
            } else {
                // A trap that kept us out gets scored at settlement.
                if let Some(top_trap) = signal.traps.first() {
                    if let Err(e) = self.db.insert_trap_avoidance(
                        &signal.symbol,
                        top_trap.kind,
                        signal.current_price,
                    ) {
                        warn!(symbol = %signal.symbol, error = %e, "avoidance not recorded");
                    }
                }
                debug!(
                    symbol = %pick.symbol,
                    action = signal.action.as_str(),
                    final_score = signal.final_score,
                    "candidate not a buy"
                );
            }
        }
        signals
    }

    fn trap_input(&self, symbol: &str, current_price: i64) -> TrapInput {
        let quote = self.db.latest_quote(symbol).ok().flatten();
        let book = self.db.latest_orderbook(symbol).ok().flatten();
        let context = self
            .db
            .latest_market_context(symbol)
            .ok()
            .flatten()
            .unwrap_or_default();
        let snapshot = self.macro_state.snapshot();

        TrapInput {
            symbol: symbol.to_string(),
            current_price,
            change_pct: quote.as_ref().map(|q| q.change_pct).unwrap_or(0.0),
            open_price: context.open_price,
            prev_close: context.prev_close,
            volume_ratio: context.volume_ratio,
            avg_volume: quote.as_ref().map(|q| q.volume).unwrap_or(0),
            foreign_net: context.foreign_net,
            inst_net: context.inst_net,
            program_net: context.program_net,
            program_slope: context.program_slope,
            has_positive_news: self.news.has_recent_positive(symbol, Utc::now()),
            ask_qty_top2: book.as_ref().map(|b| b.ask_qty).unwrap_or(0),
            sector_name: context.sector_name,
            sector_change_pct: context.sector_change_pct,
            fx_rate: snapshot.usdkrw,
            fx_change_pct: snapshot.usdkrw_change_pct,
            ma120: context.ma120,
            ma200: context.ma200,
            dilution_day: self.disclosures.has_dilution(symbol),
        }
    }

    async fn execute_stage(
        &self,
        balance: &CombinedBalance,
        approved: Vec<(TradeSignal, ValidationVerdict, Decision)>,
        report: &mut PipelineReport,
    ) {
        // Exits run first so freed cash and slots are accounted for.
        let cycle = self.portfolio.run_cycle().await;
        report.sell_orders = cycle.sells();

        let cash = balance.summary.orderable_cash;
        if cash < MIN_ORDERABLE_CASH {
            if !approved.is_empty() {
                info!(cash, "orderable cash below minimum, buys skipped");
            }
            return;
        }
        let budget = cash / BUDGET_SPLIT;
        let now = self.now_seoul();

        // In-run idempotence: one submission per logical (symbol, side).
        let mut submitted: HashSet<String> = HashSet::new();
        for (signal, _verdict, decision) in approved {
            if !submitted.insert(signal.symbol.clone()) {
                debug!(symbol = %signal.symbol, "duplicate candidate, skipped");
                continue;
            }
            let price = signal.current_price;
            if price <= 0 {
                continue;
            }
            let qty = budget / price;
            if qty <= 0 {
                debug!(symbol = %signal.symbol, budget, price, "budget too small for one share");
                continue;
            }

            let safety = self.safety.check_buy(&signal.symbol, qty, price, now).await;
            if !safety.approved {
                info!(symbol = %signal.symbol, reason = %safety.reason, "buy blocked by safety check");
                continue;
            }

            match self
                .orders
                .place(
                    Side::Buy,
                    &signal.symbol,
                    &signal.name,
                    qty,
                    price,
                    Venue::Krx,
                    &format!("pipeline-buy ({})", decision.reasoning),
                )
                .await
            {
                Ok(order) => {
                    let _ = self
                        .db
                        .mark_pick_executed(Utc::now().date_naive(), &signal.symbol);
                    report.buy_orders.push(order.order_no);
                }
                Err(e) => warn!(symbol = %signal.symbol, error = %e, "buy submission failed"),
            }
        }
    }
}

fn push_timing(report: &mut PipelineReport, stage: &'static str, started: Instant) {
    report.timings.push(StageTiming {
        stage,
        ms: started.elapsed().as_millis() as u64,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_report_marks_a_coalesced_tick() {
        let report = PipelineReport::default();
        assert!(!report.ran);
        assert!(report.timings.is_empty());
    }
}
