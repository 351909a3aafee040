//! Horangi - Event-Driven Trading Core for the Korean Equities Market
//! Mission: coordinate fetchers, gates and the broker under hard deadlines
//!
//! One long-running process: the scheduler and the event bus are the two
//! entry points, the six-stage pipeline is the heart, and everything shares
//! a single sqlite store. `start` runs until interrupted; `init` seeds the
//! store from the broker before first use.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use horangi_backend::brain::analyzer::Analyzer;
use horangi_backend::brain::commander::CommanderGate;
use horangi_backend::brain::daily::DailyAnalyzer;
use horangi_backend::brain::portfolio::PortfolioManager;
use horangi_backend::brain::safety::SafetyChecker;
use horangi_backend::brain::traps::TrapDetector;
use horangi_backend::brain::validator::ScenarioValidator;
use horangi_backend::broker::rest::KisRest;
use horangi_backend::broker::Brokerage;
use horangi_backend::dispatcher::{DispatchEvents, Dispatcher};
use horangi_backend::events::{Event, EventBus, EventHandler, EventKind};
use horangi_backend::feedback::FeedbackEngine;
use horangi_backend::feeds::disclosures::{DisclosureFeed, DisclosureState};
use horangi_backend::feeds::macro_feed::{MacroFeed, MacroState};
use horangi_backend::feeds::news::{NewsFeed, NewsState};
use horangi_backend::llm::HttpReasoner;
use horangi_backend::models::{Config, Execution, Position, Side};
use horangi_backend::notify::Notifier;
use horangi_backend::orders::OrderService;
use horangi_backend::pipeline::IntradayPipeline;
use horangi_backend::scanner::MarketScanner;
use horangi_backend::scheduler::{hm, intraday_bands, Cadence, Job, Scheduler};
use horangi_backend::storage::Db;
use horangi_backend::stream::{StreamHandle, StreamManager};

const EXIT_OK: i32 = 0;
const EXIT_INIT_FAILURE: i32 = 1;
const EXIT_INTERRUPT: i32 = 130;

const PIPELINE_DRAIN: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "horangi", about = "Automated trading core for the Korean stock market")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading process until interrupted.
    Start,
    /// Signal a running process to shut down.
    Stop,
    /// Print a snapshot of the running state.
    Status,
    /// Seed the store from the broker and verify a clean slate.
    Init,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(EXIT_INIT_FAILURE);
        }
    };

    let code = match cli.command {
        Command::Start => run_start(config).await,
        Command::Stop => run_stop(&config),
        Command::Status => run_status(&config).await,
        Command::Init => run_init(&config).await,
    };
    std::process::exit(code);
}

/// Applies execution-notice frames from the stream: one transaction per
/// fill, a feedback call once a sell reduces a position, and a priority-1
/// resync so the slot table keeps tracking the book.
struct ExecutionApply {
    db: Db,
    portfolio: Arc<PortfolioManager>,
    stream: StreamHandle,
}

#[async_trait]
impl EventHandler for ExecutionApply {
    fn name(&self) -> &str {
        "execution_apply"
    }

    async fn handle(&self, event: Event) -> Result<()> {
        let text = |key: &str| {
            event
                .payload
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };
        let num = |key: &str| text(key).parse::<i64>().unwrap_or(0);

        let order_no = text("odno");
        let qty = num("cntg_qty");
        let price = num("cntg_unpr");
        if order_no.is_empty() || qty <= 0 || price <= 0 {
            warn!("execution notice missing fields, dropped");
            return Ok(());
        }

        let order = self.db.order(&order_no)?;
        let prior_position = match &order {
            Some(order) if order.side == Side::Sell => self.db.position(&order.symbol)?,
            _ => None,
        };

        let applied = self.db.apply_execution(&Execution {
            order_no: order_no.clone(),
            qty,
            price,
            amount: qty * price,
            ts: Utc::now(),
        })?;

        if applied {
            if let Some(position) = prior_position {
                self.portfolio
                    .on_sell_filled(&position, price, "stream-fill")
                    .await;
            }
            let holdings: Vec<(String, String)> = self
                .db
                .positions()?
                .into_iter()
                .map(|p| (p.symbol, p.name))
                .collect();
            self.stream.sync_with_positions(holdings).await;
        }
        Ok(())
    }
}

struct PipelineJob {
    pipeline: Arc<IntradayPipeline>,
    bus: Arc<EventBus>,
}

#[async_trait]
impl Job for PipelineJob {
    async fn run(&self) {
        self.bus
            .publish(Event::new(
                EventKind::ScheduleTick,
                None,
                serde_json::json!({"job": "intraday_pipeline"}),
            ))
            .await;
        let report = self.pipeline.run().await;
        if let Some((stage, reason)) = &report.failure {
            warn!(stage, reason = %reason, "pipeline run failed");
        }
    }
}

struct PortfolioJob {
    portfolio: Arc<PortfolioManager>,
}

#[async_trait]
impl Job for PortfolioJob {
    async fn run(&self) {
        let report = self.portfolio.run_cycle().await;
        if report.errors > 0 {
            warn!(errors = report.errors, "portfolio cycle finished with errors");
        }
    }
}

struct ScannerJob {
    scanner: Arc<MarketScanner>,
}

#[async_trait]
impl Job for ScannerJob {
    async fn run(&self) {
        self.scanner.run_once().await;
    }
}

struct DailyAnalysisJob {
    daily: Arc<DailyAnalyzer>,
}

#[async_trait]
impl Job for DailyAnalysisJob {
    async fn run(&self) {
        let picks = self.daily.run().await;
        info!(picks, "daily deep analysis job finished");
    }
}

struct SettlementJob {
    feedback: Arc<FeedbackEngine>,
    disclosures: Arc<DisclosureState>,
    news: Arc<NewsState>,
}

#[async_trait]
impl Job for SettlementJob {
    async fn run(&self) {
        self.feedback.on_daily_settlement().await;
        self.disclosures.clear();
        self.news.clear();
    }
}

async fn run_start(config: Config) -> i32 {
    info!("🚀 horangi starting");

    let db = match Db::open(&config.database_path) {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "store unreachable at startup");
            return EXIT_INIT_FAILURE;
        }
    };
    if let Err(e) = std::fs::write(&config.pid_file, std::process::id().to_string()) {
        warn!(error = %e, "pid file not written");
    }

    let broker: Arc<dyn Brokerage> = match KisRest::new(&config) {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            error!(error = %e, "broker client init failed");
            return EXIT_INIT_FAILURE;
        }
    };
    let reasoner = match HttpReasoner::new(&config) {
        Ok(reasoner) => Arc::new(reasoner),
        Err(e) => {
            error!(error = %e, "reasoner client init failed");
            return EXIT_INIT_FAILURE;
        }
    };

    let bus = Arc::new(EventBus::new());
    let notifier = Arc::new(Notifier::new(&config));
    let macro_state = MacroState::new();
    let disclosure_state = DisclosureState::new();
    let news_state = NewsState::new();

    let feedback = Arc::new(FeedbackEngine::new(
        db.clone(),
        reasoner.clone(),
        notifier.clone(),
    ));
    let thresholds = feedback.thresholds();

    let orders = OrderService::new(broker.clone(), db.clone(), bus.clone(), notifier.clone());
    let portfolio = Arc::new(PortfolioManager::new(
        db.clone(),
        orders.clone(),
        feedback.clone(),
    ));

    // Stream manager owns the websocket and the slot table.
    let stream: StreamHandle = StreamManager::spawn(
        config.clone(),
        broker.clone(),
        db.clone(),
        bus.clone(),
        notifier.clone(),
    );

    let pipeline = IntradayPipeline::new(
        db.clone(),
        broker.clone(),
        Analyzer::new(TrapDetector::new(db.clone()), reasoner.clone()),
        ScenarioValidator::new(db.clone(), reasoner.clone()),
        CommanderGate::new(reasoner.clone(), thresholds.clone(), db.clone()),
        SafetyChecker::new(db.clone(), broker.clone()),
        portfolio.clone(),
        orders.clone(),
        bus.clone(),
        macro_state.clone(),
        disclosure_state.clone(),
        news_state.clone(),
    );

    // Event wiring: execution fills apply to the store, then the dispatcher
    // reacts to everything symbol-shaped.
    bus.subscribe(
        EventKind::ExecutionFill,
        Arc::new(ExecutionApply {
            db: db.clone(),
            portfolio: portfolio.clone(),
            stream: stream.clone(),
        }),
    );

    let (recheck_tx, mut recheck_rx) = mpsc::channel::<()>(4);
    let dispatcher = Dispatcher::new(
        broker.clone(),
        db.clone(),
        Some(stream.clone()),
        Some(recheck_tx),
    );
    let dispatch_events = DispatchEvents::new(dispatcher.clone());
    for kind in DispatchEvents::KINDS {
        bus.subscribe(kind, dispatch_events.clone());
    }

    // Regime rechecks nudge an extra pipeline invocation.
    {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            while recheck_rx.recv().await.is_some() {
                pipeline.run().await;
            }
        });
    }

    // Feed pollers.
    let disclosure_feed =
        DisclosureFeed::new(&config, disclosure_state.clone(), bus.clone());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            disclosure_feed.poll_once().await;
        }
    });

    let news_feed = NewsFeed::new(&config, news_state.clone(), bus.clone());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            news_feed.poll_once().await;
        }
    });

    let macro_feed = MacroFeed::new(macro_state.clone(), bus.clone());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            macro_feed.poll_once().await;
        }
    });

    // Align priority-1 subscriptions with whatever we already hold.
    match db.positions() {
        Ok(positions) => {
            let holdings: Vec<(String, String)> = positions
                .into_iter()
                .map(|p: Position| (p.symbol, p.name))
                .collect();
            stream.sync_with_positions(holdings).await;
        }
        Err(e) => warn!(error = %e, "initial position sync skipped"),
    }

    // Job table: the declarative heart of the schedule.
    let scheduler = Arc::new(Scheduler::new());
    scheduler.register(
        "daily_deep_analysis",
        Cadence::DailyAt { minute_of_day: hm(7, 20) },
        Arc::new(DailyAnalysisJob {
            daily: Arc::new(DailyAnalyzer::new(
                db.clone(),
                broker.clone(),
                reasoner.clone(),
                Some(stream.clone()),
            )),
        }),
    );
    scheduler.register(
        "market_scanner",
        Cadence::EveryMinute { start: hm(9, 0), end: hm(15, 20) },
        Arc::new(ScannerJob {
            scanner: Arc::new(MarketScanner::new(
                broker.clone(),
                reasoner.clone(),
                bus.clone(),
                Some(stream.clone()),
            )),
        }),
    );
    scheduler.register(
        "portfolio_manager",
        Cadence::EveryMinute { start: hm(9, 0), end: hm(15, 30) },
        Arc::new(PortfolioJob {
            portfolio: portfolio.clone(),
        }),
    );
    scheduler.register(
        "intraday_pipeline",
        intraday_bands(),
        Arc::new(PipelineJob {
            pipeline: pipeline.clone(),
            bus: bus.clone(),
        }),
    );
    scheduler.register(
        "daily_settlement",
        Cadence::DailyAt { minute_of_day: hm(16, 0) },
        Arc::new(SettlementJob {
            feedback: feedback.clone(),
            disclosures: disclosure_state.clone(),
            news: news_state.clone(),
        }),
    );
    let scheduler_handle = scheduler.start();

    info!("✅ horangi running; ctrl-c to stop");
    wait_for_shutdown().await;
    info!("shutting down");

    // Shutdown order: no new jobs, then the stream, then a bounded pipeline
    // drain, then the store goes away with the process.
    scheduler.stop();
    let _ = scheduler_handle.await;
    stream.stop().await;

    let drained = tokio::time::timeout(PIPELINE_DRAIN, async {
        loop {
            if pipeline.run_lock_free() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("pipeline did not drain within 30s, exiting anyway");
    }

    let _ = std::fs::remove_file(&config.pid_file);
    EXIT_INTERRUPT
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn run_stop(config: &Config) -> i32 {
    let pid = match std::fs::read_to_string(&config.pid_file) {
        Ok(pid) => pid.trim().to_string(),
        Err(_) => {
            eprintln!("no pid file at {}; is the process running?", config.pid_file);
            return EXIT_INIT_FAILURE;
        }
    };
    match std::process::Command::new("kill").arg(&pid).status() {
        Ok(status) if status.success() => {
            println!("sent shutdown signal to pid {pid}");
            EXIT_OK
        }
        _ => {
            eprintln!("failed to signal pid {pid}");
            EXIT_INIT_FAILURE
        }
    }
}

async fn run_status(config: &Config) -> i32 {
    let db = match Db::open(&config.database_path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("store unreachable: {e}");
            return EXIT_INIT_FAILURE;
        }
    };

    let running = std::fs::read_to_string(&config.pid_file).is_ok();
    println!("process: {}", if running { "running" } else { "stopped" });

    match db.positions() {
        Ok(positions) => {
            println!("positions: {}", positions.len());
            for pos in positions {
                println!(
                    "  {} {} x{} @ {} (max {})",
                    pos.symbol, pos.name, pos.quantity, pos.avg_price, pos.max_price
                );
            }
        }
        Err(e) => eprintln!("positions unavailable: {e}"),
    }
    if let Ok(Some(snapshot)) = db.latest_account_snapshot() {
        println!(
            "account: cash {} / equity {} ({:+.2}%)",
            snapshot.cash, snapshot.total_equity, snapshot.cumulative_return_pct
        );
    }
    if let Ok(Some(min_score)) = db.config_get("min_score") {
        println!("min score: {min_score}");
    }
    match db.decisions_on(Utc::now().date_naive()) {
        Ok(decisions) => println!("decisions today: {}", decisions.len()),
        Err(e) => eprintln!("decision log unavailable: {e}"),
    }
    EXIT_OK
}

/// Sync the broker balance into the store and verify a clean slate.
async fn run_init(config: &Config) -> i32 {
    match init_inner(config).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!(error = %e, "initialization failed");
            EXIT_INIT_FAILURE
        }
    }
}

async fn init_inner(config: &Config) -> Result<()> {
    let db = Db::open(&config.database_path).context("open store")?;
    let broker = KisRest::new(config).context("broker client")?;

    let balance = broker.combined_balance().await.context("combined balance")?;

    let open = broker.open_orders().await.context("open orders")?;
    if !open.is_empty() {
        anyhow::bail!(
            "{} open orders at the broker; cancel them before initializing",
            open.len()
        );
    }

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
    db.sync_positions(&holdings).context("position sync")?;
    db.insert_account_snapshot(&horangi_backend::models::AccountSnapshot {
        ts: now,
        cash: balance.summary.cash,
        total_equity: balance.summary.total_equity,
        realized_pnl_today: balance.summary.realized_pnl_today,
        cumulative_return_pct: balance.summary.cumulative_return_pct,
    })
    .context("account snapshot")?;

    println!("initialized from broker:");
    println!(
        "  cash {} / orderable {} / equity {}",
        balance.summary.cash, balance.summary.orderable_cash, balance.summary.total_equity
    );
    println!("  holdings: {}", holdings.len());
    for pos in &holdings {
        println!("    {} {} x{} @ {}", pos.symbol, pos.name, pos.quantity, pos.avg_price);
    }
    println!("  open orders: none");
    Ok(())
}
